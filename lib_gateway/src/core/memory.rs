//! # Shared Memory Budget
//!
//! The gateway shares a tight memory pool with every other subsystem on the
//! controller (web server buffers, state broadcasts, display). This module
//! provides the accounting side of that contest: an atomically maintained
//! byte budget that subsystems charge allocations against, and the probe
//! interface the admission controller samples before every decision.
//!
//! The probe is deliberately stateless from the caller's point of view: a
//! `MemoryReading` is taken fresh on every admission check and never cached,
//! because the reading *is* the truth the controller reasons about.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time view of the memory available to the gateway.
///
/// `largest_block` matters independently of `free_bytes`: the TLS handshake
/// needs one large contiguous buffer, and an aggregate-only check admits
/// connections that then fail mid-handshake on a fragmented pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    /// Total bytes currently unclaimed in the pool.
    pub free_bytes: u64,
    /// Largest single slab the pool can currently hand out.
    pub largest_block: u64,
}

/// Source of truth for admission decisions.
///
/// Implementations must be cheap: the connection task samples this once per
/// watchdog tick while connected and on every reconnect evaluation.
pub trait MemoryProbe: Send + Sync {
    /// Takes a fresh reading. Never cached by callers.
    fn read(&self) -> MemoryReading;
}

/// Atomically accounted byte budget shared between the gateway and the other
/// consumers of the same pool.
///
/// The budget itself never blocks or evicts; `charge` merely reports whether
/// the capacity was breached so the caller can take corrective action (drop
/// the message, defer the connection attempt).
pub struct MemoryBudget {
    /// The hard limit for all combined consumers, in bytes.
    capacity: u64,
    /// Bytes currently claimed. `Relaxed` ordering is sufficient: only the
    /// eventual consistency of the counter matters, not the ordering of
    /// surrounding operations.
    current_usage: AtomicU64,
    /// Largest contiguous slab the pool owner reports. Zero means untracked,
    /// in which case readings fall back to the free total.
    largest_block: AtomicU64,
}

impl MemoryBudget {
    /// Creates a budget with a fixed capacity in bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            current_usage: AtomicU64::new(0),
            largest_block: AtomicU64::new(0),
        }
    }

    /// Atomically records an allocation against the budget.
    ///
    /// Returns `false` if the new total exceeds the capacity, signaling that
    /// the caller must back out (release) rather than proceed.
    pub fn charge(&self, bytes: u64) -> bool {
        let prev = self.current_usage.fetch_add(bytes, Ordering::Relaxed);
        prev + bytes <= self.capacity
    }

    /// Atomically releases a prior charge.
    pub fn release(&self, bytes: u64) {
        self.current_usage.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Updates the largest-contiguous-block figure reported by the pool
    /// owner. Pass zero to fall back to tracking the free total.
    pub fn set_largest_block(&self, bytes: u64) {
        self.largest_block.store(bytes, Ordering::Relaxed);
    }

    /// Current total claimed bytes.
    pub fn current_usage(&self) -> u64 {
        self.current_usage.load(Ordering::Relaxed)
    }

    /// The configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl MemoryProbe for MemoryBudget {
    fn read(&self) -> MemoryReading {
        let free = self.capacity.saturating_sub(self.current_usage());
        let largest = match self.largest_block.load(Ordering::Relaxed) {
            0 => free,
            tracked => tracked.min(free),
        };
        MemoryReading {
            free_bytes: free,
            largest_block: largest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_reports_breach() {
        let budget = MemoryBudget::new(100);
        assert!(budget.charge(60));
        assert!(budget.charge(40));
        assert!(!budget.charge(1));
        budget.release(41);
        assert_eq!(budget.current_usage(), 60);
        assert!(budget.charge(40));
    }

    #[test]
    fn reading_tracks_free_and_largest() {
        let budget = MemoryBudget::new(50_000);
        budget.charge(10_000);
        let reading = budget.read();
        assert_eq!(reading.free_bytes, 40_000);
        assert_eq!(reading.largest_block, 40_000);

        // An explicitly tracked block figure is clamped to the free total.
        budget.set_largest_block(16_384);
        assert_eq!(budget.read().largest_block, 16_384);
        budget.charge(38_000);
        assert_eq!(budget.read().largest_block, 2_000);
    }

    #[test]
    fn reading_saturates_on_overcommit() {
        let budget = MemoryBudget::new(100);
        budget.charge(150);
        let reading = budget.read();
        assert_eq!(reading.free_bytes, 0);
        assert_eq!(reading.largest_block, 0);
    }
}
