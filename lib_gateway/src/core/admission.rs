//! # Admission Controller
//!
//! Gates every (re)connection attempt and every pause decision on a fresh
//! memory reading. Purely advisory: it never touches the connection itself.
//!
//! Three thresholds with deliberate hysteresis between them:
//!
//! - `min_connect_bytes` / `min_contiguous_bytes` — both must hold to start
//!   a new attempt (the TLS handshake needs one large buffer, not just
//!   aggregate free space).
//! - `min_stay_connected_bytes` — strictly lower than the connect threshold;
//!   an established session is only force-dropped below it. The gap prevents
//!   connect/disconnect thrashing at a single boundary.
//! - `pause_disconnect_bytes` — between the two; a pause request only tears
//!   down an active session when free memory is below this.
//!
//! The numeric defaults mirror the firmware's empirically tuned values and
//! are configuration, not constants: they were never derived for any other
//! memory profile.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::memory::MemoryReading;

/// Memory thresholds and low-memory escalation tuning.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Free bytes required before a connection attempt is admitted.
    pub min_connect_bytes: u64,
    /// Largest contiguous block required before an attempt is admitted.
    pub min_contiguous_bytes: u64,
    /// Below this an established session is force-dropped.
    pub min_stay_connected_bytes: u64,
    /// Below this a pause request is allowed to drop an active session.
    pub pause_disconnect_bytes: u64,
    /// How long memory must be continuously insufficient before retries
    /// escalate to the slow polling rate.
    pub low_memory_window: Duration,
    /// The slow polling rate used after the window elapses.
    pub slow_poll_delay: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_connect_bytes: 40_000,
            min_contiguous_bytes: 16_384,
            min_stay_connected_bytes: 28_000,
            pause_disconnect_bytes: 35_000,
            low_memory_window: Duration::from_secs(300),
            slow_poll_delay: Duration::from_secs(60),
        }
    }
}

/// Advisory gate consulted by the connection state machine.
pub struct AdmissionController {
    config: AdmissionConfig,
    /// When memory first became insufficient, if it currently is.
    low_memory_since: Mutex<Option<Instant>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            low_memory_since: Mutex::new(None),
        }
    }

    /// True when a new connection attempt is admitted.
    pub fn can_attempt_connect(&self, reading: &MemoryReading) -> bool {
        reading.free_bytes >= self.config.min_connect_bytes
            && reading.largest_block >= self.config.min_contiguous_bytes
    }

    /// True when an established session must be dropped immediately.
    pub fn should_force_disconnect(&self, reading: &MemoryReading) -> bool {
        reading.free_bytes < self.config.min_stay_connected_bytes
    }

    /// True when a pause request is allowed to drop an active session.
    pub fn should_pause_disconnect(&self, reading: &MemoryReading) -> bool {
        reading.free_bytes < self.config.pause_disconnect_bytes
    }

    /// Tracks how long memory has been continuously insufficient.
    ///
    /// Returns the slow polling delay once the configured window has elapsed
    /// without a single admissible reading, so the state machine stops
    /// re-probing memory that is unlikely to have recovered quickly.
    pub fn poll_delay_escalation(&self, reading: &MemoryReading) -> Option<Duration> {
        let mut since = self.low_memory_since.lock().unwrap();
        if self.can_attempt_connect(reading) {
            *since = None;
            return None;
        }
        let started = *since.get_or_insert_with(Instant::now);
        if started.elapsed() >= self.config.low_memory_window {
            Some(self.config.slow_poll_delay)
        } else {
            None
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(free: u64, largest: u64) -> MemoryReading {
        MemoryReading {
            free_bytes: free,
            largest_block: largest,
        }
    }

    #[test]
    fn connect_requires_both_thresholds() {
        let ctl = AdmissionController::new(AdmissionConfig::default());
        let cfg = ctl.config().clone();

        assert!(ctl.can_attempt_connect(&reading(cfg.min_connect_bytes, cfg.min_contiguous_bytes)));
        assert!(!ctl.can_attempt_connect(&reading(
            cfg.min_connect_bytes - 1,
            cfg.min_contiguous_bytes
        )));
        // Plenty of aggregate free space but a fragmented pool is rejected.
        assert!(!ctl.can_attempt_connect(&reading(
            cfg.min_connect_bytes * 2,
            cfg.min_contiguous_bytes - 1
        )));
    }

    #[test]
    fn stay_connected_has_hysteresis() {
        let ctl = AdmissionController::new(AdmissionConfig::default());
        let cfg = ctl.config().clone();

        // Below the connect threshold but above the stay threshold: the
        // session survives even though a fresh attempt would be refused.
        let between = reading(cfg.min_connect_bytes - 1, cfg.min_contiguous_bytes);
        assert!(!ctl.can_attempt_connect(&between));
        assert!(!ctl.should_force_disconnect(&between));

        assert!(ctl.should_force_disconnect(&reading(cfg.min_stay_connected_bytes - 1, 0)));
        assert!(!ctl.should_force_disconnect(&reading(cfg.min_stay_connected_bytes, 0)));
    }

    #[test]
    fn pause_threshold_sits_between() {
        let ctl = AdmissionController::new(AdmissionConfig::default());
        let cfg = ctl.config().clone();

        assert!(ctl.should_pause_disconnect(&reading(cfg.pause_disconnect_bytes - 1, 0)));
        assert!(!ctl.should_pause_disconnect(&reading(cfg.pause_disconnect_bytes, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_low_memory_escalates_to_slow_polling() {
        let config = AdmissionConfig {
            low_memory_window: Duration::from_secs(300),
            slow_poll_delay: Duration::from_secs(60),
            ..AdmissionConfig::default()
        };
        let ctl = AdmissionController::new(config);
        let starved = reading(1_000, 1_000);

        assert_eq!(ctl.poll_delay_escalation(&starved), None);
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(ctl.poll_delay_escalation(&starved), None);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            ctl.poll_delay_escalation(&starved),
            Some(Duration::from_secs(60))
        );

        // One admissible reading resets the window.
        let ample = reading(100_000, 100_000);
        assert_eq!(ctl.poll_delay_escalation(&ample), None);
        assert_eq!(ctl.poll_delay_escalation(&starved), None);
    }
}
