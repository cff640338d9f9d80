//! # Outbound Message Queue
//!
//! A bounded FIFO of pre-serialized messages, drained only by the connection
//! task while a session is live. Enqueue never blocks: when the connection is
//! down, the payload is oversized, or the queue is full, the message is
//! dropped with a warning and the caller gets `false` back.
//!
//! The queue owns each payload from the moment `enqueue` copies it in until
//! it is drained for transmission or cleared, and accounts those bytes
//! against a dedicated budget so a burst of sends cannot eat into the pool
//! the admission controller watches.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::core::memory::MemoryBudget;

/// Capacity and batching limits for the outbound queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fixed slot count; the queue never grows past this.
    pub capacity: usize,
    /// Per-message size ceiling in bytes.
    pub max_message_bytes: usize,
    /// Messages handed to the transport per drain pass, so a burst cannot
    /// monopolize the connection task.
    pub drain_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            max_message_bytes: 16 * 1024,
            drain_batch: 5,
        }
    }
}

/// A message owned by the queue. Opaque bytes, tagged text or binary; the
/// queue never interprets payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub payload: Vec<u8>,
    pub binary: bool,
}

/// Bounded FIFO with drop-on-full semantics.
pub struct OutboundQueue {
    config: QueueConfig,
    /// Dedicated accounting pool for queued bytes, distinct from the budget
    /// the admission controller samples.
    budget: Option<Arc<MemoryBudget>>,
    inner: Mutex<VecDeque<PendingMessage>>,
}

impl OutboundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            budget: None,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Attaches a byte budget that queued payloads are charged against.
    pub fn with_budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Copies a payload into the queue. Returns `false` if it was dropped.
    pub fn enqueue(&self, payload: Vec<u8>, binary: bool) -> bool {
        let len = payload.len();
        if len == 0 {
            log::warn!("[cloud] dropping empty message");
            return false;
        }
        if len > self.config.max_message_bytes {
            log::warn!("[cloud] message too large ({} bytes), dropping", len);
            return false;
        }

        if let Some(budget) = &self.budget {
            if !budget.charge(len as u64) {
                budget.release(len as u64);
                log::warn!("[cloud] send buffer pool exhausted, dropping message");
                return false;
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= self.config.capacity {
            drop(inner);
            if let Some(budget) = &self.budget {
                budget.release(len as u64);
            }
            log::warn!("[cloud] send queue full, dropping message");
            return false;
        }
        inner.push_back(PendingMessage { payload, binary });
        true
    }

    /// Pops up to `n` messages in FIFO order, releasing their budget charge.
    /// Ownership passes to the caller, which must transmit or discard them.
    pub fn drain_up_to(&self, n: usize) -> Vec<PendingMessage> {
        let mut inner = self.inner.lock().unwrap();
        let take = n.min(inner.len());
        let drained: Vec<PendingMessage> = inner.drain(..take).collect();
        drop(inner);
        if let Some(budget) = &self.budget {
            for msg in &drained {
                budget.release(msg.payload.len() as u64);
            }
        }
        drained
    }

    /// Discards everything. Used on disconnect and `end()`: messages queued
    /// before a drop are lost, never re-queued across a reconnect.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped: Vec<PendingMessage> = inner.drain(..).collect();
        drop(inner);
        if let Some(budget) = &self.budget {
            for msg in &dropped {
                budget.release(msg.payload.len() as u64);
            }
        }
        if !dropped.is_empty() {
            log::debug!("[cloud] cleared {} queued messages", dropped.len());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots remaining before enqueue starts dropping.
    pub fn space_left(&self) -> usize {
        self.config.capacity.saturating_sub(self.len())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_never_grows_past_capacity() {
        let queue = OutboundQueue::new(QueueConfig {
            capacity: 16,
            ..QueueConfig::default()
        });

        for i in 0..16 {
            assert!(queue.enqueue(format!("msg-{i}").into_bytes(), false));
        }
        // The 17th and every later enqueue drops without touching contents.
        for _ in 0..4 {
            assert!(!queue.enqueue(b"overflow".to_vec(), false));
        }
        assert_eq!(queue.len(), 16);
        assert_eq!(queue.drain_up_to(1)[0].payload, b"msg-0");
    }

    #[test]
    fn drains_in_fifo_order_and_batches() {
        let queue = OutboundQueue::new(QueueConfig::default());
        for label in ["a", "b", "c"] {
            assert!(queue.enqueue(label.as_bytes().to_vec(), false));
        }

        let first = queue.drain_up_to(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload, b"a");
        assert_eq!(first[1].payload, b"b");

        let rest = queue.drain_up_to(5);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, b"c");
        assert!(queue.is_empty());
    }

    #[test]
    fn oversized_and_empty_payloads_are_dropped() {
        let queue = OutboundQueue::new(QueueConfig {
            max_message_bytes: 8,
            ..QueueConfig::default()
        });
        assert!(!queue.enqueue(vec![0u8; 9], true));
        assert!(!queue.enqueue(Vec::new(), false));
        assert!(queue.enqueue(vec![0u8; 8], true));
    }

    #[test]
    fn budget_is_charged_and_released_exactly_once() {
        let budget = Arc::new(MemoryBudget::new(1024));
        let queue = OutboundQueue::new(QueueConfig::default()).with_budget(budget.clone());

        assert!(queue.enqueue(vec![0u8; 100], false));
        assert!(queue.enqueue(vec![0u8; 200], true));
        assert_eq!(budget.current_usage(), 300);

        queue.drain_up_to(1);
        assert_eq!(budget.current_usage(), 200);

        queue.clear();
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn exhausted_budget_rejects_before_capacity() {
        let budget = Arc::new(MemoryBudget::new(150));
        let queue = OutboundQueue::new(QueueConfig::default()).with_budget(budget.clone());

        assert!(queue.enqueue(vec![0u8; 100], false));
        assert!(!queue.enqueue(vec![0u8; 100], false));
        // The failed charge was backed out.
        assert_eq!(budget.current_usage(), 100);
        assert_eq!(queue.len(), 1);
    }
}
