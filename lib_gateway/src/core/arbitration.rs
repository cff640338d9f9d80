//! # Local-Activity Arbitration
//!
//! The local web UI and the relay connection compete for the same scarce
//! buffers. This policy translates "a local client is active" signals into a
//! timed pause window the state machine consults: the user in front of the
//! machine wins under memory pressure, but relay connectivity is not
//! sacrificed when there is room for both.
//!
//! `pause()` is called on every local client connect and on every inbound
//! local message, continuously extending the window while the user is
//! active. `resume()` clears it when the last local client disconnects.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Timed pause window extended by local activity.
pub struct ArbitrationPolicy {
    window: Duration,
    paused_until: Mutex<Option<Instant>>,
}

impl ArbitrationPolicy {
    /// `window` is how far each `pause()` call extends the pause from now.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            paused_until: Mutex::new(None),
        }
    }

    /// Extends the pause window to `now + window`.
    pub fn pause(&self) {
        let until = Instant::now() + self.window;
        let mut paused = self.paused_until.lock().unwrap();
        match *paused {
            Some(current) if current > Instant::now() => {
                log::debug!("[cloud] extended pause for local activity");
            }
            _ => {
                log::info!(
                    "[cloud] pausing for local activity ({}s window)",
                    self.window.as_secs()
                );
            }
        }
        *paused = Some(until);
    }

    /// Clears the window immediately. Returns true if a pause was active,
    /// so the caller can also reset its reconnect timer for a near-immediate
    /// reconnection instead of waiting out a stale backoff.
    pub fn resume(&self) -> bool {
        let mut paused = self.paused_until.lock().unwrap();
        let was_paused = paused.take().is_some();
        if was_paused {
            log::info!("[cloud] resuming (local client disconnected)");
        }
        was_paused
    }

    /// Whether the pause window currently covers now. A soft signal: the
    /// state machine vetoes new attempts on it, but only drops an active
    /// session when memory is additionally tight.
    pub fn is_paused(&self) -> bool {
        self.paused_until
            .lock()
            .unwrap()
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pause_extends_from_now() {
        let policy = ArbitrationPolicy::new(Duration::from_secs(30));
        assert!(!policy.is_paused());

        policy.pause();
        assert!(policy.is_paused());

        tokio::time::advance(Duration::from_secs(20)).await;
        // Activity keeps sliding the window forward.
        policy.pause();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(policy.is_paused());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!policy.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_clears_immediately() {
        let policy = ArbitrationPolicy::new(Duration::from_secs(30));
        policy.pause();
        assert!(policy.resume());
        assert!(!policy.is_paused());
        // Resuming while not paused reports nothing to do.
        assert!(!policy.resume());
    }
}
