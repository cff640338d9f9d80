//! # Reconnect Backoff and Failure Accounting
//!
//! One mutable delay is the sole timing input to "is it time to retry".
//! Ordinary transport failures double it up to a cap; registration failures
//! and low-memory escalation pin it to their own fixed rates; a clean
//! session resets it to the base.
//!
//! Authentication failures (the relay accepted the transport, then dropped
//! the session within the grace window) keep their own counter. It is reset
//! only by a session that outlives the grace window, never by a reconnect
//! attempt, so a persistent key mismatch cannot masquerade as transient
//! noise. Within the cap each failure rotates the device key; at the cap the
//! machine enters a long cooldown that requires manual re-pairing to clear.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Retry pacing and auth-recovery limits.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after a clean success; the floor of the escalation ladder.
    pub base_delay: Duration,
    /// Ceiling for doubled delays.
    pub max_delay: Duration,
    /// Fixed delay after a registration failure, which usually means a
    /// server-side or DNS problem rather than a transient link drop.
    pub registration_retry_delay: Duration,
    /// Short delay after a key rotation within the auth-failure cap.
    pub auth_retry_delay: Duration,
    /// Long cooldown once the cap is exhausted.
    pub auth_cooldown: Duration,
    /// Key rotations attempted before giving up.
    pub auth_failure_cap: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            registration_retry_delay: Duration::from_secs(30),
            auth_retry_delay: Duration::from_secs(10),
            auth_cooldown: Duration::from_secs(300),
            auth_failure_cap: 3,
        }
    }
}

/// Outcome of recording one more accepted-then-dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Rotate the device key and retry; `attempt` is 1-based.
    Rotate { attempt: u32 },
    /// The cap is exhausted; stay in cooldown until it elapses or
    /// credentials are externally reset.
    CoolingDown,
}

struct DelayState {
    delay: Duration,
    last_attempt: Option<Instant>,
}

/// Shared failure counters plus the single reconnect delay.
pub struct Backoff {
    config: BackoffConfig,
    state: Mutex<DelayState>,
    failures: AtomicU32,
    auth_failures: AtomicU32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let base = config.base_delay;
        Self {
            config,
            state: Mutex::new(DelayState {
                delay: base,
                last_attempt: None,
            }),
            failures: AtomicU32::new(0),
            auth_failures: AtomicU32::new(0),
        }
    }

    /// Whether the current delay has elapsed since the last attempt.
    pub fn ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.last_attempt {
            Some(at) => at.elapsed() >= state.delay,
            None => true,
        }
    }

    /// Stamps "an attempt happened now"; the next `ready()` waits out the
    /// current delay from this point.
    pub fn mark_attempt(&self) {
        self.state.lock().unwrap().last_attempt = Some(Instant::now());
    }

    /// Doubles the delay up to the cap and counts a general failure.
    pub fn escalate(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.delay = (state.delay * 2).min(self.config.max_delay);
    }

    /// Counts a general failure without touching the delay. Used by failure
    /// classes that pin their own fixed rate via [`set_delay`].
    ///
    /// [`set_delay`]: Backoff::set_delay
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Pins the delay to a class-specific rate (registration retry, slow
    /// polling under sustained low memory).
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn current_delay(&self) -> Duration {
        self.state.lock().unwrap().delay
    }

    /// Clean success: delay back to base, general failures cleared. The auth
    /// counter is deliberately left alone (see module docs).
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.delay = self.config.base_delay;
    }

    /// Clears the wait stamp so the next evaluation may attempt immediately.
    /// Used by `resume()` to avoid waiting out a stale backoff.
    pub fn clear_wait(&self) {
        self.state.lock().unwrap().last_attempt = None;
    }

    /// Records one accepted-then-dropped connection and decides recovery.
    ///
    /// Failures up to the cap each get a key rotation; the final rotation is
    /// paired with the long cooldown so the rotated key is only re-tried
    /// after memory of the failure streak has faded. Past the cap, nothing
    /// but the cooldown (or an external credential reset) applies.
    pub fn record_auth_failure(&self) -> AuthDecision {
        let attempt = self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let cap = self.config.auth_failure_cap;
        if attempt < cap {
            self.set_delay(self.config.auth_retry_delay);
            AuthDecision::Rotate { attempt }
        } else if attempt == cap {
            self.set_delay(self.config.auth_cooldown);
            AuthDecision::Rotate { attempt }
        } else {
            self.set_delay(self.config.auth_cooldown);
            AuthDecision::CoolingDown
        }
    }

    /// The session outlived the auth grace window: the credentials work.
    pub fn reset_auth(&self) {
        self.auth_failures.store(0, Ordering::Relaxed);
    }

    /// External credential reset (manual re-pairing) clears the cooldown.
    pub fn reset_auth_and_delay(&self) {
        self.reset_auth();
        self.reset();
        self.clear_wait();
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_doubles_to_cap_and_resets_on_success() {
        let backoff = Backoff::new(BackoffConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            ..BackoffConfig::default()
        });

        for _ in 0..10 {
            backoff.escalate();
        }
        assert_eq!(backoff.current_delay(), Duration::from_secs(120));
        assert_eq!(backoff.failures(), 10);

        backoff.reset();
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
        assert_eq!(backoff.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_waits_out_the_delay() {
        let backoff = Backoff::new(BackoffConfig::default());
        assert!(backoff.ready());

        backoff.mark_attempt();
        assert!(!backoff.ready());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(backoff.ready());

        backoff.mark_attempt();
        backoff.clear_wait();
        assert!(backoff.ready());
    }

    #[test]
    fn auth_cap_rotates_exactly_n_times_then_cools_down() {
        let backoff = Backoff::new(BackoffConfig {
            auth_failure_cap: 3,
            auth_retry_delay: Duration::from_secs(10),
            auth_cooldown: Duration::from_secs(300),
            ..BackoffConfig::default()
        });

        assert_eq!(
            backoff.record_auth_failure(),
            AuthDecision::Rotate { attempt: 1 }
        );
        assert_eq!(backoff.current_delay(), Duration::from_secs(10));
        assert_eq!(
            backoff.record_auth_failure(),
            AuthDecision::Rotate { attempt: 2 }
        );
        // The final in-cap rotation is paired with the long cooldown.
        assert_eq!(
            backoff.record_auth_failure(),
            AuthDecision::Rotate { attempt: 3 }
        );
        assert_eq!(backoff.current_delay(), Duration::from_secs(300));

        assert_eq!(backoff.record_auth_failure(), AuthDecision::CoolingDown);
        assert_eq!(backoff.auth_failures(), 4);

        backoff.reset_auth_and_delay();
        assert_eq!(backoff.auth_failures(), 0);
        assert!(backoff.ready());
    }

    #[test]
    fn success_reset_leaves_auth_counter_alone() {
        let backoff = Backoff::new(BackoffConfig::default());
        backoff.record_auth_failure();
        backoff.reset();
        assert_eq!(backoff.auth_failures(), 1);
        backoff.reset_auth();
        assert_eq!(backoff.auth_failures(), 0);
    }
}
