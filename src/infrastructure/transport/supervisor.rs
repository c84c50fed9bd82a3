//! Connection supervision for the broker link
//!
//! Tracks link state and hands out reconnect delays. The delay doubles on
//! every consecutive failure up to a cap; once the attempt budget is spent
//! the link goes [`LinkState::Degraded`] and stays there until someone calls
//! [`ConnectionSupervisor::reset`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Attempt budget exhausted; no further reconnects until reset
    Degraded,
}

pub struct ConnectionSupervisor {
    state: RwLock<LinkState>,
    attempts: AtomicU32,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_attempts: u32,
}

impl ConnectionSupervisor {
    pub fn new(initial_backoff: Duration, max_backoff: Duration, max_attempts: u32) -> Self {
        Self {
            state: RwLock::new(LinkState::Disconnected),
            attempts: AtomicU32::new(0),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> LinkState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_state(&self, state: LinkState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == LinkState::Degraded
    }

    /// Record an established connection: state goes Connected and the
    /// failure streak resets
    pub fn record_success(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(LinkState::Connected);
    }

    /// Record a failed connection attempt. Returns the delay to wait before
    /// the next attempt, or None when the budget is spent and the link has
    /// gone degraded.
    pub fn record_failure(&self) -> Option<Duration> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt + 1 >= self.max_attempts {
            self.set_state(LinkState::Degraded);
            return None;
        }
        self.set_state(LinkState::Disconnected);
        Some(self.backoff_for(attempt))
    }

    /// Delay before attempt `attempt + 1`: doubles each time, capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Clear a degraded link so the connect loop starts over
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(LinkState::Disconnected);
        tracing::info!("Broker link supervisor reset, reconnection re-enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(Duration::from_secs(5), Duration::from_secs(300), 10)
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let sup = supervisor();
        let delays: Vec<u64> = (0..8).map(|n| sup.backoff_for(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn test_backoff_never_decreases() {
        let sup = supervisor();
        let mut last = Duration::ZERO;
        for attempt in 0..64 {
            let delay = sup.backoff_for(attempt);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn test_budget_exhaustion_goes_degraded() {
        let sup = ConnectionSupervisor::new(Duration::from_secs(5), Duration::from_secs(300), 3);

        assert_eq!(sup.record_failure(), Some(Duration::from_secs(5)));
        assert_eq!(sup.record_failure(), Some(Duration::from_secs(10)));
        assert_eq!(sup.record_failure(), None);
        assert_eq!(sup.state(), LinkState::Degraded);

        // Degraded is sticky
        assert_eq!(sup.record_failure(), None);
        assert_eq!(sup.state(), LinkState::Degraded);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let sup = supervisor();
        sup.record_failure();
        sup.record_failure();
        sup.record_success();
        assert_eq!(sup.state(), LinkState::Connected);

        // The next failure starts over at the initial delay
        assert_eq!(sup.record_failure(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_reset_clears_degraded() {
        let sup = ConnectionSupervisor::new(Duration::from_secs(5), Duration::from_secs(300), 1);
        assert_eq!(sup.record_failure(), None);
        assert!(sup.is_degraded());

        sup.reset();
        assert_eq!(sup.state(), LinkState::Disconnected);
        assert_eq!(sup.record_failure(), None);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&LinkState::Connected).unwrap(),
            r#""connected""#
        );
        assert_eq!(
            serde_json::to_string(&LinkState::Degraded).unwrap(),
            r#""degraded""#
        );
    }
}
