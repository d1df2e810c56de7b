//! Per-phase circuit breaker
//!
//! Counts consecutive unhealthy cycles of an async phase. Once the count
//! reaches the threshold the breaker opens and the phase stops queuing work.
//! After the cooldown (measured from the last failure) the next `is_open`
//! check moves it to half-open, letting one cycle probe: a healthy cycle
//! closes it, an unhealthy one reopens it.

use cadenza_common::events::{CircuitState, EnrichmentPhase};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// A state change caused by one breaker call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub failure_count: u32,
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub phase: EnrichmentPhase,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    phase: EnrichmentPhase,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(phase: EnrichmentPhase, threshold: u32, cooldown: Duration) -> Self {
        Self {
            phase,
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> EnrichmentPhase {
        self.phase
    }

    /// True while open; an expired cooldown moves the breaker to half-open
    pub fn is_open(&self) -> bool {
        self.check().0
    }

    /// `is_open`, also reporting the half-open transition if it happened
    pub fn check(&self) -> (bool, Option<StateChange>) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return (false, None);
        }

        let cooled = inner
            .last_failure
            .map(|at| at.elapsed() >= self.cooldown)
            .unwrap_or(true);
        if !cooled {
            return (true, None);
        }

        inner.state = CircuitState::HalfOpen;
        let change = StateChange {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
            failure_count: inner.failure_count,
        };
        (false, Some(change))
    }

    pub fn record_success(&self) -> Option<StateChange> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.last_failure = None;
                inner.last_failure_at = None;
                Some(StateChange {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                    failure_count: 0,
                })
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&self) -> Option<StateChange> {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        let from = inner.state;
        let open = match from {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.threshold,
            CircuitState::Open => false,
        };
        if !open {
            return None;
        }

        inner.state = CircuitState::Open;
        Some(StateChange {
            from,
            to: CircuitState::Open,
            failure_count: inner.failure_count,
        })
    }

    /// Current state without triggering the half-open transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            phase: self.phase,
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
            last_failure_at: inner.last_failure_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            EnrichmentPhase::AudioAnalysis,
            threshold,
            Duration::from_millis(cooldown_ms),
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, 60_000);
        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.record_failure(), None);
        assert!(!cb.is_open());

        let change = cb.record_failure().unwrap();
        assert_eq!(change.from, CircuitState::Closed);
        assert_eq!(change.to, CircuitState::Open);
        assert_eq!(change.failure_count, 3);
        assert!(cb.is_open());
    }

    #[test]
    fn test_success_resets_closed_counter() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.record_success(), None);
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[test]
    fn test_cooldown_moves_to_half_open_then_success_closes() {
        let cb = breaker(1, 20);
        cb.record_failure();
        assert!(cb.is_open());

        std::thread::sleep(Duration::from_millis(30));
        let (open, change) = cb.check();
        assert!(!open);
        assert_eq!(change.map(|c| c.to), Some(CircuitState::HalfOpen));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let change = cb.record_success().unwrap();
        assert_eq!(change.to, CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.snapshot().last_failure_at, None);
        assert!(cb.lock().last_failure.is_none());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(5, 20);
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cb.is_open());

        let change = cb.record_failure().unwrap();
        assert_eq!(change.from, CircuitState::HalfOpen);
        assert_eq!(change.to, CircuitState::Open);
        assert_eq!(change.failure_count, 6);
        assert!(cb.is_open());
    }

    #[test]
    fn test_failure_while_open_extends_cooldown() {
        let cb = breaker(1, 50);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.record_failure(), None);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.is_open(), "cooldown restarts at the latest failure");
    }

    #[test]
    fn test_success_while_open_is_ignored() {
        let cb = breaker(1, 60_000);
        cb.record_failure();
        assert_eq!(cb.record_success(), None);
        assert!(cb.is_open());
    }
}
