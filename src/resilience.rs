use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{BreakerConfig, RetryConfig};
use crate::error::{GateError, Result};

/// Circuit breaker states. Transitions follow the state machine
/// CLOSED -> OPEN -> HALF_OPEN -> CLOSED and are never skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_admitted: u32,
}

/// Circuit breaker guarding one external dependency (the event bus).
///
/// Evaluated concurrently by many callers; the state machine lives
/// behind a mutex with short critical sections and no I/O inside.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_successes: 0,
                half_open_admitted: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Gate a call to the protected dependency. While OPEN, calls fail
    /// fast until the recovery window elapses, at which point the next
    /// caller moves the breaker to HALF_OPEN and is allowed through.
    /// HALF_OPEN admits at most `half_open_trials` calls; further
    /// callers fail fast until a trial outcome is recorded.
    pub fn allow(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_trials {
                    inner.half_open_admitted += 1;
                    Ok(())
                } else {
                    Err(GateError::CircuitOpen)
                }
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration() {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_admitted = 1;
                    tracing::info!("circuit breaker half-open, allowing trial calls");
                    Ok(())
                } else {
                    Err(GateError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_trials {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.half_open_admitted = 0;
                    tracing::info!("circuit breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Any trial failure reopens immediately
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_admitted = 0;
                tracing::warn!("circuit breaker reopened from half-open");
            }
            BreakerState::Open => {}
        }
    }
}

/// Decorrelated-jitter retry schedule.
///
/// `delay = random(base, min(max, previous * 3))`, seeded with
/// `previous = base`. Randomizing each delay relative to the previous
/// one avoids synchronized retry storms after a shared outage; plain
/// exponential backoff would reconnect every client on the same beat.
#[derive(Debug)]
pub struct RetrySchedule {
    config: RetryConfig,
    previous: Duration,
}

impl RetrySchedule {
    pub fn new(config: RetryConfig) -> Self {
        let previous = config.base_delay();
        Self { config, previous }
    }

    /// Next delay to wait before retrying. Always within [base, max].
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.base_delay();
        let max = self.config.max_delay();
        let ceiling = (self.previous * 3).min(max).max(base);
        let millis = if ceiling > base {
            rand::thread_rng().gen_range(base.as_millis() as u64..=ceiling.as_millis() as u64)
        } else {
            base.as_millis() as u64
        };
        self.previous = Duration::from_millis(millis);
        self.previous
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.previous = self.config.base_delay();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            open_secs: 0,
            half_open_trials: 1,
        })
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_success_closes() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);
        // open_secs = 0, so the recovery window has elapsed
        cb.allow().unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        cb.allow().unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_admits_at_most_the_trial_budget() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_secs: 0,
            half_open_trials: 2,
        });
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // First caller transitions to HALF_OPEN and takes one slot
        cb.allow().unwrap();
        cb.allow().unwrap();
        for _ in 0..10 {
            assert!(matches!(cb.allow(), Err(GateError::CircuitOpen)));
        }

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(matches!(cb.allow(), Err(GateError::CircuitOpen)));
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.allow().unwrap();
    }

    #[test]
    fn open_breaker_fails_fast() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_secs: 3600,
            half_open_trials: 1,
        });
        cb.record_failure();
        assert!(matches!(cb.allow(), Err(GateError::CircuitOpen)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 2000,
        };
        let mut sched = RetrySchedule::new(cfg.clone());
        for _ in 0..200 {
            let d = sched.next_delay();
            assert!(d >= cfg.base_delay(), "delay below base: {d:?}");
            assert!(d <= cfg.max_delay(), "delay above max: {d:?}");
        }
    }

    #[test]
    fn jitter_is_not_constant() {
        let cfg = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 60_000,
        };
        let mut sched = RetrySchedule::new(cfg);
        let delays: Vec<_> = (0..32).map(|_| sched.next_delay()).collect();
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first), "no jitter observed");
    }

    #[test]
    fn reset_returns_to_base_ceiling() {
        let cfg = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 60_000,
        };
        let mut sched = RetrySchedule::new(cfg);
        for _ in 0..10 {
            sched.next_delay();
        }
        sched.reset();
        // After reset the ceiling is base * 3
        let d = sched.next_delay();
        assert!(d <= Duration::from_millis(300));
    }
}
