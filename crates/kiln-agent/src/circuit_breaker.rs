//! Circuit breaker for provider calls
//!
//! Once repeated non-retryable failures pile up, further generation requests are
//! refused until a cool-down passes. This keeps a misconfigured key or a provider
//! outage from burning every repair attempt of every task.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests allowed
    Closed,
    /// Requests refused until the cool-down elapses
    Open,
    /// Cool-down elapsed; the next request decides
    HalfOpen,
}

/// Consecutive-failure circuit breaker
///
/// ```
/// use kiln_agent::CircuitBreaker;
///
/// let breaker = CircuitBreaker::new(2, 60);
/// breaker.record_failure();
/// breaker.record_failure();
/// assert!(!breaker.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    opened_at_ms: AtomicU64,
    threshold: u32,
    cool_down: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl CircuitBreaker {
    /// `threshold` consecutive failures open the circuit for `cool_down_secs`
    pub fn new(threshold: u32, cool_down_secs: u64) -> Self {
        Self {
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            threshold: threshold.max(1),
            cool_down: Duration::from_secs(cool_down_secs),
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.failures.load(Ordering::Relaxed) < self.threshold {
            return CircuitState::Closed;
        }
        if self.elapsed_ms() >= self.cool_down.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    fn elapsed_ms(&self) -> u64 {
        now_ms().saturating_sub(self.opened_at_ms.load(Ordering::Relaxed))
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.opened_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Time left before a request is allowed again (zero unless open)
    pub fn time_until_retry(&self) -> Duration {
        match self.state() {
            CircuitState::Open => {
                let remaining =
                    (self.cool_down.as_millis() as u64).saturating_sub(self.elapsed_ms());
                Duration::from_millis(remaining)
            }
            _ => Duration::ZERO,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.time_until_retry(), Duration::ZERO);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, 60);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert!(breaker.time_until_retry() <= Duration::from_secs(60));
    }

    #[test]
    fn test_success_closes() {
        let breaker = CircuitBreaker::new(2, 60);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cool_down() {
        let breaker = CircuitBreaker::new(1, 1);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(1100));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());
    }
}
