//! Circuit breaker: prevents calls to a failing external target by
//! rejecting them locally until the target recovers (§4.4).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub consecutive_failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub window: Duration,
    pub min_samples_for_rate: usize,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(60),
            min_samples_for_rate: 10,
            base_cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    samples: VecDeque<(Instant, bool)>, // (at, was_success)
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    half_open_probe_in_flight: bool,
}

/// One breaker per external target identity (a broker, a custodian).
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let base_cooldown = config.base_cooldown;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                samples: VecDeque::new(),
                opened_at: None,
                current_cooldown: base_cooldown,
                half_open_probe_in_flight: false,
            }),
        }
    }

    /// Returns true when a call should be allowed through. In HALF_OPEN,
    /// only a single probe call is admitted at a time.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= inner.current_cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probe_in_flight = true;
                    info!(breaker = %self.name, "circuit entering half-open probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    false
                } else {
                    inner.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        let now = Instant::now();
        inner.samples.push_back((now, true));
        self.trim_window(&mut inner);

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.current_cooldown = self.config.base_cooldown;
                inner.half_open_probe_in_flight = false;
                inner.opened_at = None;
                info!(breaker = %self.name, "circuit closed after successful probe");
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let now = Instant::now();
        inner.samples.push_back((now, false));
        self.trim_window(&mut inner);

        let rate_breach = {
            let total = inner.samples.len();
            if total >= self.config.min_samples_for_rate {
                let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
                (failures as f64 / total as f64) >= self.config.failure_rate_threshold
            } else {
                false
            }
        };

        match inner.state {
            BreakerState::HalfOpen => {
                self.trip(&mut inner, true);
            }
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.consecutive_failure_threshold
                    || rate_breach
                {
                    self.trip(&mut inner, false);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner, doubling: bool) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_probe_in_flight = false;
        if doubling {
            let doubled = inner.current_cooldown * 2;
            inner.current_cooldown = doubled.min(self.config.max_cooldown);
        }
        warn!(breaker = %self.name, cooldown_secs = inner.current_cooldown.as_secs(), "circuit opened");
    }

    fn trim_window(&self, inner: &mut Inner) {
        let cutoff = Instant::now() - self.config.window;
        while let Some((at, _)) = inner.samples.front() {
            if *at < cutoff {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

/// Registry of breakers keyed by external target identity.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new(
            "test-broker",
            BreakerConfig {
                consecutive_failure_threshold: 3,
                ..Default::default()
            },
        );
        assert!(cb.allow_request());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let cb = CircuitBreaker::new(
            "test-broker",
            BreakerConfig {
                consecutive_failure_threshold: 1,
                base_cooldown: Duration::from_millis(1),
                ..Default::default()
            },
        );
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_doubles_cooldown() {
        let cb = CircuitBreaker::new(
            "test-broker",
            BreakerConfig {
                consecutive_failure_threshold: 1,
                base_cooldown: Duration::from_millis(1),
                max_cooldown: Duration::from_secs(10),
                ..Default::default()
            },
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        let cooldown = cb.inner.lock().current_cooldown;
        assert!(cooldown > Duration::from_millis(1));
    }
}
