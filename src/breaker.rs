//! Circuit breaker guarding calls to external dependencies (LLM API, remote
//! stores). Closed/open/half-open state machine with manual overrides.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerConfig;
use crate::error::BreakerError;

/// Circuit state per protected dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of a breaker-guarded call.
#[derive(Debug)]
pub enum GuardedError<E> {
    /// The circuit rejected the call without invoking the dependency.
    Open(BreakerError),
    /// The dependency was invoked and failed.
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    circuit: CircuitState,
    consecutive_failures: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    /// A half-open circuit admits exactly one probe at a time.
    probe_in_flight: bool,
}

/// Breaker snapshot for health surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_for_ms: Option<u64>,
}

pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                window_start: Instant::now(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").circuit
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.circuit,
            consecutive_failures: inner.consecutive_failures,
            open_for_ms: inner.opened_at.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Trip the circuit open until `force_close` or a successful probe after
    /// the timeout. Operational override.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.circuit = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        tracing::warn!(dependency = %self.dependency, "circuit forced open");
    }

    /// Reset the circuit to closed and clear counters. Operational override.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.circuit = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.window_start = Instant::now();
        inner.opened_at = None;
        inner.probe_in_flight = false;
        tracing::info!(dependency = %self.dependency, "circuit forced closed");
    }

    /// Run `call` under the breaker.
    ///
    /// While open and before the timeout elapses, the wrapped function is
    /// invoked zero times and the call fails fast with [`GuardedError::Open`].
    pub async fn execute<T, E, Fut>(
        &self,
        call: impl FnOnce() -> Fut,
    ) -> Result<T, GuardedError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let probing = match self.admit() {
            Ok(probing) => probing,
            Err(err) => return Err(GuardedError::Open(err)),
        };

        let result = call().await;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(probing);
                Err(GuardedError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed; returns whether it is a half-open
    /// probe.
    fn admit(&self) -> Result<bool, BreakerError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.circuit {
            CircuitState::Closed => {
                if inner.window_start.elapsed() > self.config.window {
                    inner.window_start = Instant::now();
                    inner.consecutive_failures = 0;
                }
                Ok(false)
            }
            CircuitState::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                if opened.elapsed() >= self.config.timeout {
                    inner.circuit = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(dependency = %self.dependency, "circuit half-open, probing");
                    Ok(true)
                } else {
                    Err(BreakerError::Open {
                        dependency: self.dependency.clone(),
                        retry_in: self.config.timeout.saturating_sub(opened.elapsed()),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerError::Open {
                        dependency: self.dependency.clone(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.circuit != CircuitState::Closed {
            tracing::info!(dependency = %self.dependency, "circuit closed after successful probe");
        }
        inner.circuit = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.window_start = Instant::now();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, probing: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if probing || inner.circuit == CircuitState::HalfOpen {
            inner.circuit = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            tracing::warn!(dependency = %self.dependency, "probe failed, circuit re-opened");
            return;
        }

        if inner.window_start.elapsed() > self.config.window {
            inner.window_start = Instant::now();
            inner.consecutive_failures = 0;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.threshold {
            inner.circuit = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                dependency = %self.dependency,
                failures = inner.consecutive_failures,
                "failure threshold reached, circuit opened"
            );
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(threshold: u32, timeout: Duration) -> BreakerConfig {
        BreakerConfig {
            threshold,
            timeout,
            window: Duration::from_secs(60),
        }
    }

    async fn failing_call(counter: &AtomicU32) -> Result<(), &'static str> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err("boom")
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("llm", test_config(3, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = breaker.execute(|| failing_call(&calls)).await;
            assert!(matches!(result, Err(GuardedError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open + before timeout: zero invocations of the wrapped function.
        let result = breaker.execute(|| failing_call(&calls)).await;
        assert!(matches!(result, Err(GuardedError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("llm", test_config(1, Duration::from_millis(10)));
        let calls = AtomicU32::new(0);

        let _ = breaker.execute(|| failing_call(&calls)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let result: Result<u32, GuardedError<&'static str>> =
            breaker.execute(|| async { Ok(7) }).await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("llm", test_config(1, Duration::from_millis(10)));
        let calls = AtomicU32::new(0);

        let _ = breaker.execute(|| failing_call(&calls)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = breaker.execute(|| failing_call(&calls)).await;
        assert!(matches!(result, Err(GuardedError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let breaker = CircuitBreaker::new("llm", test_config(3, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);

        let _ = breaker.execute(|| failing_call(&calls)).await;
        let _ = breaker.execute(|| failing_call(&calls)).await;
        let ok: Result<(), GuardedError<&'static str>> =
            breaker.execute(|| async { Ok(()) }).await;
        assert!(ok.is_ok());

        // Two more failures stay under the threshold after the reset.
        let _ = breaker.execute(|| failing_call(&calls)).await;
        let _ = breaker.execute(|| failing_call(&calls)).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_controls_override_state() {
        let breaker = CircuitBreaker::new("llm", test_config(5, Duration::from_secs(30)));
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = breaker.execute(|| failing_call(&calls)).await;
        assert!(matches!(result, Err(GuardedError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
