//! # Circuit Breaker
//!
//! Three-state breaker guarding calls to a flaky dependency.
//!
//! ## State Transitions
//!
//! ```text
//! ┌─────────┐
//! │ CLOSED  │ ◄──────────┐
//! └────┬────┘            │
//!      │                 │
//!      │ Failures >= Threshold
//!      │                 │
//!      ▼                 │
//! ┌─────────┐    Successes >= Threshold
//! │  OPEN   │            │
//! └────┬────┘            │
//!      │                 │
//!      │ After Timeout   │
//!      │                 │
//!      ▼                 │
//! ┌──────────┐           │
//! │HALF-OPEN │───────────┘
//! └──────────┘
//! ```
//!
//! Successes in CLOSED do not reset the failure count; only a completed
//! recovery (HALF-OPEN → CLOSED) or an explicit `reset()` does. A failure in
//! HALF-OPEN reopens the circuit with the counters preserved.

use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{RelayError, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests fail immediately
    Open,
    /// Testing whether the dependency recovered
    HalfOpen,
}

/// Inspectable breaker status.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the circuit opened, if it is open
    pub open_for_ms: Option<u64>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for a named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.read().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let state = self.state.read();
        CircuitBreakerStatus {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            open_for_ms: state
                .opened_at
                .filter(|_| state.state == CircuitState::Open)
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Force CLOSED and zero every counter.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
        info!("Circuit breaker '{}' reset to CLOSED", self.name);
    }

    /// Execute a call through the breaker. When OPEN, the target is not
    /// invoked and the call fails with `CircuitOpen`.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.allow_request() {
            return Err(RelayError::CircuitOpen(format!(
                "Circuit breaker '{}' is OPEN",
                self.name
            )));
        }

        match f.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Like `call`, but when the circuit rejects the request the fallback
    /// supplies the result instead of an error. The target is still never
    /// invoked while OPEN.
    pub async fn call_with_fallback<F, FB, T>(&self, f: F, fallback: FB) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        if !self.allow_request() {
            return fallback();
        }

        match f.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Whether the next call may proceed; performs the OPEN → HALF-OPEN
    /// transition when the open timeout has elapsed.
    fn allow_request(&self) -> bool {
        let mut state = self.state.write();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    info!("Circuit breaker '{}' transitioning to HALF-OPEN", self.name);
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.write();
        match state.state {
            CircuitState::Closed => {
                // Sticky: the failure count survives successes.
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    info!("Circuit breaker '{}' transitioning to CLOSED", self.name);
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.write();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker '{}' OPEN after {} failures",
                        self.name, state.failure_count
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker '{}' reopening from HALF-OPEN",
                    self.name
                );
                state.failure_count += 1;
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(async { Err::<(), _>(RelayError::Network("down".into())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(async { Ok(42) }).await
    }

    #[tokio::test]
    async fn test_opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new("test", fast_config());

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejected without invoking the target.
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(RelayError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_success_does_not_reset_failures_in_closed() {
        let breaker = CircuitBreaker::new("test", fast_config());

        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().failure_count, 2);

        // One more failure still opens the circuit.
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().failure_count, 0);
        assert_eq!(breaker.status().success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_preserving_counters() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Permitted probe call fails: back to OPEN, counter bumped.
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().failure_count, 4);
    }

    #[tokio::test]
    async fn test_fallback_when_open() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let result = breaker
            .call_with_fallback(async { Ok(1) }, || Ok(99))
            .await
            .unwrap();
        assert_eq!(result, 99);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().failure_count, 0);
        succeed(&breaker).await.unwrap();
    }
}
