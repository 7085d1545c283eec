//! Sliding-window rate limiting keyed by caller identity.
//!
//! Counters live in a pluggable backing store. When the store is unreachable
//! the limiter fails open: the request is allowed and a warning is logged,
//! availability wins over strict quota. Note that under partial store failure
//! the effective ceiling becomes the connection-pool depth, not the
//! configured rate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;

/// Count of events inside the current window.
#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    pub count: u64,
    /// Time until the oldest event in the window expires.
    pub reset_in: Duration,
}

/// The backing store failed; the limiter falls open.
#[derive(Debug, thiserror::Error)]
#[error("rate store unavailable: {0}")]
pub struct StoreUnavailable(pub String);

/// Any fast key-value store with atomic increment and expiry semantics.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Record one event for `key` and return the resulting window count.
    async fn incr(&self, key: &str, window: Duration) -> Result<WindowCount, StoreUnavailable>;

    /// Return the window count without recording an event.
    async fn peek(&self, key: &str, window: Duration) -> Result<WindowCount, StoreUnavailable>;
}

/// In-process store: per-key deque of event instants.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn window_count(events: &[Instant], window: Duration) -> WindowCount {
        let count = events.len() as u64;
        let reset_in = events
            .first()
            .map(|oldest| window.saturating_sub(oldest.elapsed()))
            .unwrap_or(Duration::ZERO);
        WindowCount { count, reset_in }
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn incr(&self, key: &str, window: Duration) -> Result<WindowCount, StoreUnavailable> {
        let mut windows = self.windows.lock().expect("rate store lock poisoned");
        let events = windows.entry(key.to_string()).or_default();
        let now = Instant::now();
        events.retain(|at| now.duration_since(*at) < window);
        events.push(now);
        Ok(Self::window_count(events, window))
    }

    async fn peek(&self, key: &str, window: Duration) -> Result<WindowCount, StoreUnavailable> {
        let mut windows = self.windows.lock().expect("rate store lock poisoned");
        let events = windows.entry(key.to_string()).or_default();
        let now = Instant::now();
        events.retain(|at| now.duration_since(*at) < window);
        Ok(Self::window_count(events, window))
    }
}

/// Decision returned to the caller.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after_ms: u64,
}

/// Key under which the all-callers policy is tracked.
const GLOBAL_KEY: &str = "__global__";

/// Share of the global budget any single identity may consume.
const IDENTITY_SHARE: f64 = 0.25;

pub struct RateLimiter {
    store: Box<dyn RateStore>,
    policy: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Box<dyn RateStore>, policy: RateLimitConfig) -> Self {
        Self { store, policy }
    }

    pub fn in_memory(policy: RateLimitConfig) -> Self {
        Self::new(Box::new(MemoryStore::new()), policy)
    }

    fn identity_max(&self) -> u64 {
        ((self.policy.max as f64 * IDENTITY_SHARE).floor() as u64).max(1)
    }

    /// Inspect the identity's budget without consuming it.
    pub async fn check(&self, identity: &str) -> RateDecision {
        let max = self.identity_max();
        match self.store.peek(identity, self.policy.window).await {
            Ok(count) => RateDecision {
                allowed: count.count < max,
                remaining: max.saturating_sub(count.count),
                reset_after_ms: count.reset_in.as_millis() as u64,
            },
            Err(e) => {
                tracing::warn!(identity, "rate store unavailable, failing open: {e}");
                RateDecision {
                    allowed: true,
                    remaining: max,
                    reset_after_ms: 0,
                }
            }
        }
    }

    /// Consume one unit against both the global and per-identity policies.
    pub async fn consume(&self, identity: &str) -> Result<RateDecision, RateLimitError> {
        let global = match self.store.incr(GLOBAL_KEY, self.policy.window).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("rate store unavailable, failing open: {e}");
                return Ok(RateDecision {
                    allowed: true,
                    remaining: self.identity_max(),
                    reset_after_ms: 0,
                });
            }
        };
        if global.count > self.policy.max {
            return Err(RateLimitError::Exceeded {
                key: "global".to_string(),
                reset_in: global.reset_in,
            });
        }

        let max = self.identity_max();
        let mine = match self.store.incr(identity, self.policy.window).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(identity, "rate store unavailable, failing open: {e}");
                return Ok(RateDecision {
                    allowed: true,
                    remaining: max,
                    reset_after_ms: 0,
                });
            }
        };
        if mine.count > max {
            return Err(RateLimitError::Exceeded {
                key: identity.to_string(),
                reset_in: mine.reset_in,
            });
        }

        Ok(RateDecision {
            allowed: true,
            remaining: max.saturating_sub(mine.count),
            reset_after_ms: mine.reset_in.as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.policy.window)
            .field("max", &self.policy.max)
            .finish()
    }
}
