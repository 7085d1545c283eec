//! Correlation ids, latency tracking, and health aggregation.
//!
//! Every pipeline invocation gets a correlation id that is propagated through
//! component calls as a tracing span field and into the audit record. Latency
//! and outcome counters are exported through a prometheus registry owned by
//! this struct (no process-wide registry), rendered in text exposition format
//! for an external scraper and summarized for the local `/health` endpoint.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use uuid::Uuid;

/// Mint a fresh correlation id.
pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Alerting thresholds for the health roll-up.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub slow_operation: Duration,
    pub error_rate_warn: f64,
    pub error_rate_critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            slow_operation: Duration::from_secs(2),
            error_rate_warn: 0.10,
            error_rate_critical: 0.50,
        }
    }
}

/// Aggregated service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn is_serving(self) -> bool {
        !matches!(self, Self::Critical)
    }
}

/// Snapshot returned by the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub sampled_operations: usize,
}

struct Sample {
    at: Instant,
    success: bool,
}

/// Metrics registry plus the sliding outcome window behind health roll-ups.
pub struct Observability {
    registry: Registry,
    op_duration: HistogramVec,
    op_total: IntCounterVec,
    pool_total: IntGauge,
    pool_idle: IntGauge,
    pool_in_use: IntGauge,
    pool_waiting: IntGauge,
    rate_limited_total: IntCounter,
    thresholds: Thresholds,
    recent: Mutex<VecDeque<Sample>>,
}

/// How far back the health window looks.
const HEALTH_WINDOW: Duration = Duration::from_secs(300);
const HEALTH_WINDOW_CAP: usize = 2_048;

impl Observability {
    pub fn new(thresholds: Thresholds) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let op_duration = HistogramVec::new(
            HistogramOpts::new(
                "censusgate_operation_duration_seconds",
                "Pipeline stage latency in seconds",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 15.0, 30.0]),
            &["stage"],
        )?;
        registry.register(Box::new(op_duration.clone()))?;

        let op_total = IntCounterVec::new(
            Opts::new(
                "censusgate_operations_total",
                "Pipeline stage outcomes by status",
            ),
            &["stage", "status"],
        )?;
        registry.register(Box::new(op_total.clone()))?;

        let pool_total = IntGauge::new("censusgate_pool_connections", "Connections in the pool")?;
        registry.register(Box::new(pool_total.clone()))?;
        let pool_idle = IntGauge::new("censusgate_pool_idle", "Idle pooled connections")?;
        registry.register(Box::new(pool_idle.clone()))?;
        let pool_in_use = IntGauge::new("censusgate_pool_in_use", "Checked-out connections")?;
        registry.register(Box::new(pool_in_use.clone()))?;
        let pool_waiting = IntGauge::new("censusgate_pool_waiting", "Tasks waiting for a handle")?;
        registry.register(Box::new(pool_waiting.clone()))?;

        let rate_limited_total = IntCounter::new(
            "censusgate_rate_limited_total",
            "Requests rejected by the rate limiter",
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        Ok(Self {
            registry,
            op_duration,
            op_total,
            pool_total,
            pool_idle,
            pool_in_use,
            pool_waiting,
            rate_limited_total,
            thresholds,
            recent: Mutex::new(VecDeque::new()),
        })
    }

    /// Record one completed operation.
    pub fn record_operation(
        &self,
        stage: &str,
        duration: Duration,
        success: bool,
        error_tag: Option<&str>,
    ) {
        self.op_duration
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
        let status = if success { "ok" } else { "error" };
        self.op_total.with_label_values(&[stage, status]).inc();

        if duration > self.thresholds.slow_operation {
            tracing::warn!(
                stage,
                duration_ms = duration.as_millis() as u64,
                "slow operation"
            );
        }
        if let Some(tag) = error_tag {
            tracing::debug!(stage, error = tag, "operation failed");
        }

        let mut recent = self.recent.lock().expect("observability lock poisoned");
        recent.push_back(Sample {
            at: Instant::now(),
            success,
        });
        while recent.len() > HEALTH_WINDOW_CAP {
            recent.pop_front();
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn set_pool_gauges(&self, total: usize, idle: usize, in_use: usize, waiting: usize) {
        self.pool_total.set(total as i64);
        self.pool_idle.set(idle as i64);
        self.pool_in_use.set(in_use as i64);
        self.pool_waiting.set(waiting as i64);
    }

    /// Error-rate roll-up over the recent window.
    pub fn health(&self) -> HealthSnapshot {
        let mut recent = self.recent.lock().expect("observability lock poisoned");
        let cutoff = Instant::now()
            .checked_sub(HEALTH_WINDOW)
            .unwrap_or_else(Instant::now);
        while recent.front().is_some_and(|s| s.at < cutoff) {
            recent.pop_front();
        }

        let total = recent.len();
        let failures = recent.iter().filter(|s| !s.success).count();
        let error_rate = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };

        let status = if total > 0 && error_rate >= self.thresholds.error_rate_critical {
            HealthStatus::Critical
        } else if total > 0 && error_rate >= self.thresholds.error_rate_warn {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            error_rate,
            sampled_operations: total,
        }
    }

    /// Render the registry in prometheus text exposition format.
    pub fn render_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observability() -> Observability {
        Observability::new(Thresholds::default()).expect("registry builds")
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(correlation_id(), correlation_id());
    }

    #[test]
    fn healthy_with_no_samples() {
        let obs = observability();
        let health = obs.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.sampled_operations, 0);
    }

    #[test]
    fn degrades_at_warn_threshold() {
        let obs = observability();
        for _ in 0..9 {
            obs.record_operation("execute", Duration::from_millis(5), true, None);
        }
        obs.record_operation("execute", Duration::from_millis(5), false, Some("boom"));

        let health = obs.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!((health.error_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn critical_at_half_failures() {
        let obs = observability();
        for i in 0..10 {
            obs.record_operation("translate", Duration::from_millis(5), i % 2 == 0, None);
        }
        assert_eq!(obs.health().status, HealthStatus::Critical);
    }

    #[test]
    fn exposition_contains_registered_series() {
        let obs = observability();
        obs.record_operation("validate", Duration::from_millis(1), true, None);
        obs.set_pool_gauges(4, 2, 2, 0);

        let text = obs.render_metrics();
        assert!(text.contains("censusgate_operation_duration_seconds"));
        assert!(text.contains("censusgate_pool_connections 4"));
    }
}
