//! Prometheus metrics.
//!
//! A dedicated (non-default) `Registry` is used, per `SchedulerMetrics`, so
//! a test can construct one without colliding with the process-global
//! registry, and so the crate stays embeddable alongside other components
//! that register their own metrics.

use std::convert::Infallible;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

/// Follow-scheduler domain metrics, all registered on one
/// dedicated `Registry` so the HTTP handler and the scheduler share state
/// without touching `prometheus::default_registry()`.
pub struct SchedulerMetrics {
    registry: Registry,
    follow_attempts_total: IntCounterVec,
    follow_duration_seconds: Histogram,
    active_workers: Gauge,
    current_group: Gauge,
    daily_resets_total: Gauge,
    rate_limited_workers_total: Gauge,
    eligibility_skips_total: IntCounterVec,
}

impl SchedulerMetrics {
    /// Builds and registers every metric this service reports.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let follow_attempts_total = IntCounterVec::new(
            Opts::new("follow_attempts_total", "Total follow attempts by outcome"),
            &["outcome"],
        )?;
        let follow_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "follow_duration_seconds",
            "Wall-clock duration of one follow attempt, in seconds",
        ))?;
        let active_workers = Gauge::with_opts(Opts::new(
            "active_workers",
            "Number of workers currently activated by the scheduler",
        ))?;
        let current_group = Gauge::with_opts(Opts::new(
            "current_group",
            "The fleet's currently active rotation group",
        ))?;
        let daily_resets_total = Gauge::with_opts(Opts::new(
            "daily_resets_total",
            "Count of workers whose daily_follows counter was reset at the last UTC-hour-0 tick",
        ))?;
        let rate_limited_workers_total = Gauge::with_opts(Opts::new(
            "rate_limited_workers_total",
            "Number of workers currently serving a rate-limit cooldown",
        ))?;
        let eligibility_skips_total = IntCounterVec::new(
            Opts::new("eligibility_skips_total", "Workers skipped by the eligibility gate, by reason"),
            &["reason"],
        )?;

        registry.register(Box::new(follow_attempts_total.clone()))?;
        registry.register(Box::new(follow_duration_seconds.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(current_group.clone()))?;
        registry.register(Box::new(daily_resets_total.clone()))?;
        registry.register(Box::new(rate_limited_workers_total.clone()))?;
        registry.register(Box::new(eligibility_skips_total.clone()))?;

        Ok(Self {
            registry,
            follow_attempts_total,
            follow_duration_seconds,
            active_workers,
            current_group,
            daily_resets_total,
            rate_limited_workers_total,
            eligibility_skips_total,
        })
    }

    pub fn record_follow_outcome(&self, outcome_label: &str, duration: Duration) {
        self.follow_attempts_total.with_label_values(&[outcome_label]).inc();
        self.follow_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_eligibility_skip(&self, reason: &str) {
        self.eligibility_skips_total.with_label_values(&[reason]).inc();
    }

    pub fn record_group(&self, group: i32) {
        self.current_group.set(group as f64);
    }

    pub fn record_daily_reset(&self, reset_count: u64) {
        self.daily_resets_total.set(reset_count as f64);
    }

    pub fn set_active_workers(&self, count: i64) {
        self.active_workers.set(count as f64);
    }

    pub fn set_rate_limited_workers(&self, count: i64) {
        self.rate_limited_workers_total.set(count as f64);
    }

    pub fn gather_string(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_else(|e| {
            error!(error = %e, "metrics buffer was not valid UTF-8");
            String::from("# ERROR ENCODING METRICS TO UTF-8")
        })
    }
}

async fn metrics_handler(
    _req: Request<Body>,
    metrics: std::sync::Arc<SchedulerMetrics>,
) -> Result<Response<Body>, Infallible> {
    let body = metrics.gather_string();
    let response = Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    Ok(response)
}

/// Starts the Prometheus metrics HTTP server on `0.0.0.0:{port}`.
pub async fn start_metrics_server(port: u16, metrics: std::sync::Arc<SchedulerMetrics>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let metrics = metrics.clone();
                async move { metrics_handler(req, metrics).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port, %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}
