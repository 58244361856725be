//! Run metrics
//!
//! Each run pushes its outcome counts to a Prometheus push gateway; the
//! client is a short-lived cron-style process, so a scrape endpoint would
//! miss most runs. Everything degrades gracefully when metrics are
//! disabled: the `metrics` macros write into a no-op recorder.

use crate::config::MetricsConfig;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Install the push-gateway exporter. Call once at startup; a disabled
/// config is a no-op.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.enabled {
        debug!("metrics disabled");
        return Ok(());
    }

    let username = (!config.username.is_empty()).then(|| config.username.clone());
    let password = (!config.password.is_empty()).then(|| config.password.clone());

    PrometheusBuilder::new()
        .with_push_gateway(
            &config.push_gateway_url,
            Duration::from_secs(config.push_interval_secs),
            username,
            password,
        )?
        .install()?;

    describe_gauge!(
        "stamping_client_stampings_sent_total",
        Unit::Count,
        "Stampings handed to the delivery pipeline in the last run"
    );
    describe_gauge!(
        "stamping_client_bad_stampings_total",
        Unit::Count,
        "Stampings that failed delivery in the last run"
    );
    describe_gauge!(
        "stamping_client_parsing_errors_total",
        Unit::Count,
        "Lines rejected by the record grammar in the last run"
    );
    describe_counter!(
        "stamping_client_cycles_total",
        Unit::Count,
        "Ingestion cycles executed"
    );
    describe_histogram!(
        "stamping_client_cycle_seconds",
        Unit::Seconds,
        "Wall time of one ingestion cycle"
    );

    info!(gateway = %config.push_gateway_url, "metrics push gateway configured");
    Ok(())
}

/// Record the outcome counts of one delivered batch.
pub fn record_batch(sent: usize, bad: usize, parse_errors: usize) {
    gauge!("stamping_client_stampings_sent_total").set(sent as f64);
    gauge!("stamping_client_bad_stampings_total").set(bad as f64);
    gauge!("stamping_client_parsing_errors_total").set(parse_errors as f64);
    debug!(sent, bad, parse_errors, "batch metrics recorded");
}

/// Tracks the wall time of one ingestion cycle.
pub struct CycleTimer {
    kind: &'static str,
    started: Instant,
}

impl CycleTimer {
    /// Start timing a cycle of the given kind (`"run"` or `"resend-bad"`).
    pub fn start(kind: &'static str) -> Self {
        info!(kind, "cycle started");
        Self {
            kind,
            started: Instant::now(),
        }
    }

    /// Record the cycle as finished.
    pub fn finish(self) {
        let elapsed = self.started.elapsed();
        counter!("stamping_client_cycles_total", "kind" => self.kind).increment(1);
        histogram!("stamping_client_cycle_seconds", "kind" => self.kind)
            .record(elapsed.as_secs_f64());
        info!(
            kind = self.kind,
            elapsed_secs = elapsed.as_secs_f64(),
            "cycle finished"
        );
    }
}
