use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref POLLS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_polls_total",
        "Total feed polls started"
    ))
    .unwrap();
    pub static ref FEED_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_feed_failures_total",
        "Total feed fetches that failed"
    ))
    .unwrap();
    pub static ref LINES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_lines_total",
        "Total non-empty feed lines processed"
    ))
    .unwrap();
    pub static ref INVALID_LINES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_invalid_lines_total",
        "Total feed lines rejected as malformed or out of range"
    ))
    .unwrap();
    pub static ref UNKNOWN_DEVICE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_unknown_device_total",
        "Total records dropped for devices outside the allowed set"
    ))
    .unwrap();
    pub static ref ALERTS_LOGGED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_alerts_logged_total",
        "Total alert log entries written"
    ))
    .unwrap();
    pub static ref SKIPPED_POLLS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_skipped_polls_total",
        "Total polls skipped because another poll was in flight"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_ingest_latency_seconds",
            "Time taken to fetch and ingest one feed batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref DEVICES_TRACKED: Gauge = Gauge::with_opts(Opts::new(
        "monitor_devices_tracked",
        "Devices with at least one accepted record"
    ))
    .unwrap();
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FEED_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LINES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_LINES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNKNOWN_DEVICE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_LOGGED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SKIPPED_POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DEVICES_TRACKED.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
