use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_updates_total",
        "Total location updates submitted"
    ))
    .unwrap();
    pub static ref ACCEPTED_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_accepted_updates_total",
        "Total location updates applied to the registry"
    ))
    .unwrap();
    pub static ref INVALID_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_invalid_updates_total",
        "Total location updates rejected by validation"
    ))
    .unwrap();
    pub static ref STALE_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_stale_updates_total",
        "Total location updates older than the device's last seen time"
    ))
    .unwrap();
    pub static ref UNKNOWN_DEVICE_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_unknown_device_updates_total",
        "Total location updates for unregistered devices"
    ))
    .unwrap();
    pub static ref ACTIVE_SUBSCRIBERS: IntGauge = IntGauge::with_opts(Opts::new(
        "tracker_active_subscribers",
        "Number of open fleet subscriptions"
    ))
    .unwrap();
    pub static ref SUBSCRIBER_OVERRUNS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_subscriber_overruns_total",
        "Total deltas coalesced because a subscriber had not taken the previous one"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_db_failures_total",
        "Total database archive failures"
    ))
    .unwrap();
    pub static ref ARCHIVE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tracker_archive_latency_seconds",
            "Time taken to archive a batch of samples"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref ARCHIVE_BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "tracker_archive_batch_size",
        "Current archive batch size being processed"
    ))
    .unwrap();
    pub static ref ARCHIVE_CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_archive_channel_full_total",
        "Total samples dropped because the archive channel was full"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(UPDATES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(ACCEPTED_UPDATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_UPDATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STALE_UPDATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UNKNOWN_DEVICE_UPDATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ACTIVE_SUBSCRIBERS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SUBSCRIBER_OVERRUNS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_BATCH_SIZE.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
