use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref TELEMETRY_APPLIED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_telemetry_applied_total",
        "Sensor telemetry samples applied to a device"
    ))
    .unwrap();
    pub static ref LIVENESS_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_liveness_updates_total",
        "Device status updates from last-will or heartbeat messages"
    ))
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "relay_dropped_messages_total",
            "Inbound messages dropped, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_store_failures_total",
        "Store operations that failed on the ingest path"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_commands_published_total",
        "Detection commands acknowledged by the broker"
    ))
    .unwrap();
    pub static ref COMMAND_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_command_failures_total",
        "Detection commands dropped because the publisher could not deliver them"
    ))
    .unwrap();
    pub static ref RECONNECT_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "relay_reconnect_attempts_total",
            "Broker reconnect attempts, by session"
        ),
        &["session"]
    )
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relay_ingest_latency_seconds",
            "Time taken to apply one inbound message to the store"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIVENESS_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONNECT_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
