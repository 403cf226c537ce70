/// Prometheus metrics
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

lazy_static! {
    /// Commits applied through the repo transactor
    pub static ref COMMITS_APPLIED: IntCounter = register_int_counter!(
        "pds_commits_applied_total",
        "Repository commits successfully applied"
    )
    .unwrap();

    /// Record writes by action
    pub static ref RECORD_WRITES: IntCounterVec = register_int_counter_vec!(
        "pds_record_writes_total",
        "Record writes applied, by action",
        &["action"]
    )
    .unwrap();

    /// Events appended to the sequencer log, by type
    pub static ref EVENTS_SEQUENCED: IntCounterVec = register_int_counter_vec!(
        "pds_events_sequenced_total",
        "Events appended to the sequencer log, by type",
        &["event_type"]
    )
    .unwrap();

    /// Subscribers dropped for not keeping up
    pub static ref SUBSCRIBERS_DROPPED: IntCounter = register_int_counter!(
        "pds_subscribers_dropped_total",
        "Firehose subscribers dropped after channel overflow"
    )
    .unwrap();

    /// Identity resolutions, by outcome
    pub static ref IDENTITY_RESOLUTIONS: IntCounterVec = register_int_counter_vec!(
        "pds_identity_resolutions_total",
        "Identity resolutions, by source and outcome",
        &["source", "outcome"]
    )
    .unwrap();

    /// Blob store operations, by kind
    pub static ref BLOB_OPS: IntCounterVec = register_int_counter_vec!(
        "pds_blob_ops_total",
        "Blob store operations, by kind",
        &["op"]
    )
    .unwrap();

    /// Login timing, including the anti-enumeration jitter
    pub static ref LOGIN_DURATION: Histogram = register_histogram!(
        "pds_login_duration_seconds",
        "Wall-clock login duration"
    )
    .unwrap();
}

/// Render all metrics in the Prometheus text format
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
