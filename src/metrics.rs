use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGaugeVec, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: IntCounter =
        register_int_counter!("gateway_requests_total", "Total number of API requests").unwrap();
    pub static ref ADMISSION_ALLOWED: IntCounterVec = register_int_counter_vec!(
        "gateway_admission_allowed_total",
        "Requests admitted, by policy",
        &["policy"]
    )
    .unwrap();
    pub static ref ADMISSION_DENIED: IntCounterVec = register_int_counter_vec!(
        "gateway_admission_denied_total",
        "Requests rejected with 429, by policy",
        &["policy"]
    )
    .unwrap();
    pub static ref ADMISSION_RECONCILED: IntCounterVec = register_int_counter_vec!(
        "gateway_admission_reconciled_total",
        "Provisional counts given back after the outcome was known, by policy",
        &["policy"]
    )
    .unwrap();
    pub static ref EVICTED_ENTRIES: IntCounterVec = register_int_counter_vec!(
        "gateway_evicted_entries_total",
        "Expired counter entries removed by the sweep, by policy",
        &["policy"]
    )
    .unwrap();
    pub static ref TRACKED_KEYS: IntGaugeVec = register_int_gauge_vec!(
        "gateway_tracked_keys",
        "Keys currently held in each policy's counter store",
        &["policy"]
    )
    .unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "gateway_upstream_latency_seconds",
        "Upstream round trip in seconds"
    )
    .unwrap();
}
