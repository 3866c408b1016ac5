//! Prometheus metric groups for federated rounds and model persistence.
//!
//! Registered against the default registry the first time they are touched, so
//! `/metrics` renders them alongside anything else the process registers.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge, Histogram, IntCounter, IntCounterVec,
    IntGauge,
};

pub struct FederatedLearningMetrics {
    pub updates_accepted_total: IntCounter,
    pub updates_rejected_total: IntCounterVec,
    pub rounds_total: IntCounterVec,
    pub participants_total: IntCounter,
    pub close_attempts_skipped_total: IntCounterVec,
    pub aggregation_latency_ms: Histogram,
    pub open_round: IntGauge,
    pub pending_devices: IntGauge,
}

pub struct PersistenceMetrics {
    pub writes_total: IntCounterVec,
    pub dropped_total: IntCounterVec,
    pub retries_total: IntCounter,
    pub retry_exhausted_total: IntCounter,
    pub retry_delay_ms: Histogram,
}

pub struct ExtendedMetrics {
    pub fl: FederatedLearningMetrics,
    pub persistence: PersistenceMetrics,
}

// Static names and label sets; registration only fails on a programming error.
pub static EXTENDED_METRICS: Lazy<ExtendedMetrics> = Lazy::new(|| {
    ExtendedMetrics {
        fl: FederatedLearningMetrics {
            updates_accepted_total: register_int_counter!("fedagg_updates_accepted_total", "Local updates accepted into the open round").expect("metric"),
            updates_rejected_total: register_int_counter_vec!("fedagg_updates_rejected_total", "Local updates rejected", &["reason"]).expect("metric"),
            rounds_total: register_int_counter_vec!("fedagg_rounds_total", "Closed rounds by outcome and trigger", &["outcome", "trigger"]).expect("metric"),
            participants_total: register_int_counter!("fedagg_participants_total", "Device contributions folded into published models").expect("metric"),
            close_attempts_skipped_total: register_int_counter_vec!("fedagg_close_attempts_skipped_total", "Close attempts that did not close a round", &["reason"]).expect("metric"),
            aggregation_latency_ms: register_histogram!(
                "fedagg_aggregation_latency_ms",
                "Aggregation latency ms",
                vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
            ).expect("metric"),
            open_round: register_int_gauge!("fedagg_open_round", "Round currently accepting updates").expect("metric"),
            pending_devices: register_int_gauge!("fedagg_pending_devices", "Devices with an update in the open round").expect("metric"),
        },
        persistence: PersistenceMetrics {
            writes_total: register_int_counter_vec!("fedagg_store_writes_total", "Documents written to the model store", &["kind"]).expect("metric"),
            dropped_total: register_int_counter_vec!("fedagg_store_dropped_total", "Documents dropped before reaching the store", &["kind", "reason"]).expect("metric"),
            retries_total: register_int_counter!("fedagg_store_retries_total", "Store write retries").expect("metric"),
            retry_exhausted_total: register_int_counter!("fedagg_store_retry_exhausted_total", "Store writes that exhausted a retry cycle").expect("metric"),
            retry_delay_ms: register_histogram!(
                "fedagg_store_retry_delay_ms",
                "Observed retry backoff delays in milliseconds",
                vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0]
            ).expect("metric"),
        },
    }
});
