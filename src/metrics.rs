//! Process-wide metrics registry. Initialized once at startup; handlers and
//! jobs only increment.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref BLOBS_PUSHED: IntCounterVec = register_int_counter_vec!(
        "keppel_pushed_blobs",
        "Number of blobs pushed into this registry, by ingest method.",
        &["account", "method"]
    )
    .unwrap();
    pub static ref UPLOADS_ABORTED: IntCounterVec = register_int_counter_vec!(
        "keppel_aborted_uploads",
        "Number of blob uploads that were aborted before completion.",
        &["account", "method"]
    )
    .unwrap();
    pub static ref MANIFESTS_PUSHED: IntCounterVec = register_int_counter_vec!(
        "keppel_pushed_manifests",
        "Number of manifests pushed into this registry, by ingest method.",
        &["account", "method"]
    )
    .unwrap();
    pub static ref JANITOR_TASKS: IntCounterVec = register_int_counter_vec!(
        "keppel_janitor_tasks",
        "Number of janitor task runs, by task and outcome.",
        &["task", "outcome"]
    )
    .unwrap();
}

/// Renders all registered metrics in the Prometheus text format.
pub fn gather() -> Vec<u8> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("cannot encode metrics: {err}");
    }
    buffer
}
