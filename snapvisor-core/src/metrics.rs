// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus metrics for lifecycle operations and pooled resources.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "snapvisor_operation_duration_seconds",
        "Time taken by a lifecycle operation",
        &["operation", "outcome"],
        vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();
    pub static ref OPERATION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "snapvisor_operation_errors_total",
        "Failed lifecycle operations by error kind",
        &["operation", "kind"]
    )
    .unwrap();
    pub static ref VMS_BY_STATE: IntGaugeVec = register_int_gauge_vec!(
        "snapvisor_vms",
        "Registered VMs by lifecycle state",
        &["state"]
    )
    .unwrap();
    pub static ref NETWORK_SLOTS_IN_USE: IntGauge = register_int_gauge!(
        "snapvisor_network_slots_in_use",
        "Network slots currently leased"
    )
    .unwrap();
    pub static ref SNAPSHOT_BYTES_WRITTEN: IntCounter = register_int_counter!(
        "snapvisor_snapshot_bytes_written_total",
        "Bytes of snapshot data published"
    )
    .unwrap();
}

/// Force registration so every metric appears in the first scrape.
pub fn init() {
    lazy_static::initialize(&OPERATION_DURATION);
    lazy_static::initialize(&OPERATION_ERRORS);
    lazy_static::initialize(&VMS_BY_STATE);
    lazy_static::initialize(&NETWORK_SLOTS_IN_USE);
    lazy_static::initialize(&SNAPSHOT_BYTES_WRITTEN);
}

/// Encode the default registry in the Prometheus text format.
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}
