//! Metrics collection using metrics-rs.

use metrics::{counter, gauge, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FAULTS_RESOLVED: &str = "devmap_faults_resolved";
const FAULTS_FAILED: &str = "devmap_faults_failed";
const ARENAS_CREATED: &str = "devmap_arenas_created";
const MAPPINGS_ACTIVE: &str = "devmap_mappings_active";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        FAULTS_RESOLVED,
        Unit::Count,
        "Total number of faults resolved to a backing page"
    );
    metrics::describe_counter!(
        FAULTS_FAILED,
        Unit::Count,
        "Total number of faults rejected as out of range"
    );
    metrics::describe_counter!(
        ARENAS_CREATED,
        Unit::Count,
        "Total number of device buffers created"
    );
    metrics::describe_gauge!(
        MAPPINGS_ACTIVE,
        Unit::Count,
        "Number of mappings currently live"
    );
}

/// Record a fault resolved to a page.
#[inline]
pub fn record_fault_resolved(device_id: u32) {
    counter!(FAULTS_RESOLVED, "device" => device_id.to_string()).increment(1);
}

/// Record a fault rejected as out of range.
#[inline]
pub fn record_fault_failed(device_id: u32) {
    counter!(FAULTS_FAILED, "device" => device_id.to_string()).increment(1);
}

/// Record a device buffer creation.
#[inline]
pub fn record_arena_created() {
    counter!(ARENAS_CREATED).increment(1);
}

/// Record a mapping becoming live.
#[inline]
pub fn record_mapping_opened() {
    gauge!(MAPPINGS_ACTIVE).increment(1.0);
}

/// Record a mapping being torn down.
#[inline]
pub fn record_mapping_closed() {
    gauge!(MAPPINGS_ACTIVE).decrement(1.0);
}
