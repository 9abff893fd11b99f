//! Observability: metrics for fault and lifecycle activity.
//!
//! devmap exposes the following metrics:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `devmap_faults_resolved` | Counter | Faults resolved to a page |
//! | `devmap_faults_failed` | Counter | Faults rejected as out of range |
//! | `devmap_arenas_created` | Counter | Device buffers created |
//! | `devmap_mappings_active` | Gauge | Mappings currently live |
//!
//! Per-mapping fault counts live on the descriptors themselves
//! ([`MappingDescriptor::fault_count`](crate::mapping::MappingDescriptor::fault_count));
//! these metrics aggregate across mappings per device.
//!
//! ## Example
//!
//! ```rust,ignore
//! use devmap::observability::init_metrics;
//!
//! // Initialize metric descriptions (call once at startup)
//! init_metrics();
//!
//! // Metrics are recorded automatically on the fault and lifecycle paths.
//! // Use a metrics exporter (prometheus, statsd, etc.) to collect them.
//! ```

mod metrics;

pub use metrics::{
    init_metrics, record_arena_created, record_fault_failed, record_fault_resolved,
    record_mapping_closed, record_mapping_opened,
};
