//! Lifecycle coordination: open → map → fault* → unmap → close → teardown.
//!
//! The coordinator owns the device registry and is the only place mappings
//! are created and destroyed, which is what makes the ordering invariants
//! hold: a device's arena is never released while a mapping references it,
//! and a descriptor is never released while a resolution is in flight.
//!
//! The reference design relied on a convention ("free only at module
//! cleanup") to avoid use-after-free between arenas and mappings; here the
//! same invariant is structural — per-arena live-mapping counts gate
//! teardown, and `Arc` ownership covers stragglers.

use crate::error::Result;
use crate::mapping::{MappingDescriptor, MappingFlags};
use crate::observability;
use crate::registry::{BufferHandle, DeviceRegistry};
use std::sync::Arc;

/// Orchestrates the mapping lifecycle over a device registry.
pub struct MappingCoordinator {
    registry: DeviceRegistry,
}

impl MappingCoordinator {
    /// Create a coordinator whose devices get `buffer_len`-byte buffers.
    pub fn new(buffer_len: usize) -> Result<Self> {
        Ok(Self {
            registry: DeviceRegistry::new(buffer_len)?,
        })
    }

    /// Create a coordinator using the default buffer length.
    pub fn with_defaults() -> Self {
        Self {
            registry: DeviceRegistry::with_defaults(),
        }
    }

    /// The underlying device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Open a device, creating its buffer on first open.
    ///
    /// The device-node layer calls this from its open hook and stores the
    /// handle in the session context. Closing a session drops the handle
    /// and releases nothing; the arena stays registered.
    pub fn open_device(&self, device_id: u32) -> Result<BufferHandle> {
        self.registry.open(device_id)
    }

    /// Establish a mapping over an open device buffer.
    ///
    /// Binds a new descriptor to the handle's arena with fault counter 0.
    /// No page is bound here — binding happens lazily, per page, in
    /// [`crate::fault::resolve`].
    pub fn create_mapping(
        &self,
        handle: &BufferHandle,
        page_offset_base: u64,
        flags: MappingFlags,
    ) -> Arc<MappingDescriptor> {
        let mapping = MappingDescriptor::new(handle, page_offset_base, flags);
        tracing::debug!(
            device_id = handle.device_id(),
            page_offset_base,
            ?flags,
            "mapping created"
        );
        observability::record_mapping_opened();
        mapping
    }

    /// Tear down a mapping; returns its final fault count.
    ///
    /// Driven by the external "mapping removed" event (explicit unmap or
    /// process exit). Waits for in-flight resolutions to drain, then marks
    /// the descriptor destroyed; page bind counts are released by the
    /// address-space manager dropping its [`PageRef`](crate::arena::PageRef)
    /// handles, not by walking pages here. The arena is untouched.
    pub fn destroy_mapping(&self, mapping: &Arc<MappingDescriptor>) -> Result<u64> {
        mapping.mark_destroyed()?;
        let faults = mapping.fault_count();
        tracing::debug!(
            device_id = mapping.device_id(),
            faults,
            "mapping destroyed"
        );
        observability::record_mapping_closed();
        Ok(faults)
    }

    /// Release every device buffer.
    ///
    /// Refused while any mapping is live; the environment must destroy all
    /// mappings first.
    pub fn teardown(&self) -> Result<()> {
        self.registry.teardown()
    }
}

impl std::fmt::Debug for MappingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingCoordinator")
            .field("registry", &self.registry)
            .finish()
    }
}
