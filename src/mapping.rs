//! Per-mapping descriptors.
//!
//! A [`MappingDescriptor`] represents one active mapping of a device buffer
//! into a consumer's address space. It holds a typed reference to the
//! device's arena (no type-erased pointers, no casts), the mapping's page
//! offset base, and an atomic fault counter. Creating a descriptor binds no
//! pages — laziness is the whole point; pages are bound one at a time by
//! [`crate::fault::resolve`].
//!
//! # State machine
//!
//! ```text
//! Created ──(resolve)*──▶ Created ──(destroy)──▶ Destroyed
//! ```
//!
//! `Destroyed` is terminal. Destruction drains in-flight resolutions before
//! completing: resolvers register themselves in an in-flight gate, and
//! [`MappingDescriptor::mark_destroyed`] spins until the gate is empty, so
//! a descriptor is never released under a concurrent resolve.

use crate::arena::PageArena;
use crate::error::{Error, Result};
use crate::registry::BufferHandle;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

bitflags! {
    /// Flags the address-space manager should apply to the consumer-side
    /// mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        /// The mapping may not be expanded (mremap-style growth).
        const DONT_EXPAND = 1 << 0;
        /// Exclude the mapping's pages from core dumps.
        const DONT_DUMP = 1 << 1;
    }
}

impl Default for MappingFlags {
    /// Device-buffer mappings are fixed-size and excluded from dumps.
    fn default() -> Self {
        Self::DONT_EXPAND | Self::DONT_DUMP
    }
}

const ACTIVE: u32 = 0;
const DESTROYED: u32 = 1;

/// One active mapping of a device buffer.
///
/// Created at map time, destroyed at unmap time. Many descriptors may share
/// one arena (many mappings of the same device); the arena outlives every
/// descriptor referencing it.
pub struct MappingDescriptor {
    /// The device buffer this mapping is over.
    arena: Arc<PageArena>,
    /// Mapping-relative page offset base, supplied at map time.
    page_offset_base: u64,
    /// Flags for the consumer-side mapping.
    flags: MappingFlags,
    /// Fault counter. Monotonically increasing, starts at 0.
    faults: AtomicU64,
    /// ACTIVE or DESTROYED.
    state: AtomicU32,
    /// Resolutions currently executing against this descriptor.
    in_flight: AtomicUsize,
}

impl MappingDescriptor {
    /// Bind a new descriptor to the handle's arena with fault counter 0.
    pub(crate) fn new(
        handle: &BufferHandle,
        page_offset_base: u64,
        flags: MappingFlags,
    ) -> Arc<Self> {
        let arena = Arc::clone(handle.arena());
        arena.mapping_started();

        Arc::new(Self {
            arena,
            page_offset_base,
            flags,
            faults: AtomicU64::new(0),
            state: AtomicU32::new(ACTIVE),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Identifier of the device this mapping is over.
    #[inline]
    pub fn device_id(&self) -> u32 {
        self.arena.device_id()
    }

    /// Mapping-relative page offset base.
    #[inline]
    pub fn page_offset_base(&self) -> u64 {
        self.page_offset_base
    }

    /// Flags for the consumer-side mapping.
    #[inline]
    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    /// Number of fault-resolution attempts against this mapping.
    #[inline]
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Acquire)
    }

    /// Whether this mapping's teardown has begun.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DESTROYED
    }

    /// The arena backing this mapping.
    pub(crate) fn arena(&self) -> &Arc<PageArena> {
        &self.arena
    }

    /// Count one fault-resolution attempt; returns the new total.
    pub(crate) fn record_fault(&self) -> u64 {
        self.faults.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Enter the in-flight gate for one resolution.
    ///
    /// Fails with [`Error::MappingDestroyed`] if teardown already began.
    /// The returned guard leaves the gate when dropped, on every exit path.
    pub(crate) fn begin_resolve(&self) -> Result<ResolveGuard<'_>> {
        if self.is_destroyed() {
            return Err(Error::MappingDestroyed);
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);

        // Re-check after publishing: a destroy that won the race saw either
        // our increment (and is now draining) or our bail-out here.
        if self.is_destroyed() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::MappingDestroyed);
        }

        Ok(ResolveGuard { descriptor: self })
    }

    /// Transition to `Destroyed` and drain in-flight resolutions.
    ///
    /// After this returns, no resolution is executing against the
    /// descriptor and none can start. Fails with
    /// [`Error::MappingDestroyed`] if the descriptor was already destroyed.
    pub(crate) fn mark_destroyed(&self) -> Result<()> {
        self.state
            .compare_exchange(ACTIVE, DESTROYED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::MappingDestroyed)?;

        // Quiescence drain: resolutions that entered the gate before the
        // transition complete; new ones fail the destroyed check.
        while self.in_flight.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }

        self.arena.mapping_finished();
        Ok(())
    }
}

impl Drop for MappingDescriptor {
    fn drop(&mut self) {
        // A descriptor dropped without an explicit destroy still releases
        // its live-mapping count.
        if self.state.load(Ordering::Acquire) == ACTIVE {
            self.arena.mapping_finished();
        }
    }
}

impl std::fmt::Debug for MappingDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingDescriptor")
            .field("device_id", &self.device_id())
            .field("page_offset_base", &self.page_offset_base)
            .field("faults", &self.fault_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Gate token for one in-flight resolution (internal).
///
/// Dropping the guard leaves the gate, which unblocks a draining destroy.
pub(crate) struct ResolveGuard<'a> {
    descriptor: &'a MappingDescriptor,
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        self.descriptor.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
