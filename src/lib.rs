//! # devmap
//!
//! On-demand mapping of device-owned memory buffers.
//!
//! A consumer opens a virtual device, maps a byte range of its buffer, and
//! pages are bound lazily: nothing is committed until the first access to
//! each page. On every unresolved access the fault resolver translates the
//! faulting page index into the correct backing page inside the device
//! buffer and hands out a reference-counted page handle, so the same offset
//! always resolves to the same physical page no matter how many mappings
//! share the device.
//!
//! ## Features
//!
//! - **Lazy binding**: mapping a range commits no pages; faults do
//! - **Shared backing**: many mappings of one device see the same pages
//! - **RAII page handles**: bind counts released on every exit path
//! - **Linux-native storage**: memfd_create + mmap, page-aligned and
//!   kernel-zeroed
//!
//! ## Quick Start
//!
//! ```rust
//! use devmap::prelude::*;
//!
//! let coordinator = MappingCoordinator::with_defaults();
//!
//! // Open a device (its buffer is created lazily, once)
//! let handle = coordinator.open_device(0)?;
//!
//! // Map it; no pages are bound yet
//! let mapping = coordinator.create_mapping(&handle, 0, MappingFlags::default());
//!
//! // First access to page 0 faults it in
//! let page = devmap::fault::resolve(&mapping, 0)?;
//! assert_eq!(mapping.fault_count(), 1);
//!
//! drop(page);
//! coordinator.destroy_mapping(&mapping)?;
//! coordinator.teardown()?;
//! # Ok::<(), devmap::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod defaults;
pub mod error;
pub mod fault;
pub mod lifecycle;
pub mod mapping;
pub mod observability;
pub mod registry;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::arena::{PageArena, PageRef};
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::MappingCoordinator;
    pub use crate::mapping::{MappingDescriptor, MappingFlags};
    pub use crate::registry::{BufferHandle, DeviceRegistry};
}

pub use error::{Error, Result};
