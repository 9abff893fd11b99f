//! Configuration constants.
//!
//! These values are fixed by the host environment rather than negotiated at
//! runtime: the page size matches the kernel's, the device-id bound matches
//! the device-node layer's minor-number space, and the default buffer
//! length is what a device gets when the registry is built without an
//! explicit length.

/// Size of one page in bytes, the granularity at which faults are resolved
/// and bound.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]. Offset translation uses shifts by this amount.
pub const PAGE_SHIFT: usize = 12;

/// Upper bound on device identifiers; valid ids are `0..MAX_DEVICES`.
pub const MAX_DEVICES: usize = 256;

/// Default length of a device's backing buffer (256 pages, 1 MiB).
///
/// Must be a whole number of pages; [`crate::registry::DeviceRegistry::new`]
/// enforces the same for caller-supplied lengths.
pub const DEVICE_BUFFER_LEN: usize = 256 * PAGE_SIZE;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(DEVICE_BUFFER_LEN % PAGE_SIZE == 0);
