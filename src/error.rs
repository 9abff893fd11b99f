//! Error types for devmap.

use thiserror::Error;

/// Result type alias using devmap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for devmap operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Device identifier is outside the valid range.
    #[error("device id {device_id} outside the valid device range")]
    DeviceIdOutOfRange {
        /// The rejected identifier.
        device_id: u32,
    },

    /// Backing-buffer allocation failed.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// A buffer length that is zero or not a whole number of pages.
    #[error("buffer length {len} is not a nonzero multiple of the page size")]
    InvalidBufferLen {
        /// The rejected length in bytes.
        len: usize,
    },

    /// A fault or lookup addressed a byte offset beyond the buffer.
    ///
    /// Surfaced to the address-space manager as an access violation for the
    /// faulting consumer; other mappings are unaffected.
    #[error("offset {offset} beyond device buffer of {len} bytes")]
    OutOfRange {
        /// The faulting byte offset.
        offset: usize,
        /// The buffer length in bytes.
        len: usize,
    },

    /// An operation was invoked on a mapping whose teardown already began.
    #[error("mapping already destroyed")]
    MappingDestroyed,

    /// Registry teardown was requested while mappings still reference
    /// device buffers.
    #[error("{count} mappings still reference device buffers")]
    MappingsOutstanding {
        /// Number of live mappings across all devices.
        count: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
