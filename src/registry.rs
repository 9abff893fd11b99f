//! Device registry: lazily-created arenas keyed by device identifier.
//!
//! The registry owns one optional [`PageArena`] slot per device id. A
//! device's arena is created on its first open and stays registered for the
//! registry's whole lifetime — closing and reopening the same id returns
//! the same arena (identity-equal storage). Teardown releases every arena
//! at once and is refused while any mapping still references one.
//!
//! # Concurrency
//!
//! The whole table sits behind one mutex: the check-then-create sequence in
//! [`DeviceRegistry::open`] is serialized, so two threads racing to open the
//! same fresh id cannot allocate two arenas. Once a handle is out, all
//! further access to the arena is lock-free.

use crate::arena::PageArena;
use crate::defaults::{DEVICE_BUFFER_LEN, MAX_DEVICES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::observability;
use std::sync::{Arc, Mutex, PoisonError};

/// Table of device buffers, one optional arena per device id.
///
/// Process-wide state in the reference design; here an owned value so that
/// construction and teardown are first-class operations. Initialized empty;
/// torn down explicitly via [`DeviceRegistry::teardown`].
pub struct DeviceRegistry {
    /// One slot per device id; `None` until the id is first opened.
    devices: Mutex<Vec<Option<Arc<PageArena>>>>,
    /// Backing-buffer length used for every lazily-created arena.
    buffer_len: usize,
}

impl DeviceRegistry {
    /// Create an empty registry whose devices get `buffer_len`-byte buffers.
    ///
    /// `buffer_len` must be a nonzero multiple of
    /// [`PAGE_SIZE`](crate::defaults::PAGE_SIZE).
    pub fn new(buffer_len: usize) -> Result<Self> {
        if buffer_len == 0 || buffer_len % PAGE_SIZE != 0 {
            return Err(Error::InvalidBufferLen { len: buffer_len });
        }

        Ok(Self {
            devices: Mutex::new(vec![None; MAX_DEVICES]),
            buffer_len,
        })
    }

    /// Create an empty registry using the default buffer length
    /// ([`DEVICE_BUFFER_LEN`](crate::defaults::DEVICE_BUFFER_LEN)).
    pub fn with_defaults() -> Self {
        Self {
            devices: Mutex::new(vec![None; MAX_DEVICES]),
            buffer_len: DEVICE_BUFFER_LEN,
        }
    }

    /// Open the device `device_id`, creating its buffer on first open.
    ///
    /// The arena is allocated zero-filled, registered exactly once per id,
    /// and every subsequent open of the same id returns a handle to the
    /// same arena. Fails with [`Error::DeviceIdOutOfRange`] for ids beyond
    /// the device table, or with an allocation error if backing storage
    /// cannot be obtained (the device then remains unopened).
    pub fn open(&self, device_id: u32) -> Result<BufferHandle> {
        if device_id as usize >= MAX_DEVICES {
            return Err(Error::DeviceIdOutOfRange { device_id });
        }

        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);

        let slot = &mut devices[device_id as usize];
        let arena = match slot {
            Some(arena) => Arc::clone(arena),
            None => {
                let arena = PageArena::new(device_id, self.buffer_len)?;
                tracing::debug!(device_id, len = self.buffer_len, "created device buffer");
                observability::record_arena_created();
                *slot = Some(Arc::clone(&arena));
                arena
            }
        };

        tracing::trace!(device_id, "opened device");
        Ok(BufferHandle { arena })
    }

    /// Release every registered arena and its storage.
    ///
    /// Fails with [`Error::MappingsOutstanding`] if any mapping still
    /// references an arena; in that case nothing is released. The caller's
    /// environment must unmap everything before stopping the module.
    pub fn teardown(&self) -> Result<()> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);

        let outstanding: usize = devices
            .iter()
            .flatten()
            .map(|arena| arena.live_mappings())
            .sum();
        if outstanding > 0 {
            tracing::warn!(outstanding, "teardown refused: mappings still live");
            return Err(Error::MappingsOutstanding { count: outstanding });
        }

        for slot in devices.iter_mut() {
            if let Some(arena) = slot.take() {
                tracing::debug!(device_id = arena.device_id(), "released device buffer");
            }
        }

        Ok(())
    }

    /// Number of devices with a registered arena.
    pub fn arena_count(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .count()
    }

    /// Buffer length every device in this registry gets.
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("buffer_len", &self.buffer_len)
            .field("arenas", &self.arena_count())
            .finish()
    }
}

/// Handle to an open device's buffer.
///
/// The device-node layer stores one of these per open session. Cloning is
/// cheap (an `Arc` bump); dropping a handle releases nothing — arenas
/// outlive sessions and are only released at registry teardown.
#[derive(Clone)]
pub struct BufferHandle {
    arena: Arc<PageArena>,
}

impl BufferHandle {
    /// Identifier of the device this handle belongs to.
    #[inline]
    pub fn device_id(&self) -> u32 {
        self.arena.device_id()
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Returns true if the buffer has zero length (never, by construction).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// The arena backing this handle.
    #[inline]
    pub fn arena(&self) -> &Arc<PageArena> {
        &self.arena
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("device_id", &self.device_id())
            .field("len", &self.len())
            .finish()
    }
}
