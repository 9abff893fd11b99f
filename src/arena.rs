//! Page-granular backing storage for one device buffer.
//!
//! This module provides `PageArena`, the owning container for a device's
//! backing storage, and `PageRef`, the reference-counted handle to one page
//! of it.
//!
//! # Design Rationale
//!
//! Each device gets exactly one arena, allocated on first open and backed by
//! `memfd_create` + `mmap`:
//!
//! - `mmap` guarantees the base address is page-aligned
//! - the kernel zero-fills the region (and commits physical pages lazily on
//!   first touch), so a fresh buffer reads as zeroes without an explicit
//!   memset
//! - one fd per device keeps fd usage at O(devices), not O(pages)
//!
//! Page lookup is a pure function of byte offset over the arena's immutable
//! layout: the arena never resizes or moves after construction, so the same
//! offset always resolves to the same physical page.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┬─────────┐
//! │  Page 0 │  Page 1 │  Page 2 │   ...   │ Page N  │
//! └─────────┴─────────┴─────────┴─────────┴─────────┘
//! ^                                                  ^
//! base                                       base + len
//! ```
//!
//! Each page is `PAGE_SIZE` bytes, starting at `base + (index << PAGE_SHIFT)`.
//!
//! # Bind Counts
//!
//! Every page carries an atomic bind count tracking how many consumer-side
//! bindings currently reference it. Acquiring a `PageRef` (or cloning one)
//! increments the count; dropping it decrements. The count governs the
//! consumer's mapping lifetime only — the storage itself stays valid until
//! the arena is destroyed, independent of any bind count.

use crate::defaults::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Backing storage for one device buffer, subdivided into pages.
///
/// Owned by the device registry; referenced (non-owning, via `Arc`) by every
/// mapping descriptor and page handle over it. The arena must outlive every
/// descriptor referencing it — the lifecycle layer enforces this by refusing
/// registry teardown while mappings remain, and `Arc` keeps the storage
/// valid even if a straggling handle survives teardown.
pub struct PageArena {
    /// Identifier of the owning device.
    device_id: u32,
    /// The memfd file descriptor (one fd for the whole buffer).
    fd: OwnedFd,
    /// Base pointer to the mmap'd region. Page-aligned.
    base: NonNull<u8>,
    /// Length of the buffer in bytes. A whole number of pages.
    len: usize,
    /// Per-page bind counts (consumer-side bindings, not storage lifetime).
    bind_counts: Box<[AtomicU64]>,
    /// Live mappings over this arena, maintained by the lifecycle layer.
    mappings: AtomicUsize,
    /// Debug name, visible in /proc/self/fd/.
    name: String,
}

impl PageArena {
    /// Allocate the backing storage for `device_id`.
    ///
    /// `len` must be a nonzero multiple of [`PAGE_SIZE`]. The region is
    /// zero-filled by the kernel and committed lazily on first touch.
    pub(crate) fn new(device_id: u32, len: usize) -> Result<Arc<Self>> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Error::InvalidBufferLen { len });
        }

        let name = format!("devmap-dev{device_id}");
        let cname =
            CString::new(name.clone()).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;

        rustix::fs::ftruncate(&fd, len as u64)?;

        // MAP_SHARED so that every mapping of this fd sees the same physical
        // pages; the fault path hands out pages of exactly this region.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        let page_count = len >> PAGE_SHIFT;
        let bind_counts: Vec<AtomicU64> = (0..page_count).map(|_| AtomicU64::new(0)).collect();

        Ok(Arc::new(Self {
            device_id,
            fd,
            base,
            len,
            bind_counts: bind_counts.into_boxed_slice(),
            mappings: AtomicUsize::new(0),
            name,
        }))
    }

    /// Look up the page covering `byte_offset`.
    ///
    /// Returns a [`PageRef`] to the covering page with its bind count
    /// acquired, or [`Error::OutOfRange`] if the offset is beyond the
    /// buffer. Repeated calls with the same offset return handles to the
    /// same underlying page (the same physical backing, not a copy).
    pub fn page_at(self: &Arc<Self>, byte_offset: usize) -> Result<PageRef> {
        if byte_offset >= self.len {
            return Err(Error::OutOfRange {
                offset: byte_offset,
                len: self.len,
            });
        }

        let index = byte_offset >> PAGE_SHIFT;
        self.bind_counts[index].fetch_add(1, Ordering::AcqRel);

        Ok(PageRef {
            arena: Arc::clone(self),
            index,
        })
    }

    /// Identifier of the device owning this arena.
    #[inline]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer has zero length (never, by construction).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages in the buffer.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.len >> PAGE_SHIFT
    }

    /// Current bind count of the page at `index`.
    ///
    /// Note: this is a snapshot and may change immediately after returning.
    pub fn bind_count(&self, index: usize) -> u64 {
        self.bind_counts
            .get(index)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Get the file descriptor backing this buffer.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Get the raw file descriptor.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Get the debug name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live mappings over this arena.
    #[inline]
    pub fn live_mappings(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }

    /// Record that a mapping over this arena was created.
    pub(crate) fn mapping_started(&self) {
        self.mappings.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that a mapping over this arena was torn down.
    pub(crate) fn mapping_finished(&self) {
        self.mappings.fetch_sub(1, Ordering::AcqRel);
    }

    /// Release one bind of the page at `index` (internal).
    fn release(&self, index: usize) {
        debug_assert!(index < self.page_count());
        self.bind_counts[index].fetch_sub(1, Ordering::AcqRel);
    }

    /// Base pointer of the page at `index`.
    #[inline]
    fn page_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.page_count());
        // SAFETY: index is within the mapped region by the debug_assert'd
        // invariant; PageRef construction bounds-checks the offset.
        unsafe { self.base.as_ptr().add(index << PAGE_SHIFT) }
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd drops
    }
}

// SAFETY: PageArena is Send + Sync because:
// - The mapped region is never resized or moved after construction
// - Bind and mapping counts are atomics
// - The fd is reference-counted by the kernel
// - Concurrent access to page contents requires external synchronization
//   (same as any shared memory)
unsafe impl Send for PageArena {}
unsafe impl Sync for PageArena {}

impl AsFd for PageArena {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for PageArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageArena")
            .field("device_id", &self.device_id)
            .field("len", &self.len)
            .field("pages", &self.page_count())
            .field("mappings", &self.live_mappings())
            .finish()
    }
}

/// Reference-counted handle to one page of a device buffer.
///
/// Acquiring a handle (via [`PageArena::page_at`] or `Clone`) increments the
/// page's bind count; dropping it decrements. This replaces imperative
/// get/put call pairs: the count is released on every exit path, including
/// error paths.
///
/// The handle keeps the arena alive (`Arc`), so the page's storage is valid
/// for the handle's whole lifetime. Many handles to the same page may exist
/// at once — across threads and across mappings — and all see the same
/// physical bytes.
pub struct PageRef {
    /// The arena owning the page.
    arena: Arc<PageArena>,
    /// Index of the page within the arena.
    index: usize,
}

impl PageRef {
    /// Index of this page within the device buffer.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of this page from the start of the device buffer.
    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.index << PAGE_SHIFT
    }

    /// Size of the page in bytes (always [`PAGE_SIZE`]).
    #[inline]
    pub fn len(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns true if the page has zero size (never).
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The arena this page belongs to.
    #[inline]
    pub fn arena(&self) -> &Arc<PageArena> {
        &self.arena
    }

    /// Current bind count of this page.
    #[inline]
    pub fn bind_count(&self) -> u64 {
        self.arena.bind_count(self.index)
    }

    /// Raw pointer to the page's memory.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.arena.page_ptr(self.index)
    }

    /// Mutable raw pointer to the page's memory.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.arena.page_ptr(self.index)
    }

    /// Get the page as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this page.
    /// Other handles to the same page (from other mappings or threads) alias
    /// the same memory.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), PAGE_SIZE) }
    }

    /// Get the page as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this page's memory. Other
    /// handles to the same page alias the same memory, so external
    /// synchronization is required.
    #[allow(clippy::mut_from_ref)] // Interior mutability via mmap is intentional
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: Caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), PAGE_SIZE) }
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        self.arena.bind_counts[self.index].fetch_add(1, Ordering::AcqRel);
        Self {
            arena: Arc::clone(&self.arena),
            index: self.index,
        }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.arena.release(self.index);
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("device_id", &self.arena.device_id())
            .field("index", &self.index)
            .field("bind_count", &self.bind_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_creation() {
        let arena = PageArena::new(7, 4 * PAGE_SIZE).unwrap();
        assert_eq!(arena.device_id(), 7);
        assert_eq!(arena.len(), 4 * PAGE_SIZE);
        assert_eq!(arena.page_count(), 4);
        assert_eq!(arena.live_mappings(), 0);
        assert_eq!(arena.name(), "devmap-dev7");
    }

    #[test]
    fn test_arena_base_is_page_aligned() {
        let arena = PageArena::new(0, 2 * PAGE_SIZE).unwrap();
        let page = arena.page_at(0).unwrap();
        assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn test_arena_zero_filled() {
        let arena = PageArena::new(0, 2 * PAGE_SIZE).unwrap();
        for index in 0..arena.page_count() {
            let page = arena.page_at(index * PAGE_SIZE).unwrap();
            unsafe {
                assert!(page.as_slice().iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn test_arena_invalid_len() {
        assert!(matches!(
            PageArena::new(0, 0),
            Err(Error::InvalidBufferLen { len: 0 })
        ));
        assert!(matches!(
            PageArena::new(0, PAGE_SIZE + 1),
            Err(Error::InvalidBufferLen { .. })
        ));
    }

    #[test]
    fn test_page_at_out_of_range() {
        let arena = PageArena::new(0, 2 * PAGE_SIZE).unwrap();
        let err = arena.page_at(2 * PAGE_SIZE).unwrap_err();
        match err {
            Error::OutOfRange { offset, len } => {
                assert_eq!(offset, 2 * PAGE_SIZE);
                assert_eq!(len, 2 * PAGE_SIZE);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_page_at_identity() {
        let arena = PageArena::new(0, 4 * PAGE_SIZE).unwrap();

        // Same offset resolves to the same physical page
        let a = arena.page_at(PAGE_SIZE).unwrap();
        let b = arena.page_at(PAGE_SIZE).unwrap();
        assert_eq!(a.index(), 1);
        assert_eq!(a.as_ptr(), b.as_ptr());

        // Any offset within a page resolves to that page
        let c = arena.page_at(PAGE_SIZE + 123).unwrap();
        assert_eq!(c.index(), 1);
        assert_eq!(c.as_ptr(), a.as_ptr());

        // Different pages have distinct, page-spaced backing
        let d = arena.page_at(3 * PAGE_SIZE).unwrap();
        assert_eq!(d.index(), 3);
        assert_eq!(d.as_ptr() as usize - a.as_ptr() as usize, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_bind_counts() {
        let arena = PageArena::new(0, 2 * PAGE_SIZE).unwrap();
        assert_eq!(arena.bind_count(0), 0);

        let a = arena.page_at(0).unwrap();
        assert_eq!(a.bind_count(), 1);

        let b = a.clone();
        assert_eq!(arena.bind_count(0), 2);

        drop(a);
        assert_eq!(arena.bind_count(0), 1);
        drop(b);
        assert_eq!(arena.bind_count(0), 0);

        // Failed lookups acquire nothing
        let _ = arena.page_at(5 * PAGE_SIZE);
        assert_eq!(arena.bind_count(0), 0);
        assert_eq!(arena.bind_count(1), 0);
    }

    #[test]
    fn test_page_read_write_shared() {
        let arena = PageArena::new(0, 2 * PAGE_SIZE).unwrap();

        let writer = arena.page_at(PAGE_SIZE).unwrap();
        unsafe {
            writer.as_mut_slice()[..5].copy_from_slice(b"hello");
        }

        // A second handle to the same page sees the write
        let reader = arena.page_at(PAGE_SIZE).unwrap();
        unsafe {
            assert_eq!(&reader.as_slice()[..5], b"hello");
        }

        // Page 0 is untouched
        let other = arena.page_at(0).unwrap();
        unsafe {
            assert!(other.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_arena_outlives_bind_counts() {
        // Storage validity is tied to the arena, not the bind count: a page
        // written while bound keeps its contents after the count drops to 0.
        let arena = PageArena::new(0, PAGE_SIZE).unwrap();
        {
            let page = arena.page_at(0).unwrap();
            unsafe { page.as_mut_slice()[0] = 42 };
        }
        assert_eq!(arena.bind_count(0), 0);
        let page = arena.page_at(0).unwrap();
        unsafe {
            assert_eq!(page.as_slice()[0], 42);
        }
    }
}
