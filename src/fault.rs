//! Fault resolution: offset translation and page binding.
//!
//! Given a mapping and a faulting page index, [`resolve`] computes the
//! absolute offset inside the device buffer and returns a handle to the
//! covering page. The caller (the address-space manager) binds the page at
//! the faulting virtual address; on failure it delivers an access violation
//! to the consumer instead.
//!
//! # Determinism
//!
//! Page lookup is a pure function of byte offset over the arena's immutable
//! layout, so resolving the same `(mapping, page index)` pair any number of
//! times — including re-faults after the caller evicted its binding —
//! yields handles to the same underlying page.
//!
//! # Fault accounting
//!
//! Attempts are counted, not successes: the mapping's fault counter
//! increments before the bounds check, so an out-of-range access still
//! shows up in the statistics.

use crate::arena::PageRef;
use crate::defaults::PAGE_SHIFT;
use crate::error::Result;
use crate::mapping::MappingDescriptor;
use crate::observability;

/// Largest page index whose byte offset fits in the address space.
const MAX_PAGE_INDEX: u64 = (usize::MAX as u64) >> PAGE_SHIFT;

/// Resolve a fault at `faulting_page_index` within `mapping`.
///
/// Computes `(faulting_page_index + page_offset_base) << PAGE_SHIFT` and
/// returns the page covering that byte offset, with its bind count
/// acquired. The index is mapping-relative, non-negative, and page-aligned
/// by construction of the caller; no bounds check happens here beyond
/// delegating to the arena, which reports
/// [`Error::OutOfRange`](crate::Error::OutOfRange) for offsets past the
/// buffer.
///
/// Fails with [`Error::MappingDestroyed`](crate::Error::MappingDestroyed)
/// if the mapping's teardown has begun; the attempt is then not counted.
pub fn resolve(mapping: &MappingDescriptor, faulting_page_index: u64) -> Result<PageRef> {
    let _gate = mapping.begin_resolve()?;

    let faults = mapping.record_fault();

    // Offsets past the address space cannot land inside any arena; fold
    // them into the same out-of-range failure the arena reports.
    let byte_offset = faulting_page_index
        .checked_add(mapping.page_offset_base())
        .filter(|&page| page <= MAX_PAGE_INDEX)
        .map(|page| (page as usize) << PAGE_SHIFT)
        .unwrap_or(usize::MAX);

    match mapping.arena().page_at(byte_offset) {
        Ok(page) => {
            tracing::trace!(
                device_id = mapping.device_id(),
                faulting_page_index,
                page = page.index(),
                faults,
                "fault resolved"
            );
            observability::record_fault_resolved(mapping.device_id());
            Ok(page)
        }
        Err(err) => {
            tracing::warn!(
                device_id = mapping.device_id(),
                faulting_page_index,
                byte_offset,
                "fault beyond device buffer"
            );
            observability::record_fault_failed(mapping.device_id());
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::PAGE_SIZE;
    use crate::error::Error;
    use crate::mapping::MappingFlags;
    use crate::registry::{BufferHandle, DeviceRegistry};
    use std::sync::Arc;

    fn two_page_handle() -> BufferHandle {
        DeviceRegistry::new(2 * PAGE_SIZE).unwrap().open(0).unwrap()
    }

    #[test]
    fn test_resolve_two_page_buffer() {
        // Buffer of 8192 bytes (2 pages), base 0: indices 0 and 1 resolve,
        // index 2 is past the buffer.
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let page0 = resolve(&mapping, 0).unwrap();
        assert_eq!(page0.index(), 0);

        let page1 = resolve(&mapping, 1).unwrap();
        assert_eq!(page1.index(), 1);

        let err = resolve(&mapping, 2).unwrap_err();
        match err {
            Error::OutOfRange { offset, len } => {
                assert_eq!(offset, 2 * PAGE_SIZE);
                assert_eq!(len, 2 * PAGE_SIZE);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_honors_offset_base() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 1, MappingFlags::default());

        // Index 0 of the mapping is page 1 of the buffer
        let page = resolve(&mapping, 0).unwrap();
        assert_eq!(page.index(), 1);

        // Index 1 is already past the 2-page buffer
        assert!(matches!(
            resolve(&mapping, 1),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_resolve_idempotent() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let first = resolve(&mapping, 1).unwrap();
        let second = resolve(&mapping, 1).unwrap();
        let third = resolve(&mapping, 1).unwrap();

        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(second.as_ptr(), third.as_ptr());
    }

    #[test]
    fn test_fault_counter_counts_attempts() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());
        assert_eq!(mapping.fault_count(), 0);

        let _a = resolve(&mapping, 0).unwrap();
        assert_eq!(mapping.fault_count(), 1);

        // Failed attempts count too
        let _ = resolve(&mapping, 7);
        assert_eq!(mapping.fault_count(), 2);

        let _b = resolve(&mapping, 1).unwrap();
        assert_eq!(mapping.fault_count(), 3);
    }

    #[test]
    fn test_resolve_acquires_bind_count() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let page = resolve(&mapping, 0).unwrap();
        assert_eq!(page.bind_count(), 1);

        let again = resolve(&mapping, 0).unwrap();
        assert_eq!(page.bind_count(), 2);

        drop(again);
        drop(page);
        assert_eq!(handle.arena().bind_count(0), 0);
    }

    #[test]
    fn test_resolve_out_of_range_leaves_bind_counts() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let _ = resolve(&mapping, 2);
        assert_eq!(handle.arena().bind_count(0), 0);
        assert_eq!(handle.arena().bind_count(1), 0);
    }

    #[test]
    fn test_resolve_index_overflow_is_out_of_range() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, u64::MAX - 1, MappingFlags::default());

        assert!(matches!(
            resolve(&mapping, 2),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            resolve(&mapping, u64::MAX),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_resolve_destroyed_mapping_not_counted() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let _ = resolve(&mapping, 0).unwrap();
        mapping.mark_destroyed().unwrap();

        assert!(matches!(
            resolve(&mapping, 0),
            Err(Error::MappingDestroyed)
        ));
        // The rejected call is not a fault attempt
        assert_eq!(mapping.fault_count(), 1);
    }

    #[test]
    fn test_two_mappings_share_pages() {
        let handle = two_page_handle();
        let first = MappingDescriptor::new(&handle, 0, MappingFlags::default());
        let second = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let via_first = resolve(&first, 0).unwrap();
        let via_second = resolve(&second, 0).unwrap();

        // Shared backing, not copies
        assert_eq!(via_first.as_ptr(), via_second.as_ptr());

        // And each mapping's statistics stay its own
        assert_eq!(first.fault_count(), 1);
        assert_eq!(second.fault_count(), 1);
    }

    #[test]
    fn test_concurrent_resolves() {
        let handle = two_page_handle();
        let mapping = MappingDescriptor::new(&handle, 0, MappingFlags::default());

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mapping = Arc::clone(&mapping);
                std::thread::spawn(move || {
                    for index in 0..50 {
                        let page = resolve(&mapping, index % 2).unwrap();
                        assert_eq!(page.index(), (index % 2) as usize);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(mapping.fault_count(), 4 * 50);
        // Every handle dropped: nothing left bound
        assert_eq!(handle.arena().bind_count(0), 0);
        assert_eq!(handle.arena().bind_count(1), 0);
    }
}
