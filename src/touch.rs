//! Parallel first-touch
//!
//! Walks the registry for untouched regions and faults their pages from
//! the workers that own the target nodes: the OS places each page on
//! the node of the thread that first writes it. Each region is
//! partitioned across the workers whose node is in its mask; a shared
//! counter assigns partition slots, and whole-pool barriers fence the
//! counter reset, the touches, and the touched-flag write. Regions no
//! worker claims fall back to a flat partition across the whole pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::binder::Binder;
use crate::mapping::MappingTable;
use crate::policy::Binding;
use crate::region::Region;
use crate::registry::Registry;
use crate::topology::Topology;

/// Write one byte per page over `[ptr, ptr + len)`.
///
/// # Safety
/// The caller must own the range and no other thread may be reading it.
pub(crate) unsafe fn touch_seq(ptr: *mut u8, len: usize) {
    let stride = page_size::get().max(1);
    let mut offset = 0;
    while offset < len {
        // Volatile so the faulting store is not elided.
        unsafe { ptr.add(offset).write_volatile(u8::MAX) };
        offset += stride;
    }
}

/// Evenly partition `len` items over `nparts`, returning the half-open
/// slice of partition `part`. Remainders go to the leading partitions.
pub(crate) fn prange(len: usize, nparts: usize, part: usize) -> (usize, usize) {
    let quota = len / nparts;
    let remainder = len % nparts;
    let start = quota * part + part.min(remainder);
    let end = quota * (part + 1) + (part + 1).min(remainder);
    (start, end)
}

/// Count the workers whose node is set in the region's mask.
fn participant_count(table: &MappingTable, topology: &Topology, region: &Region) -> usize {
    (0..table.num_workers())
        .filter(|&w| {
            let ni = table.numainfo(w);
            region.nodemask.contains(topology.cpuinfo(ni.proc).node)
        })
        .count()
}

/// Touch every untouched region from the matching nodes.
///
/// Dispatches one thread per worker slot; each binds itself before
/// touching so the faults land where the worker will run. Returns once
/// no registered region is left untouched.
pub fn touch_all(
    topology: &Topology,
    table: &MappingTable,
    binder: &Binder,
    binding: Binding,
    registry: &Registry,
    verbose: u8,
) {
    let items: Vec<Arc<Region>> = registry.snapshot_untouched();
    if items.is_empty() {
        return;
    }
    let workers = table.num_workers();
    let pool = Barrier::new(workers);
    let claimed = CachePadded::new(AtomicUsize::new(0));

    std::thread::scope(|s| {
        for worker in 0..workers {
            let items = &items;
            let pool = &pool;
            let claimed = &claimed;
            s.spawn(move || {
                // A bind failure only costs locality, never correctness.
                let _ = binder.bind_thread(topology, table, binding, worker);
                let my_node = topology.cpuinfo(table.numainfo(worker).proc).node;

                for region in items {
                    if worker == 0 {
                        claimed.store(0, Ordering::Relaxed);
                    }
                    pool.wait();
                    if region.nodemask.contains(my_node) {
                        let slot = claimed.fetch_add(1, Ordering::Relaxed);
                        let nparts = participant_count(table, topology, region);
                        let (start, end) = prange(region.bytes, nparts, slot);
                        // SAFETY: slices from prange are disjoint per
                        // slot and the region is live for the walk.
                        unsafe {
                            touch_seq((region.addr + start) as *mut u8, end - start);
                        }
                        if slot == 0 {
                            region.mark_touched();
                            if verbose >= 3 {
                                trace!(worker, region = %region, "touched");
                            }
                        }
                    }
                    pool.wait();
                }
            });
        }
    });

    // Fallback: flat partition for regions whose mask matched no worker.
    let leftover: Vec<Arc<Region>> = items.iter().filter(|r| !r.is_touched()).cloned().collect();
    if leftover.is_empty() {
        return;
    }
    std::thread::scope(|s| {
        for worker in 0..workers {
            let leftover = &leftover;
            s.spawn(move || {
                for region in leftover {
                    let (start, end) = prange(region.bytes, workers, worker);
                    // SAFETY: disjoint slices per worker, live region.
                    unsafe {
                        touch_seq((region.addr + start) as *mut u8, end - start);
                    }
                }
            });
        }
    });
    for region in &leftover {
        region.mark_touched();
        if verbose >= 3 {
            trace!(region = %region, "touched in fallback pass");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, HeapBackend};
    use crate::online::OnlineSet;
    use crate::policy::{AffinityMode, Mapping};

    #[test]
    fn prange_covers_without_overlap() {
        for len in [0usize, 1, 7, 4096, 4097] {
            for nparts in 1..=8 {
                let mut total = 0;
                let mut prev_end = 0;
                for part in 0..nparts {
                    let (start, end) = prange(len, nparts, part);
                    assert_eq!(start, prev_end);
                    assert!(end >= start);
                    total += end - start;
                    prev_end = end;
                }
                assert_eq!(total, len);
                assert_eq!(prev_end, len);
            }
        }
    }

    #[test]
    fn prange_leading_parts_take_remainder() {
        let (s0, e0) = prange(10, 4, 0);
        let (s3, e3) = prange(10, 4, 3);
        assert_eq!((s0, e0), (0, 3));
        assert_eq!((s3, e3), (8, 10));
    }

    #[test]
    fn touch_seq_writes_each_page() {
        let len = page_size::get() * 3 + 17;
        let mut buf = vec![0u8; len];
        unsafe { touch_seq(buf.as_mut_ptr(), len) };
        assert_eq!(buf[0], u8::MAX);
        assert_eq!(buf[page_size::get()], u8::MAX);
        assert_eq!(buf[page_size::get() * 2], u8::MAX);
    }

    #[test]
    fn touch_all_flips_every_flag() {
        let topology = crate::topology::Topology::uniform(2, 2, 2);
        let online = OnlineSet::all(&topology, AffinityMode::Library);
        let table = MappingTable::build(&topology, &online, 8, Mapping::Scatter, false);
        let binder = Binder::new(8, AffinityMode::Library, true);
        let allocator = Allocator::new(Box::new(HeapBackend::new(4096)), 2, 0);

        allocator.alloc_bind(1 << 20, 0).unwrap();
        allocator.alloc_bind(1 << 20, 1).unwrap();
        allocator.alloc_interleave(1 << 20, [0, 1]).unwrap();
        assert_eq!(allocator.registry().count_untouched(), 3);

        touch_all(&topology, &table, &binder, Binding::Core, allocator.registry(), 0);
        assert_eq!(allocator.registry().count_untouched(), 0);
    }

    #[test]
    fn touch_all_handles_unclaimed_masks() {
        let topology = crate::topology::Topology::uniform(2, 2, 2);
        let online = OnlineSet::all(&topology, AffinityMode::Library);
        // Only node 0 has workers; a region bound to node 1 takes the
        // fallback path.
        let table = MappingTable::build(&topology, &online, 4, Mapping::Compact, false);
        let binder = Binder::new(4, AffinityMode::Library, true);
        let allocator = Allocator::new(Box::new(HeapBackend::new(4096)), 2, 0);
        allocator.alloc_bind(1 << 20, 1).unwrap();

        touch_all(&topology, &table, &binder, Binding::Core, allocator.registry(), 0);
        assert_eq!(allocator.registry().count_untouched(), 0);
    }

    #[test]
    fn touch_all_on_empty_registry_is_noop() {
        let topology = crate::topology::Topology::uniform(1, 2, 1);
        let online = OnlineSet::all(&topology, AffinityMode::Library);
        let table = MappingTable::build(&topology, &online, 2, Mapping::Scatter, false);
        let binder = Binder::new(2, AffinityMode::Library, true);
        let allocator = Allocator::new(Box::new(HeapBackend::new(4096)), 1, 0);
        touch_all(&topology, &table, &binder, Binding::Core, allocator.registry(), 0);
    }
}
