//! Intra-node barriers
//!
//! A family of barriers indexed by online node: `wait(worker)` blocks
//! until every worker mapped to the same node has arrived. Each
//! barrier's words are placed in storage obtained from the bind
//! allocator and pre-touched, so the lines being spun on stay local to
//! the node they synchronise. This is distinct from the whole-pool
//! barrier the touch pass uses.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use static_assertions::const_assert;

use crate::alloc::Allocator;
use crate::error::{Error, Result};
use crate::mapping::MappingTable;

/// One sense-reversing barrier, padded so the arrival and generation
/// words never share a line with neighbouring data
#[repr(C)]
struct BarrierLine {
    /// Workers that must arrive each round
    lnp: usize,
    arrived: CachePadded<AtomicUsize>,
    generation: CachePadded<AtomicUsize>,
}

const_assert!(std::mem::align_of::<BarrierLine>() >= 64);

impl BarrierLine {
    fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.lnp {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.store(generation.wrapping_add(1), Ordering::Release);
        } else {
            let mut spins = 0u32;
            while self.generation.load(Ordering::Acquire) == generation {
                spins += 1;
                if spins < 1 << 12 {
                    std::hint::spin_loop();
                } else {
                    // Oversubscribed pool; give the releasing worker a slot.
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// The per-online-node barrier family
#[derive(Default)]
pub struct NodeBarrierSet {
    /// Barrier storage base per online node, inside bind-allocated
    /// regions owned by the registry
    lines: Vec<usize>,
}

// SAFETY: the pointed-to lines are plain atomics inside registry-owned
// storage that outlives this set (it is cleared before the registry
// drains).
unsafe impl Send for NodeBarrierSet {}
unsafe impl Sync for NodeBarrierSet {}

impl NodeBarrierSet {
    /// An empty family; `wait` fails until `init` runs
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and arm one barrier per online node.
    ///
    /// Existing storage is re-armed in place when the node already has a
    /// line; counts follow the current table.
    pub fn init(&mut self, allocator: &Allocator, table: &MappingTable) -> Result<()> {
        let size = std::mem::size_of::<BarrierLine>();
        for node in 0..table.online_nodes() {
            if self.lines.len() <= node {
                let platform_node = table.online_node_id(node);
                let addr = allocator.alloc_bind_touched(size, platform_node)?;
                self.lines.push(addr.as_ptr() as usize);
            }
            let line = self.lines[node] as *mut BarrierLine;
            // SAFETY: the storage is at least size bytes, 2 MiB aligned
            // by the allocator, and no worker races init per the policy
            // contract.
            unsafe {
                line.write(BarrierLine {
                    lnp: table.online_cores(node),
                    arrived: CachePadded::new(AtomicUsize::new(0)),
                    generation: CachePadded::new(AtomicUsize::new(0)),
                });
            }
        }
        self.lines.truncate(table.online_nodes());
        Ok(())
    }

    /// Drop every line pointer; storage reclamation belongs to the
    /// registry
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Number of armed barriers
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when no barrier is armed
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Block until every worker of `worker`'s node has arrived.
    ///
    /// Must be called from within the pool, once per worker per round.
    pub fn wait(&self, table: &MappingTable, worker: usize) -> Result<()> {
        let node = table.numainfo(worker).node;
        let &addr = self
            .lines
            .get(node)
            .ok_or(Error::InvalidOperation("node barriers not initialised"))?;
        // SAFETY: init armed this line and the registry keeps the
        // storage alive while the set is non-empty.
        let line = unsafe { &*(addr as *const BarrierLine) };
        line.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, HeapBackend};
    use crate::online::OnlineSet;
    use crate::policy::{AffinityMode, Mapping};
    use crate::topology::Topology;

    fn fixture(workers: usize) -> (Allocator, MappingTable) {
        let topology = Topology::uniform(2, 2, 2);
        let online = OnlineSet::all(&topology, AffinityMode::Library);
        let table = MappingTable::build(&topology, &online, workers, Mapping::Scatter, false);
        let allocator = Allocator::new(Box::new(HeapBackend::new(4096)), 2, 0);
        (allocator, table)
    }

    #[test]
    fn init_arms_one_line_per_node() {
        let (allocator, table) = fixture(8);
        let mut barriers = NodeBarrierSet::new();
        barriers.init(&allocator, &table).unwrap();
        assert_eq!(barriers.len(), 2);
        // The storage is registered and already touched.
        assert_eq!(allocator.registry().len(), 2);
        assert_eq!(allocator.registry().count_untouched(), 0);
    }

    #[test]
    fn wait_before_init_fails() {
        let (_, table) = fixture(4);
        let barriers = NodeBarrierSet::new();
        assert!(barriers.wait(&table, 0).is_err());
    }

    #[test]
    fn single_worker_node_never_blocks() {
        let (allocator, table) = fixture(2);
        let mut barriers = NodeBarrierSet::new();
        barriers.init(&allocator, &table).unwrap();
        for _ in 0..3 {
            barriers.wait(&table, 0).unwrap();
            barriers.wait(&table, 1).unwrap();
        }
    }

    #[test]
    fn synchronises_workers_of_one_node() {
        let (allocator, table) = fixture(8);
        let mut barriers = NodeBarrierSet::new();
        barriers.init(&allocator, &table).unwrap();
        let rounds = 50;
        std::thread::scope(|s| {
            for worker in 0..table.num_workers() {
                let barriers = &barriers;
                let table = &table;
                s.spawn(move || {
                    for _ in 0..rounds {
                        barriers.wait(table, worker).unwrap();
                    }
                });
            }
        });
    }

    #[test]
    fn reinit_reuses_storage() {
        let (allocator, table) = fixture(8);
        let mut barriers = NodeBarrierSet::new();
        barriers.init(&allocator, &table).unwrap();
        let before = allocator.registry().len();
        barriers.init(&allocator, &table).unwrap();
        assert_eq!(allocator.registry().len(), before);
    }
}
