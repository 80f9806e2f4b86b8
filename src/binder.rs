//! Thread binder
//!
//! Applies the mapping table to the running worker pool. Each worker
//! slot keeps three processor sets: the set in effect when the worker
//! first bound (restored by unbind), the set the worker should be pinned
//! to, and — sampled on demand — the set the OS reports. A per-slot
//! counter records successful binds.
//!
//! Every operation here runs on the calling thread and must be invoked
//! from the worker the index names; the library never owns the pool.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[cfg(target_os = "linux")]
use crate::error::Error;
use crate::error::Result;
use crate::mapping::MappingTable;
use crate::policy::{AffinityMode, Binding};
use crate::procset::ProcSet;
use crate::topology::Topology;

/// Outcome of a [`Binder::check_and_rebind`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebind {
    /// The live set already matched the target
    Unchanged,
    /// The live set diverged and the worker was re-bound
    Rebound,
}

#[derive(Debug, Default)]
struct WorkerSlot {
    /// Affinity in effect before the first bind; restored by unbind
    default_set: Mutex<Option<ProcSet>>,
    /// The set this worker should currently be pinned to
    bind_set: Mutex<ProcSet>,
    num_binds: AtomicU64,
}

/// Per-worker bind state for one policy generation
#[derive(Debug)]
pub struct Binder {
    slots: Vec<WorkerSlot>,
    mode: AffinityMode,
    /// Synthetic topologies never reach the platform primitive
    dry_run: bool,
}

impl Binder {
    /// Create bind state for `workers` worker slots
    pub fn new(workers: usize, mode: AffinityMode, dry_run: bool) -> Self {
        let slots = (0..workers.max(1)).map(|_| WorkerSlot::default()).collect();
        Binder { slots, mode, dry_run }
    }

    /// Rebuild for a new policy generation, carrying bind counters and
    /// sampled default sets over for surviving worker indices
    pub fn rebuild(&self, workers: usize) -> Self {
        let next = Binder::new(workers, self.mode, self.dry_run);
        for (old, new) in self.slots.iter().zip(&next.slots) {
            new.num_binds.store(old.num_binds.load(Ordering::Relaxed), Ordering::Relaxed);
            *new.default_set.lock() = old.default_set.lock().clone();
        }
        next
    }

    /// Number of worker slots
    pub fn num_workers(&self) -> usize {
        self.slots.len()
    }

    /// The affinity mode this binder operates under
    pub fn mode(&self) -> AffinityMode {
        self.mode
    }

    /// Compute the processor set `worker` should be pinned to.
    ///
    /// Core binds to the worker's single processor; physcore widens to
    /// every online SMT sibling of its core; socket widens to every
    /// online processor on its node.
    pub fn target_set(
        &self,
        topology: &Topology,
        table: &MappingTable,
        binding: Binding,
        worker: usize,
    ) -> ProcSet {
        let ni = table.numainfo(worker);
        let me = topology.cpuinfo(ni.proc);
        match binding {
            Binding::Core => ProcSet::from_ids([me.id]),
            Binding::PhysCore => ProcSet::from_ids(
                table
                    .order()
                    .iter()
                    .map(|&p| topology.cpuinfo(p))
                    .filter(|ci| ci.node == me.node && ci.core == me.core)
                    .map(|ci| ci.id),
            ),
            Binding::Socket => ProcSet::from_ids(
                table
                    .order()
                    .iter()
                    .map(|&p| topology.cpuinfo(p))
                    .filter(|ci| ci.node == me.node)
                    .map(|ci| ci.id),
            ),
        }
    }

    /// Pin the calling thread to its worker's target set.
    ///
    /// A no-op unless placement is library-driven. On success the target
    /// becomes the worker's bind set and the bind counter advances; a
    /// platform rejection is surfaced and changes nothing.
    pub fn bind_thread(
        &self,
        topology: &Topology,
        table: &MappingTable,
        binding: Binding,
        worker: usize,
    ) -> Result<()> {
        if self.mode != AffinityMode::Library {
            return Ok(());
        }
        let worker = worker % self.slots.len();
        let slot = &self.slots[worker];
        let target = self.target_set(topology, table, binding, worker);
        if target.is_empty() {
            return Ok(());
        }
        {
            let mut default_set = slot.default_set.lock();
            if default_set.is_none() {
                *default_set = Some(current_affinity(topology, self.dry_run));
            }
        }
        apply_affinity(&target, worker, self.dry_run)?;
        *slot.bind_set.lock() = target;
        slot.num_binds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sample the live set; rebind only when it diverged from the target
    pub fn check_and_rebind(
        &self,
        topology: &Topology,
        table: &MappingTable,
        binding: Binding,
        worker: usize,
    ) -> Result<Rebind> {
        if self.mode != AffinityMode::Library {
            return Ok(Rebind::Unchanged);
        }
        let worker = worker % self.slots.len();
        let slot = &self.slots[worker];
        // Without a platform primitive the live set is whatever the last
        // bind recorded.
        let current = if self.dry_run {
            slot.bind_set.lock().clone()
        } else {
            current_affinity(topology, self.dry_run)
        };
        let matches = {
            let bind_set = slot.bind_set.lock();
            !bind_set.is_empty() && *bind_set == current
        };
        if matches {
            Ok(Rebind::Unchanged)
        } else {
            self.bind_thread(topology, table, binding, worker)?;
            Ok(Rebind::Rebound)
        }
    }

    /// Restore the calling thread to the set in effect before its first
    /// bind. The bind set is left intact.
    pub fn unbind_thread(&self, worker: usize) -> Result<()> {
        if self.mode != AffinityMode::Library {
            return Ok(());
        }
        let worker = worker % self.slots.len();
        let default_set = self.slots[worker].default_set.lock();
        match default_set.as_ref() {
            Some(set) if !set.is_empty() => apply_affinity(set, worker, self.dry_run),
            _ => Ok(()),
        }
    }

    /// Whether `proc_id` is in the worker's bind set
    pub fn is_bound(&self, worker: usize, proc_id: usize) -> bool {
        let worker = worker % self.slots.len();
        self.slots[worker].bind_set.lock().contains(proc_id)
    }

    /// Successful binds performed by this worker
    pub fn num_binds(&self, worker: usize) -> u64 {
        let worker = worker % self.slots.len();
        self.slots[worker].num_binds.load(Ordering::Relaxed)
    }
}

/// Pin the calling thread to `set` via the platform primitive.
fn apply_affinity(set: &ProcSet, worker: usize, dry_run: bool) -> Result<()> {
    if dry_run {
        return Ok(());
    }
    #[cfg(target_os = "linux")]
    {
        let cpuset = set.to_cpu_set();
        // SAFETY: pid 0 names the calling thread; the set is a value we
        // built above.
        let rc = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset)
        };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(Error::BindFailed { worker, errno });
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (set, worker);
        Ok(())
    }
}

/// The calling thread's live affinity set.
fn current_affinity(topology: &Topology, dry_run: bool) -> ProcSet {
    if dry_run {
        return ProcSet::new();
    }
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getaffinity fills the set on success.
        let mut cpuset: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut cpuset)
        };
        if rc == 0 {
            return ProcSet::from_cpu_set(&cpuset, topology.num_procs());
        }
        ProcSet::new()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = topology;
        ProcSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::online::OnlineSet;
    use crate::policy::Mapping;

    fn fixture() -> (Topology, MappingTable) {
        let topology = Topology::uniform(2, 2, 2);
        let online = OnlineSet::all(&topology, AffinityMode::Library);
        let table = MappingTable::build(&topology, &online, 8, Mapping::Scatter, false);
        (topology, table)
    }

    #[test]
    fn core_binding_is_a_single_bit() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Library, true);
        let set = binder.target_set(&topology, &table, Binding::Core, 0);
        assert_eq!(set.len(), 1);
        assert!(set.contains(table.numainfo(0).proc));
    }

    #[test]
    fn socket_binding_covers_the_node() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Library, true);
        let set = binder.target_set(&topology, &table, Binding::Socket, 0);
        // Worker 0 sits on node 0; its socket set is processors 0-3.
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn physcore_binding_covers_smt_siblings() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Library, true);
        let me = topology.cpuinfo(table.numainfo(0).proc);
        let set = binder.target_set(&topology, &table, Binding::PhysCore, 0);
        assert_eq!(set.len(), 2);
        for id in set.iter() {
            let ci = topology.cpuinfo(id);
            assert_eq!((ci.node, ci.core), (me.node, me.core));
        }
    }

    #[test]
    fn bind_updates_state_and_counter() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Library, true);
        binder.bind_thread(&topology, &table, Binding::Core, 0).unwrap();
        assert!(binder.is_bound(0, table.numainfo(0).proc));
        assert_eq!(binder.num_binds(0), 1);
        binder.bind_thread(&topology, &table, Binding::Core, 0).unwrap();
        assert_eq!(binder.num_binds(0), 2);
    }

    #[test]
    fn bind_is_noop_when_affinity_off() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Off, true);
        binder.bind_thread(&topology, &table, Binding::Core, 0).unwrap();
        assert_eq!(binder.num_binds(0), 0);
        assert!(!binder.is_bound(0, table.numainfo(0).proc));
    }

    #[test]
    fn rebuild_preserves_counters() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Library, true);
        binder.bind_thread(&topology, &table, Binding::Core, 3).unwrap();
        let next = binder.rebuild(4);
        assert_eq!(next.num_binds(3), 1);
        assert_eq!(next.num_workers(), 4);
    }

    #[test]
    fn worker_index_wraps() {
        let (topology, table) = fixture();
        let binder = Binder::new(4, AffinityMode::Library, true);
        binder.bind_thread(&topology, &table, Binding::Core, 4).unwrap();
        assert_eq!(binder.num_binds(0), 1);
    }

    #[test]
    fn check_and_rebind_detects_equality() {
        let (topology, table) = fixture();
        let binder = Binder::new(8, AffinityMode::Library, true);
        let first = binder.check_and_rebind(&topology, &table, Binding::Core, 0).unwrap();
        assert_eq!(first, Rebind::Rebound);
        let second = binder.check_and_rebind(&topology, &table, Binding::Core, 0).unwrap();
        assert_eq!(second, Rebind::Unchanged);
        assert_eq!(binder.num_binds(0), 1);
    }

    #[test]
    fn unbind_without_bind_is_noop() {
        let (_, _) = fixture();
        let binder = Binder::new(2, AffinityMode::Library, true);
        binder.unbind_thread(0).unwrap();
    }
}
