//! Runtime handle
//!
//! [`Runtime`] is the opaque handle over the whole machinery: the
//! topology inventory, the online set, the policy state with its
//! mapping table and binder, the allocator with its region registry,
//! and the node barriers. Initialisation runs those stages in order;
//! everything afterwards goes through the handle.

use std::ptr::NonNull;

use parking_lot::RwLock;
use tracing::debug;

use crate::alloc::{Allocator, HeapBackend};
use crate::barrier::NodeBarrierSet;
use crate::binder::{Binder, Rebind};
use crate::config::Config;
use crate::error::Result;
use crate::mapping::{MappingTable, NumaInfo};
use crate::online::OnlineSet;
use crate::policy::{AffinityMode, Binding, Mapping};
use crate::rangelist::parse_rangelist;
use crate::region::{MemPolicy, NodeMask};
use crate::registry::Registry;
use crate::topology::{CpuInfo, Topology};
use crate::touch;

/// Configures and builds a [`Runtime`]
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    affinity: Option<(Mapping, Binding)>,
    avoid_htcore: Option<bool>,
    threads: Option<usize>,
    proclist: Option<String>,
    membind: Option<String>,
    align_size: Option<usize>,
    verbose: Option<u8>,
    topology: Option<Topology>,
}

impl RuntimeBuilder {
    /// Create a builder; unset options fall back to the environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mapping and binding policy (enables library-driven
    /// placement)
    pub fn affinity(mut self, mapping: Mapping, binding: Binding) -> Self {
        self.affinity = Some((mapping, binding));
        self
    }

    /// Skip SMT-sibling processors when laying out workers
    pub fn avoid_htcore(mut self, avoid: bool) -> Self {
        self.avoid_htcore = Some(avoid);
        self
    }

    /// Worker count; capped by the online-processor count
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    /// Range list overriding the process affinity mask
    pub fn proclist(mut self, expr: impl Into<String>) -> Self {
        self.proclist = Some(expr.into());
        self
    }

    /// Default node range list for `alloc_mempol`
    pub fn membind(mut self, expr: impl Into<String>) -> Self {
        self.membind = Some(expr.into());
        self
    }

    /// Alignment override for allocations, in bytes
    pub fn align_size(mut self, bytes: usize) -> Self {
        self.align_size = Some(bytes);
        self
    }

    /// Diagnostic verbosity, 0..=3
    pub fn verbose(mut self, level: u8) -> Self {
        self.verbose = Some(level);
        self
    }

    /// Use a prepared topology instead of probing the host.
    ///
    /// Synthetic topologies keep all platform side effects off.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Probe the platform and initialise the runtime
    pub fn build(self) -> Result<Runtime> {
        let mut config = Config::from_env()?;
        if let Some(affinity) = self.affinity {
            config.affinity = Some(affinity);
        }
        if let Some(avoid) = self.avoid_htcore {
            config.avoid_htcore = avoid;
        }
        if let Some(threads) = self.threads {
            config.num_threads = Some(threads);
        }
        if let Some(proclist) = self.proclist {
            config.proclist = Some(proclist);
        }
        if let Some(membind) = self.membind {
            config.membind = Some(membind);
        }
        if let Some(align) = self.align_size {
            config.align_size = Some(align);
        }
        if let Some(verbose) = self.verbose {
            config.verbose = verbose;
        }
        Runtime::init(config, self.topology)
    }
}

struct PolicyState {
    mapping: Mapping,
    binding: Binding,
    table: MappingTable,
    binder: Binder,
    barriers: NodeBarrierSet,
}

/// The initialised NUMA runtime
pub struct Runtime {
    topology: Topology,
    online: OnlineSet,
    allocator: Allocator,
    membind_nodes: Option<Vec<usize>>,
    avoid_htcore: bool,
    verbose: u8,
    state: RwLock<PolicyState>,
}

impl Runtime {
    fn init(config: Config, topology: Option<Topology>) -> Result<Self> {
        let topology = match topology {
            Some(t) => t,
            None => Topology::probe(config.align_size)?,
        };
        let affinity_configured = config.affinity.is_some();
        let online = OnlineSet::detect(&topology, config.proclist.as_deref(), affinity_configured)?;
        let (mapping, binding) = config.affinity.unwrap_or_default();
        let nthreads = config.num_threads.unwrap_or(online.len()).min(online.len());
        let table = MappingTable::build(&topology, &online, nthreads, mapping, config.avoid_htcore);
        let binder = Binder::new(table.num_workers(), online.mode(), topology.is_synthetic());

        let backend: Box<dyn crate::alloc::AllocBackend> = alloc_backend(&topology);
        let allocator = Allocator::new(backend, topology.num_nodes(), config.verbose);

        let membind_nodes = match config.membind.as_deref() {
            Some(expr) => Some(parse_rangelist(expr)?),
            None => None,
        };

        let mut barriers = NodeBarrierSet::new();
        barriers.init(&allocator, &table)?;

        debug!(
            procs = topology.num_procs(),
            nodes = topology.num_nodes(),
            online = online.len(),
            workers = table.num_workers(),
            mapping = mapping.name(),
            binding = binding.name(),
            mode = ?online.mode(),
            backend = allocator.backend_name(),
            "runtime initialised"
        );

        Ok(Runtime {
            topology,
            online,
            allocator,
            membind_nodes,
            avoid_htcore: config.avoid_htcore,
            verbose: config.verbose,
            state: RwLock::new(PolicyState { mapping, binding, table, binder, barriers }),
        })
    }

    // ----- topology queries -----

    /// Number of logical processors
    pub fn num_procs(&self) -> usize {
        self.topology.num_procs()
    }

    /// Number of NUMA nodes
    pub fn num_nodes(&self) -> usize {
        self.topology.num_nodes()
    }

    /// Number of physical cores
    pub fn num_cores(&self) -> usize {
        self.topology.num_cores()
    }

    /// Number of SMT lanes
    pub fn num_smts(&self) -> usize {
        self.topology.num_smts()
    }

    /// Page size of a node in bytes
    pub fn page_size(&self, node: usize) -> usize {
        self.topology.page_size(node)
    }

    /// Memory size of a node in bytes
    pub fn memory_size(&self, node: usize) -> usize {
        self.topology.memory_size(node)
    }

    /// Sum of all node memory sizes
    pub fn total_memory_size(&self) -> usize {
        self.topology.total_memory_size()
    }

    /// Allocation alignment in bytes
    pub fn align_size(&self) -> usize {
        self.topology.align_size()
    }

    /// Processor record by index; out-of-range indices wrap
    pub fn cpuinfo(&self, proc_idx: usize) -> CpuInfo {
        self.topology.cpuinfo(proc_idx)
    }

    /// The probed topology tables
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    // ----- online set and mapping queries -----

    /// Number of workers the current policy maps
    pub fn online_procs(&self) -> usize {
        self.state.read().table.num_workers()
    }

    /// Number of processors the process may use
    pub fn max_online_procs(&self) -> usize {
        self.online.len()
    }

    /// Number of online nodes under the current policy
    pub fn online_nodes(&self) -> usize {
        self.state.read().table.online_nodes()
    }

    /// Workers on an online node
    pub fn online_cores(&self, node: usize) -> usize {
        self.state.read().table.online_cores(node)
    }

    /// Platform node id of an online node
    pub fn online_node_id(&self, node: usize) -> usize {
        self.state.read().table.online_node_id(node)
    }

    /// Worker placement record; out-of-range worker indices wrap
    pub fn numainfo(&self, worker: usize) -> NumaInfo {
        self.state.read().table.numainfo(worker)
    }

    /// The affinity mode in effect
    pub fn affinity_mode(&self) -> AffinityMode {
        self.online.mode()
    }

    /// Current mapping policy
    pub fn current_mapping(&self) -> Mapping {
        self.state.read().mapping
    }

    /// Current binding policy
    pub fn current_binding(&self) -> Binding {
        self.state.read().binding
    }

    /// Name of the current mapping policy; `"disable"` when placement
    /// is off
    pub fn mapping_name(&self) -> &'static str {
        if self.affinity_mode() == AffinityMode::Off {
            "disable"
        } else {
            self.current_mapping().name()
        }
    }

    /// Name of the current binding policy; `"disable"` when placement
    /// is off
    pub fn binding_name(&self) -> &'static str {
        if self.affinity_mode() == AffinityMode::Off {
            "disable"
        } else {
            self.current_binding().name()
        }
    }

    // ----- policy control -----

    /// Reinitialise the worker table, binder and barriers for a new
    /// policy.
    ///
    /// Callers must ensure no worker is mid-bind or inside a barrier.
    pub fn set_affinity_policy(&self, nthreads: usize, mapping: Mapping, binding: Binding) -> Result<()> {
        let mut state = self.state.write();
        let nthreads = nthreads.min(self.online.len());
        let table =
            MappingTable::build(&self.topology, &self.online, nthreads, mapping, self.avoid_htcore);
        let binder = state.binder.rebuild(table.num_workers());
        state.table = table;
        state.binder = binder;
        state.mapping = mapping;
        state.binding = binding;
        let PolicyState { barriers, table, .. } = &mut *state;
        barriers.init(&self.allocator, table)?;
        debug!(workers = table.num_workers(), mapping = mapping.name(), binding = binding.name(), "policy changed");
        Ok(())
    }

    /// Change the worker count, keeping the current policy
    pub fn set_num_threads(&self, nthreads: usize) -> Result<()> {
        let (mapping, binding) = {
            let state = self.state.read();
            (state.mapping, state.binding)
        };
        self.set_affinity_policy(nthreads, mapping, binding)
    }

    // ----- thread binding -----

    /// Pin the calling thread to `worker`'s processor set
    pub fn bind_thread(&self, worker: usize) -> Result<()> {
        let state = self.state.read();
        state.binder.bind_thread(&self.topology, &state.table, state.binding, worker)
    }

    /// Rebind the calling thread only if its live set diverged
    pub fn check_and_rebind(&self, worker: usize) -> Result<Rebind> {
        let state = self.state.read();
        state.binder.check_and_rebind(&self.topology, &state.table, state.binding, worker)
    }

    /// Restore the calling thread's pre-bind processor set
    pub fn unbind_thread(&self, worker: usize) -> Result<()> {
        self.state.read().binder.unbind_thread(worker)
    }

    /// Whether `proc_id` is in `worker`'s bind set
    pub fn is_bound(&self, worker: usize, proc_id: usize) -> bool {
        self.state.read().binder.is_bound(worker, proc_id)
    }

    /// Successful binds performed by `worker`
    pub fn num_binds(&self, worker: usize) -> u64 {
        self.state.read().binder.num_binds(worker)
    }

    // ----- allocation -----

    /// Allocate `size` bytes bound to an online node
    pub fn alloc_bind(&self, size: usize, online_node: usize) -> Result<NonNull<u8>> {
        let platform_node = self.state.read().table.online_node_id(online_node);
        self.allocator.alloc_bind(size, platform_node)
    }

    /// Allocate bound to an online node and fault every page in place
    pub fn alloc_bind_touched(&self, size: usize, online_node: usize) -> Result<NonNull<u8>> {
        let platform_node = self.state.read().table.online_node_id(online_node);
        self.allocator.alloc_bind_touched(size, platform_node)
    }

    /// Allocate interleaved across all online nodes
    pub fn alloc_interleave(&self, size: usize) -> Result<NonNull<u8>> {
        let nodes = self.state.read().table.node_map().to_vec();
        self.allocator.alloc_interleave(size, nodes)
    }

    /// Allocate with `policy` over the configured default node mask
    /// (`NUMABIND_MEMBIND`), or all online nodes when none is configured
    pub fn alloc_mempol(&self, size: usize, policy: MemPolicy) -> Result<NonNull<u8>> {
        let nodes = match &self.membind_nodes {
            Some(nodes) => nodes.clone(),
            None => self.state.read().table.node_map().to_vec(),
        };
        self.allocator.alloc_mempol(size, policy, nodes)
    }

    /// Allocate with a caller-supplied policy and platform node mask
    pub fn alloc_explicit(&self, size: usize, policy: MemPolicy, mask: NodeMask) -> Result<NonNull<u8>> {
        self.allocator.alloc_explicit(size, policy, mask)
    }

    /// Release one region; unknown addresses and null are no-ops
    pub fn free(&self, addr: *mut u8) {
        self.allocator.free(addr)
    }

    /// Release every region and disarm the node barriers
    pub fn all_free(&self) {
        self.state.write().barriers.clear();
        self.allocator.all_free();
    }

    /// The live region registry
    pub fn registry(&self) -> &Registry {
        self.allocator.registry()
    }

    // ----- first touch and accounting -----

    /// Fault the pages of every untouched region from the matching
    /// nodes. Returns once no registered region is left untouched.
    pub fn touch_all(&self) {
        let state = self.state.read();
        touch::touch_all(
            &self.topology,
            &state.table,
            &state.binder,
            state.binding,
            self.allocator.registry(),
            self.verbose,
        );
    }

    /// Per-node usage: each region spreads its size evenly over its
    /// masked nodes. Returns the per-node vector (indexed by platform
    /// node id, `maxnode` entries) and its sum.
    pub fn memory_usage(&self, maxnode: usize) -> (Vec<usize>, usize) {
        self.allocator.registry().memory_usage(maxnode)
    }

    /// Total bytes attributed across all nodes
    pub fn memory_usage_total(&self) -> usize {
        self.allocator.registry().memory_usage(self.topology.num_nodes()).1
    }

    // ----- barriers -----

    /// Block until every worker of `worker`'s node has arrived
    pub fn node_barrier(&self, worker: usize) -> Result<()> {
        let state = self.state.read();
        state.barriers.wait(&state.table, worker)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.all_free();
    }
}

fn alloc_backend(topology: &Topology) -> Box<dyn crate::alloc::AllocBackend> {
    #[cfg(target_os = "linux")]
    {
        if !topology.is_synthetic() {
            return Box::new(crate::alloc::MbindBackend);
        }
    }
    Box::new(HeapBackend::new(topology.align_size()))
}
