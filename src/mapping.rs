//! Thread-to-processor mapping engine
//!
//! Turns the online set plus a mapping policy into the per-worker table:
//! which processor each worker index lands on, which online node that
//! is, and how many workers share the node. Scatter round-robins workers
//! across nodes; compact fills one node before moving on. Ties within a
//! node break by ascending core, then ascending SMT lane.

use crate::online::OnlineSet;
use crate::policy::Mapping;
use crate::topology::Topology;

/// Per-worker placement record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaInfo {
    /// Worker index, 0..N-1
    pub id: usize,
    /// Index into the processor table
    pub proc: usize,
    /// Index into the online-node list, 0..K-1
    pub node: usize,
    /// Dense core slot on the node, 0..lnp-1
    pub core: usize,
    /// Count of workers on this node
    pub lnp: usize,
}

/// The worker placement table for one policy
#[derive(Debug, Clone)]
pub struct MappingTable {
    entries: Vec<NumaInfo>,
    /// Online-node index to platform node id
    node_map: Vec<usize>,
    /// Workers per online node
    online_cores: Vec<usize>,
    /// Full policy ordering over the online set, for bind-set widening
    order: Vec<usize>,
}

impl MappingTable {
    /// Build the table for `nthreads` workers.
    ///
    /// The worker count is capped by the online-processor count (after
    /// the optional SMT filter); callers index beyond it wrap.
    pub fn build(
        topology: &Topology,
        online: &OnlineSet,
        nthreads: usize,
        mapping: Mapping,
        avoid_htcore: bool,
    ) -> Self {
        let order = policy_order(topology, online, mapping, avoid_htcore);
        let nthreads = nthreads.clamp(1, order.len().max(1));

        let mut node_map: Vec<usize> = Vec::new();
        let mut entries: Vec<NumaInfo> = Vec::with_capacity(nthreads);
        let mut online_cores: Vec<usize> = Vec::new();
        for (id, &proc_idx) in order.iter().take(nthreads).enumerate() {
            let platform_node = topology.cpuinfo(proc_idx).node;
            let node = match node_map.iter().position(|&n| n == platform_node) {
                Some(pos) => pos,
                None => {
                    node_map.push(platform_node);
                    online_cores.push(0);
                    node_map.len() - 1
                }
            };
            let core = online_cores[node];
            online_cores[node] += 1;
            entries.push(NumaInfo { id, proc: proc_idx, node, core, lnp: 0 });
        }
        for entry in &mut entries {
            entry.lnp = online_cores[entry.node];
        }

        MappingTable { entries, node_map, online_cores, order }
    }

    /// Worker placement record; out-of-range worker indices wrap
    pub fn numainfo(&self, worker: usize) -> NumaInfo {
        self.entries[worker % self.entries.len()]
    }

    /// Number of workers in the table
    pub fn num_workers(&self) -> usize {
        self.entries.len()
    }

    /// Number of online nodes
    pub fn online_nodes(&self) -> usize {
        self.node_map.len()
    }

    /// Workers on an online node; out-of-range node indices wrap
    pub fn online_cores(&self, node: usize) -> usize {
        self.online_cores[node % self.online_cores.len()]
    }

    /// Platform node id of an online node; out-of-range indices wrap
    pub fn online_node_id(&self, node: usize) -> usize {
        self.node_map[node % self.node_map.len()]
    }

    /// Platform node ids of all online nodes, in online order
    pub fn node_map(&self) -> &[usize] {
        &self.node_map
    }

    /// The full policy ordering over the online set
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

/// Order the online processors per the mapping policy.
fn policy_order(
    topology: &Topology,
    online: &OnlineSet,
    mapping: Mapping,
    avoid_htcore: bool,
) -> Vec<usize> {
    let mut procs: Vec<usize> = online
        .procs()
        .iter()
        .copied()
        .filter(|&p| !avoid_htcore || topology.cpuinfo(p).smt == 0)
        .collect();
    if procs.is_empty() {
        procs = online.procs().to_vec();
    }

    // Group by platform node, each group sorted by (core, smt).
    let mut node_ids: Vec<usize> = procs.iter().map(|&p| topology.cpuinfo(p).node).collect();
    node_ids.sort_unstable();
    node_ids.dedup();
    let mut groups: Vec<Vec<usize>> = node_ids
        .iter()
        .map(|&node| {
            let mut group: Vec<usize> =
                procs.iter().copied().filter(|&p| topology.cpuinfo(p).node == node).collect();
            group.sort_unstable_by_key(|&p| {
                let ci = topology.cpuinfo(p);
                (ci.core, ci.smt)
            });
            group
        })
        .collect();

    match mapping {
        Mapping::Compact => groups.concat(),
        Mapping::Scatter => {
            let deepest = groups.iter().map(Vec::len).max().unwrap_or(0);
            let mut order = Vec::with_capacity(procs.len());
            for slot in 0..deepest {
                for group in &mut groups {
                    if let Some(&p) = group.get(slot) {
                        order.push(p);
                    }
                }
            }
            order
        }
    }
}
