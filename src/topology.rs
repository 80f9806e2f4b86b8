//! Topology inventory
//!
//! Probes the platform once and publishes immutable tables: the logical
//! processor list with `(node, core, smt)` coordinates, per-node memory
//! and page sizes, and the allocation alignment. On Linux the probe walks
//! `/sys/devices/system/{cpu,node}`; elsewhere, or when the walk fails,
//! a synthetic single-node topology covers all processors.

use std::collections::HashSet;
use std::fmt;
#[cfg(target_os = "linux")]
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default page size assumed when the platform reports none (2 MiB)
pub const DEFAULT_PAGE_SIZE: usize = 2 << 20;

/// An immutable record per logical processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    /// Platform-assigned processor index
    pub id: usize,
    /// NUMA node the processor belongs to
    pub node: usize,
    /// Physical core id within the platform numbering
    pub core: usize,
    /// SMT lane within the core, dense from 0
    pub smt: usize,
}

/// Per-node memory description
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    /// Local memory in bytes
    pub memory_bytes: usize,
    /// Preferred page size in bytes
    pub page_bytes: usize,
}

/// The probed processor and node tables
#[derive(Debug, Clone)]
pub struct Topology {
    procs: Vec<CpuInfo>,
    nodes: Vec<NodeInfo>,
    num_cores: usize,
    num_smts: usize,
    align_size: usize,
    synthetic: bool,
}

impl Topology {
    /// Probe the host topology.
    ///
    /// Fails when the platform walk yields fewer processor records than
    /// the reported processor count, or when a record carries an
    /// inconsistent coordinate.
    pub fn probe(align_override: Option<usize>) -> Result<Self> {
        let nprocs = num_cpus::get();
        #[cfg(target_os = "linux")]
        let raw = probe_sysfs(nprocs)?;
        #[cfg(not(target_os = "linux"))]
        let raw: Option<(Vec<CpuInfo>, Vec<NodeInfo>)> = None;

        match raw {
            Some((procs, nodes)) => {
                Self::from_tables(procs, nodes, align_override, false)
            }
            None => {
                debug!(nprocs, "platform probe unavailable, using synthetic single-node topology");
                Ok(Self::uniform_with(1, nprocs, 1, align_override))
            }
        }
    }

    /// Build a synthetic topology of `nodes` nodes, each with `cores`
    /// physical cores of `smts` SMT lanes.
    ///
    /// Processor ids are assigned node-major. Every node carries the
    /// default page size and an unspecified memory size.
    pub fn uniform(nodes: usize, cores: usize, smts: usize) -> Self {
        Self::uniform_with(nodes, cores * nodes.max(1), smts, None)
    }

    fn uniform_with(nodes: usize, total_cores: usize, smts: usize, align: Option<usize>) -> Self {
        let nodes = nodes.max(1);
        let smts = smts.max(1);
        let cores_per_node = (total_cores / nodes).max(1);
        let mut procs = Vec::with_capacity(nodes * cores_per_node * smts);
        for node in 0..nodes {
            for core in 0..cores_per_node {
                for smt in 0..smts {
                    procs.push(CpuInfo { id: procs.len(), node, core, smt });
                }
            }
        }
        let node_infos = vec![
            NodeInfo { memory_bytes: total_ram() / nodes, page_bytes: DEFAULT_PAGE_SIZE };
            nodes
        ];
        let align_size = resolve_align(align, &node_infos);
        Topology {
            procs,
            nodes: node_infos,
            num_cores: cores_per_node * nodes,
            num_smts: cores_per_node * nodes * smts,
            align_size,
            synthetic: true,
        }
    }

    fn from_tables(
        mut procs: Vec<CpuInfo>,
        mut nodes: Vec<NodeInfo>,
        align: Option<usize>,
        synthetic: bool,
    ) -> Result<Self> {
        if procs.is_empty() {
            return Err(Error::Topology { details: "no processors found".into() });
        }

        // Zero nodes coerces to one synthetic node holding all processors.
        if nodes.is_empty() {
            nodes.push(NodeInfo { memory_bytes: 0, page_bytes: 0 });
            for ci in &mut procs {
                ci.node = 0;
            }
        }
        let nnodes = nodes.len();
        for ni in &mut nodes {
            if ni.page_bytes == 0 {
                ni.page_bytes = DEFAULT_PAGE_SIZE;
            }
            if ni.memory_bytes == 0 {
                ni.memory_bytes = total_ram() / nnodes;
            }
        }

        // Dense SMT lanes per (node, core), in processor-id order.
        procs.sort_unstable_by_key(|ci| ci.id);
        let mut seen_pairs: Vec<((usize, usize), usize)> = Vec::new();
        for ci in &mut procs {
            let key = (ci.node, ci.core);
            match seen_pairs.iter_mut().find(|(k, _)| *k == key) {
                Some((_, count)) => {
                    ci.smt = *count;
                    *count += 1;
                }
                None => {
                    ci.smt = 0;
                    seen_pairs.push((key, 1));
                }
            }
        }
        let num_cores = seen_pairs.len();
        let num_smts = procs.len();

        let mut coords = HashSet::with_capacity(procs.len());
        let mut ids = HashSet::with_capacity(procs.len());
        for ci in &procs {
            if ci.node >= nodes.len() {
                return Err(Error::Topology {
                    details: format!("processor {} reports node {} of {}", ci.id, ci.node, nodes.len()),
                });
            }
            if !ids.insert(ci.id) || !coords.insert((ci.node, ci.core, ci.smt)) {
                return Err(Error::Topology {
                    details: format!("duplicate processor coordinates for id {}", ci.id),
                });
            }
        }

        let align_size = resolve_align(align, &nodes);
        Ok(Topology { procs, nodes, num_cores, num_smts, align_size, synthetic })
    }

    /// Number of logical processors
    pub fn num_procs(&self) -> usize {
        self.procs.len()
    }

    /// Number of NUMA nodes
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of physical cores across the machine
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Number of SMT lanes across the machine
    pub fn num_smts(&self) -> usize {
        self.num_smts
    }

    /// Page size of a node; out-of-range indices wrap
    pub fn page_size(&self, node: usize) -> usize {
        self.nodes[node % self.nodes.len()].page_bytes
    }

    /// Memory size of a node; out-of-range indices wrap
    pub fn memory_size(&self, node: usize) -> usize {
        self.nodes[node % self.nodes.len()].memory_bytes
    }

    /// Sum of all node memory sizes
    pub fn total_memory_size(&self) -> usize {
        self.nodes.iter().map(|n| n.memory_bytes).sum()
    }

    /// Allocation alignment in bytes
    pub fn align_size(&self) -> usize {
        self.align_size
    }

    /// Processor record by index; out-of-range indices wrap
    pub fn cpuinfo(&self, proc_idx: usize) -> CpuInfo {
        self.procs[proc_idx % self.procs.len()]
    }

    /// All processor records in id order
    pub fn procs(&self) -> &[CpuInfo] {
        &self.procs
    }

    /// True for synthetic topologies, whose processor ids do not name
    /// host processors and must not reach the platform bind primitives
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} processors, {} nodes, {} cores, {} smts, align {}",
            self.num_procs(),
            self.num_nodes(),
            self.num_cores(),
            self.num_smts(),
            self.align_size
        )?;
        for ci in &self.procs {
            writeln!(
                f,
                "CPU[{:03}] Processor: {:2}, Node: {:2}, Core: {:2}, SMT: {:2}",
                ci.id, ci.id, ci.node, ci.core, ci.smt
            )?;
        }
        Ok(())
    }
}

fn resolve_align(requested: Option<usize>, nodes: &[NodeInfo]) -> usize {
    let default = nodes.first().map(|n| n.page_bytes).unwrap_or(DEFAULT_PAGE_SIZE);
    match requested {
        Some(0) => {
            warn!(default, "alignment override of 0 replaced by the node-0 page size");
            default
        }
        Some(align) => align,
        None => default,
    }
}

fn total_ram() -> usize {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sysinfo writes the struct on success and is otherwise
        // side-effect free.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } == 0 {
            return info.totalram as usize * info.mem_unit as usize;
        }
    }
    0
}

/// Walk `/sys/devices/system/{cpu,node}` and return the raw tables.
///
/// `Ok(None)` means the filesystem is not available and a synthetic
/// topology should stand in; a walk that disagrees with the reported
/// processor count is an inconsistency and fails.
#[cfg(target_os = "linux")]
fn probe_sysfs(nprocs: usize) -> Result<Option<(Vec<CpuInfo>, Vec<NodeInfo>)>> {
    let cpu_root = Path::new("/sys/devices/system/cpu");
    let node_root = Path::new("/sys/devices/system/node");

    let mut procs: Vec<CpuInfo> = Vec::new();
    let Ok(entries) = std::fs::read_dir(cpu_root) else {
        return Ok(None);
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|n| n.strip_prefix("cpu")).and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let core_path = entry.path().join("topology/core_id");
        let Some(core) = read_sysfs_int(&core_path) else { continue };
        procs.push(CpuInfo { id, node: 0, core, smt: 0 });
    }
    if procs.is_empty() {
        return Ok(None);
    }
    if procs.len() != nprocs {
        return Err(Error::Topology {
            details: format!("{} processors reported, {} found in the sysfs walk", nprocs, procs.len()),
        });
    }

    let mut nodes: Vec<NodeInfo> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(node_root) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(node_id) =
                name.to_str().and_then(|n| n.strip_prefix("node")).and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if nodes.len() <= node_id {
                nodes.resize(node_id + 1, NodeInfo { memory_bytes: 0, page_bytes: 0 });
            }
            nodes[node_id].memory_bytes = read_node_meminfo(&entry.path().join("meminfo"));
            if let Ok(cpus) = std::fs::read_dir(entry.path()) {
                for cpu in cpus.flatten() {
                    let cpu_name = cpu.file_name();
                    let Some(id) = cpu_name
                        .to_str()
                        .and_then(|n| n.strip_prefix("cpu"))
                        .and_then(|n| n.parse::<usize>().ok())
                    else {
                        continue;
                    };
                    if let Some(ci) = procs.iter_mut().find(|ci| ci.id == id) {
                        ci.node = node_id;
                    }
                }
            }
        }
    }
    Ok(Some((procs, nodes)))
}

#[cfg(target_os = "linux")]
fn read_sysfs_int(path: &Path) -> Option<usize> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Parse `Node N MemTotal: <kB> kB` from a node meminfo file.
#[cfg(target_os = "linux")]
fn read_node_meminfo(path: &Path) -> usize {
    let Ok(text) = std::fs::read_to_string(path) else { return 0 };
    for line in text.lines() {
        if line.contains("MemTotal:") {
            let kb = line
                .split_whitespace()
                .rev()
                .nth(1)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}
