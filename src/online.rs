//! Online processor set
//!
//! Filters the topology down to the processors this process may actually
//! use: an explicit range list from configuration wins, then the process
//! affinity mask when it is a strict subset of the machine, then all
//! processors with affinity turned off.

use tracing::debug;

use crate::error::Result;
use crate::policy::AffinityMode;
use crate::rangelist::parse_rangelist;
use crate::topology::Topology;

/// The ordered list of processor indices the process may use
#[derive(Debug, Clone)]
pub struct OnlineSet {
    procs: Vec<usize>,
    restricted: bool,
    mode: AffinityMode,
}

impl OnlineSet {
    /// Derive the online set.
    ///
    /// `proclist` is the configured range expression, if any.
    /// `affinity_configured` reports whether the caller asked for
    /// library-driven placement; it decides the affinity mode when no
    /// explicit processor list restricts the process.
    pub fn detect(
        topology: &Topology,
        proclist: Option<&str>,
        affinity_configured: bool,
    ) -> Result<Self> {
        if let Some(expr) = proclist {
            let mut procs = parse_rangelist(expr)?;
            procs.retain(|&p| p < topology.num_procs());
            debug!(%expr, count = procs.len(), "online set from configured processor list");
            return Ok(OnlineSet { procs, restricted: true, mode: AffinityMode::Library });
        }

        if let Some(mask) = process_affinity_mask(topology) {
            if mask.len() < topology.num_procs() {
                debug!(count = mask.len(), "online set from process affinity mask");
                let mode =
                    if affinity_configured { AffinityMode::Library } else { AffinityMode::Scheduler };
                return Ok(OnlineSet { procs: mask, restricted: true, mode });
            }
        }

        let procs: Vec<usize> = (0..topology.num_procs()).collect();
        let mode = if affinity_configured { AffinityMode::Library } else { AffinityMode::Off };
        Ok(OnlineSet { procs, restricted: false, mode })
    }

    /// Build an online set covering every processor of the topology, with
    /// library-driven affinity. Used with synthetic topologies.
    pub fn all(topology: &Topology, mode: AffinityMode) -> Self {
        OnlineSet { procs: (0..topology.num_procs()).collect(), restricted: false, mode }
    }

    /// Online processor indices, ascending and deduplicated
    pub fn procs(&self) -> &[usize] {
        &self.procs
    }

    /// Number of online processors
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    /// True when the set is empty
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Online processor by position; out-of-range positions wrap
    pub fn proc_at(&self, idx: usize) -> usize {
        self.procs[idx % self.procs.len()]
    }

    /// True when configuration or the scheduler restricted the set
    pub fn restricted(&self) -> bool {
        self.restricted
    }

    /// The affinity mode the set implies
    pub fn mode(&self) -> AffinityMode {
        self.mode
    }
}

/// The calling process' affinity mask as a processor index list.
#[cfg(target_os = "linux")]
fn process_affinity_mask(topology: &Topology) -> Option<Vec<usize>> {
    if topology.is_synthetic() {
        return None;
    }
    // SAFETY: sched_getaffinity fills the set on success.
    let mut cpuset: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut cpuset) };
    if rc != 0 {
        return None;
    }
    let procs: Vec<usize> = (0..topology.num_procs())
        .filter(|&p| unsafe { libc::CPU_ISSET(p, &cpuset) })
        .collect();
    if procs.is_empty() {
        None
    } else {
        Some(procs)
    }
}

#[cfg(not(target_os = "linux"))]
fn process_affinity_mask(_topology: &Topology) -> Option<Vec<usize>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proclist_restricts_and_enables_library_mode() {
        let topo = Topology::uniform(2, 2, 2);
        let online = OnlineSet::detect(&topo, Some("0-3"), false).unwrap();
        assert_eq!(online.procs(), &[0, 1, 2, 3]);
        assert!(online.restricted());
        assert_eq!(online.mode(), AffinityMode::Library);
    }

    #[test]
    fn proclist_drops_out_of_range_ids() {
        let topo = Topology::uniform(1, 2, 1);
        let online = OnlineSet::detect(&topo, Some("0-9"), false).unwrap();
        assert_eq!(online.procs(), &[0, 1]);
    }

    #[test]
    fn unrestricted_defaults_to_off() {
        let topo = Topology::uniform(2, 2, 2);
        let online = OnlineSet::detect(&topo, None, false).unwrap();
        assert_eq!(online.len(), topo.num_procs());
        assert!(!online.restricted());
        assert_eq!(online.mode(), AffinityMode::Off);
    }

    #[test]
    fn configured_affinity_forces_library_mode() {
        let topo = Topology::uniform(2, 2, 2);
        let online = OnlineSet::detect(&topo, None, true).unwrap();
        assert_eq!(online.mode(), AffinityMode::Library);
    }

    #[test]
    fn positions_wrap() {
        let topo = Topology::uniform(1, 4, 1);
        let online = OnlineSet::detect(&topo, Some("1,3"), false).unwrap();
        assert_eq!(online.proc_at(0), 1);
        assert_eq!(online.proc_at(2), 1);
        assert_eq!(online.proc_at(3), 3);
    }
}
