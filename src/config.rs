//! Environment configuration
//!
//! All options are read once from `NUMABIND_*` environment variables and
//! collected into a [`Config`]; the runtime builder applies programmatic
//! overrides on top.

use std::env;

use tracing::debug;

use crate::error::{Error, Result};
use crate::policy::{parse_affinity, Binding, Mapping};

/// Recognised configuration options
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Mapping and binding policy from `NUMABIND_AFFINITY="<map>:<bind>"`
    pub affinity: Option<(Mapping, Binding)>,
    /// Skip SMT-sibling processors when laying out workers
    pub avoid_htcore: bool,
    /// Worker count, capped by the online-processor count
    pub num_threads: Option<usize>,
    /// Range list overriding the process affinity mask
    pub proclist: Option<String>,
    /// Default node range list for policy allocations without a mask
    pub membind: Option<String>,
    /// Alignment override for allocations, in bytes
    pub align_size: Option<usize>,
    /// Diagnostic verbosity, 0..=3
    pub verbose: u8,
}

impl Config {
    /// Read the configuration from the environment.
    ///
    /// Unset variables leave their option at the default; malformed values
    /// are configuration errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Some(expr) = read("NUMABIND_AFFINITY") {
            config.affinity = Some(parse_affinity(&expr)?);
        }
        config.avoid_htcore = read_int("NUMABIND_AVOID_HTCORE")?.unwrap_or(0) != 0;
        config.num_threads = read_int("NUMABIND_NUM_THREADS")?.map(|n| n as usize);
        config.proclist = read("NUMABIND_PROCLIST");
        config.membind = read("NUMABIND_MEMBIND");
        config.align_size = read_int("NUMABIND_ALIGNSIZE")?.map(|n| n as usize);
        config.verbose = read_int("NUMABIND_VERBOSE")?.unwrap_or(0).min(3) as u8;
        if config.verbose > 0 {
            debug!(?config, "configuration loaded from environment");
        }
        Ok(config)
    }
}

fn read(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_int(name: &str) -> Result<Option<u64>> {
    match read(name) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not an integer: '{}'", name, v))),
    }
}
