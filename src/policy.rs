//! Affinity policy enumerations
//!
//! A mapping policy lays worker indices out across NUMA nodes; a binding
//! policy decides how wide each worker's processor set is.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// How worker indices are distributed across online nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mapping {
    /// Round-robin across nodes, spreading threads over memory controllers
    #[default]
    Scatter,
    /// Fill one node before moving to the next, co-locating threads
    Compact,
}

/// How wide each worker's bind set is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// A single logical processor
    #[default]
    Core,
    /// All SMT siblings of the worker's physical core
    PhysCore,
    /// Every processor on the worker's node
    Socket,
}

/// Who drives thread placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityMode {
    /// No placement; `bind_thread` is a no-op
    #[default]
    Off,
    /// This library computes and applies processor sets
    Library,
    /// An external scheduler restricted the process; the mapping follows it
    Scheduler,
}

impl Mapping {
    /// Stable textual name
    pub fn name(self) -> &'static str {
        match self {
            Mapping::Scatter => "scatter",
            Mapping::Compact => "compact",
        }
    }
}

impl Binding {
    /// Stable textual name
    pub fn name(self) -> &'static str {
        match self {
            Binding::Core => "core",
            Binding::PhysCore => "physcore",
            Binding::Socket => "socket",
        }
    }
}

impl FromStr for Mapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scatter" => Ok(Mapping::Scatter),
            "compact" => Ok(Mapping::Compact),
            other => Err(Error::UnknownMapping(other.to_string())),
        }
    }
}

impl FromStr for Binding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core" => Ok(Binding::Core),
            "physcore" => Ok(Binding::PhysCore),
            "socket" => Ok(Binding::Socket),
            other => Err(Error::UnknownBinding(other.to_string())),
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse an `"<mapping>:<binding>"` affinity expression.
///
/// Either half may be omitted (`"compact"`, `":socket"`); the missing half
/// falls back to the default.
pub fn parse_affinity(expr: &str) -> Result<(Mapping, Binding)> {
    let mut halves = expr.splitn(2, ':');
    let map_name = halves.next().unwrap_or("").trim();
    let bind_name = halves.next().unwrap_or("").trim();
    let mapping = if map_name.is_empty() { Mapping::default() } else { map_name.parse()? };
    let binding = if bind_name.is_empty() { Binding::default() } else { bind_name.parse()? };
    Ok((mapping, binding))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_expression() {
        assert_eq!(parse_affinity("compact:socket").unwrap(), (Mapping::Compact, Binding::Socket));
        assert_eq!(parse_affinity("scatter:core").unwrap(), (Mapping::Scatter, Binding::Core));
    }

    #[test]
    fn missing_halves_default() {
        assert_eq!(parse_affinity("compact").unwrap(), (Mapping::Compact, Binding::Core));
        assert_eq!(parse_affinity(":physcore").unwrap(), (Mapping::Scatter, Binding::PhysCore));
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(parse_affinity("balanced:core"), Err(Error::UnknownMapping(_))));
        assert!(matches!(parse_affinity("scatter:die"), Err(Error::UnknownBinding(_))));
    }
}
