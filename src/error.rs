//! Error types for numabind

use std::io;
use thiserror::Error;

/// The main error type for numabind operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown mapping policy name
    #[error("Unknown mapping policy '{0}': expected 'scatter' or 'compact'")]
    UnknownMapping(String),

    /// Unknown binding policy name
    #[error("Unknown binding policy '{0}': expected 'core', 'physcore', or 'socket'")]
    UnknownBinding(String),

    /// Malformed range list expression
    #[error("Malformed range list '{expr}': {details}")]
    MalformedRangeList {
        /// The offending expression
        expr: String,
        /// What went wrong
        details: &'static str,
    },

    /// The probed topology is internally inconsistent
    #[error("Topology inconsistency: {details}")]
    Topology {
        /// Description of the inconsistency
        details: String,
    },

    /// The platform rejected a processor-set bind
    #[error("Bind failed for worker {worker}: errno {errno}")]
    BindFailed {
        /// Worker index whose bind was rejected
        worker: usize,
        /// OS error number
        errno: i32,
    },

    /// The platform could not supply the requested memory
    #[error("Allocation of {size} bytes failed")]
    AllocFailed {
        /// Requested size in bytes
        size: usize,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Operation attempted on uninitialised state
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type alias for numabind operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
