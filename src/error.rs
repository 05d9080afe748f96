//! Error types for the orchestrator core

use std::io;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for the orchestrator core.
///
/// Only conditions that make the emitted manifest meaningless are errors;
/// partial-failure events (a failed hardware probe, a daemon that would not
/// install, an unknown worker type in `WORKERS`) are logged warnings and the
/// run continues in a degraded but internally consistent state.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No service-mapping catalog found at any candidate path
    #[error("service-mapping catalog not found (searched: {searched})")]
    CatalogMissing {
        /// Candidate paths that were probed, comma separated
        searched: String,
    },

    /// Catalog file exists but could not be parsed
    #[error("invalid service-mapping catalog at {path}: {reason}")]
    CatalogInvalid {
        /// Path of the offending file
        path: String,
        /// Parse or schema failure detail
        reason: String,
    },

    /// The mandatory queue transport URL is absent from the environment
    #[error("no queue transport URL configured (searched env: {searched})")]
    MissingTransportUrl {
        /// Env keys that were searched, comma separated
        searched: String,
    },

    /// A service declares an installer outside the known set
    #[error("unknown installer '{installer}' declared by service '{service}'")]
    UnknownInstaller {
        /// The installer identifier from the catalog
        installer: String,
        /// The service that declared it
        service: String,
    },

    /// Two service pairs resolved to the same host port
    #[error("port {port} assigned to both '{first}' and '{second}'")]
    PortConflict {
        /// The colliding port
        port: u16,
        /// First descriptor holding the port
        first: String,
        /// Second descriptor holding the port
        second: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OrchestratorError {
    /// Process exit code for this error class.
    ///
    /// Catalog problems exit 2, a missing transport URL exits 3, an unknown
    /// installer exits 4, everything else exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::CatalogMissing { .. }
            | OrchestratorError::CatalogInvalid { .. } => 2,
            OrchestratorError::MissingTransportUrl { .. } => 3,
            OrchestratorError::UnknownInstaller { .. } => 4,
            _ => 1,
        }
    }
}
