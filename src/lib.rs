//! # machinist
//!
//! A GPU-aware worker orchestrator for distributed job-processing fleets.
//! Each node runs one orchestrator instance, which discovers the node's
//! hardware, expands a declarative worker specification against a
//! service-mapping catalog, starts required daemon services, and emits a
//! process manifest for an external supervisor.
//!
//! ## Pipeline
//!
//! 1. **Catalog load**: locate and parse `service-mapping.json`, with
//!    `${VAR:-default}` substitution materialized at load time
//! 2. **Hardware discovery**: GPU/CPU/memory/disk probes, run concurrently
//!    with per-probe timeouts; mock mode honors `MACHINE_*` declarations
//! 3. **Worker-spec resolution**: `WORKERS=type:count,...` with `auto`
//!    resolved against the hardware snapshot
//! 4. **Manifest assembly**: one descriptor per worker instance plus its
//!    co-located services, with derived environments, port assignments, and
//!    worker/service pair records
//! 5. **Daemon bootstrap**: singleton backing services installed before the
//!    manifest is written
//! 6. **Emission**: atomic write of `apps + service_pairs` to
//!    `<workspace>/ecosystem.manifest`
//!
//! ## Quick Start
//!
//! ```no_run
//! use machinist::{Env, Orchestrator};
//!
//! # fn main() -> machinist::Result<()> {
//! let orchestrator = Orchestrator::from_env(Env::capture())?;
//! let plan = orchestrator.run(false)?;
//! println!(
//!     "emitted {} processes, {} service pairs",
//!     plan.manifest.apps.len(),
//!     plan.manifest.service_pairs.len()
//! );
//! # Ok(())
//! # }
//! ```
//!
//! The orchestrator does not execute jobs, schedule across nodes, or own the
//! queue: it produces the declarative process manifest and starts daemon
//! services, then exits. The supervisor owns every process from there.

pub mod catalog;
pub mod daemon; // Daemon-service bootstrap (singleton backing binaries)
pub mod env;
pub mod error;
pub mod hardware; // Node hardware discovery with mock/actual GPU modes
pub mod manifest; // Process descriptors, service pairs, emission
pub mod orchestrator;
pub mod settings;
pub mod workers; // WORKERS spec parsing and instance-count resolution

// Re-export main types
pub use catalog::{
    Catalog, ScalingStrategy, ServiceDef, ServiceEnvMapping, ServiceKind, WorkerKind,
    WorkerTypeDef,
};
pub use daemon::{DaemonReport, Installer};
pub use env::Env;
pub use error::{OrchestratorError, Result};
pub use hardware::{GpuSnapshot, GpuVendor, HardwareResources};
pub use manifest::{Manifest, ManifestBuilder, ProcessClass, ProcessDescriptor, ServicePair};
pub use orchestrator::{Orchestrator, Plan};
pub use settings::{GpuMode, Settings};
pub use workers::{RequestedCount, WorkerSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
