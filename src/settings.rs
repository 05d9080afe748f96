//! Orchestrator settings resolved from the environment
//!
//! [`Settings::from_env`] is the only place fatal environment validation
//! happens; everything downstream receives resolved values.

use crate::env::Env;
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Env keys searched, in order, for the queue transport URL.
pub const TRANSPORT_URL_KEYS: &[&str] = &["REDIS_URL", "QUEUE_REDIS_URL", "REDIS_TRANSPORT_URL"];

/// Default ComfyUI base port
pub const DEFAULT_COMFYUI_BASE_PORT: u16 = 8188;

/// Whether instance counts bind to detected hardware or to declarative counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    /// Bind GPU arithmetic to physically detected GPUs
    Actual,
    /// Declarative counts unrelated to hardware
    Mock,
}

impl GpuMode {
    /// Parse `GPU_MODE`; anything other than `mock` means actual.
    pub fn from_env(env: &Env) -> Self {
        match env.get("GPU_MODE").map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "mock" => GpuMode::Mock,
            _ => GpuMode::Actual,
        }
    }
}

impl std::fmt::Display for GpuMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuMode::Actual => write!(f, "actual"),
            GpuMode::Mock => write!(f, "mock"),
        }
    }
}

/// Resolved orchestrator settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Workspace root; manifest, logs, and the disk probe use it
    pub workspace_dir: PathBuf,
    /// Node identity, prefixes every worker id
    pub machine_id: String,
    /// GPU arithmetic mode
    pub gpu_mode: GpuMode,
    /// Queue transport URL (mandatory)
    pub transport_url: String,
    /// Base port for ComfyUI instances
    pub comfyui_base_port: u16,
    /// Launcher entry every descriptor's `script` points at
    pub launcher_script: PathBuf,
    /// Port handed to the health server descriptor
    pub health_port: u16,
}

impl Settings {
    /// Resolve settings from an environment snapshot.
    ///
    /// The transport URL is the one mandatory input: if none of
    /// [`TRANSPORT_URL_KEYS`] is set, the run aborts and the diagnostic
    /// lists exactly which keys were searched.
    pub fn from_env(env: &Env) -> Result<Self> {
        let workspace_dir = PathBuf::from(env.get_or("WORKSPACE_DIR", "."));

        let transport_url = TRANSPORT_URL_KEYS
            .iter()
            .find_map(|key| env.get(key).filter(|v| !v.is_empty()))
            .map(|v| v.to_string());

        let transport_url = match transport_url {
            Some(url) => url,
            None => {
                log::error!(
                    "no queue transport URL set; searched env keys: {}",
                    TRANSPORT_URL_KEYS.join(", ")
                );
                return Err(OrchestratorError::MissingTransportUrl {
                    searched: TRANSPORT_URL_KEYS.join(", "),
                });
            }
        };

        let launcher_script = env
            .get("LAUNCHER_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_dir.join("bin").join("launcher"));

        Ok(Self {
            machine_id: env.get_or("MACHINE_ID", "unknown-machine"),
            gpu_mode: GpuMode::from_env(env),
            transport_url,
            comfyui_base_port: env.get_u32("COMFYUI_BASE_PORT", DEFAULT_COMFYUI_BASE_PORT as u32)
                as u16,
            launcher_script,
            health_port: env.get_u32("HEALTH_PORT", 8080) as u16,
            workspace_dir,
        })
    }

    /// Canonical manifest output path.
    pub fn manifest_path(&self) -> PathBuf {
        self.workspace_dir.join("ecosystem.manifest")
    }

    /// Conventional log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.workspace_dir.join("logs")
    }

    /// Trust boundary for `installer_filename` resolution.
    pub fn installer_dir(&self) -> PathBuf {
        self.workspace_dir.join("installers")
    }
}
