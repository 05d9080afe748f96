//! Service-mapping catalog loading and typed lookups
//!
//! The catalog (`service-mapping.json`) is the declarative source of truth
//! for worker types and services. It is located by a fixed candidate-path
//! search, parsed once, env-substituted at load time, and never mutated for
//! the rest of the run.

use crate::env::Env;
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Catalog file name searched at every candidate location.
pub const CATALOG_FILENAME: &str = "service-mapping.json";

/// Optional service-env mapping expected next to the catalog.
pub const SERVICE_ENV_FILENAME: &str = "service-env-mapping.json";

/// Worker classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Executes its workload in-process
    #[default]
    DirectWorker,
    /// Dispatches work to a co-located supervised service
    ServiceClient,
    /// Dispatches work to a singleton daemon binary
    DaemonClient,
}

/// Instance scaling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingStrategy {
    /// One instance per GPU
    GpuBound,
    /// Instance count from a concurrency knob
    Concurrency,
    /// Exactly one instance
    Singleton,
}

/// Service classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Co-located supervised process, one per worker instance
    Pm2Service,
    /// Singleton binary started by the daemon bootstrap
    DaemonService,
    /// Legacy alias of daemon_service
    ManagedService,
    /// Remote API, nothing runs locally
    ExternalApi,
    /// Remote service, nothing runs locally
    ExternalService,
}

impl ServiceKind {
    /// Daemon-class services are bootstrapped, never supervised.
    pub fn is_daemon(self) -> bool {
        matches!(self, ServiceKind::DaemonService | ServiceKind::ManagedService)
    }

    /// Whether this service produces a co-located process descriptor.
    pub fn is_colocated(self) -> bool {
        matches!(self, ServiceKind::Pm2Service)
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Pm2Service => write!(f, "pm2_service"),
            ServiceKind::DaemonService => write!(f, "daemon_service"),
            ServiceKind::ManagedService => write!(f, "managed_service"),
            ServiceKind::ExternalApi => write!(f, "external_api"),
            ServiceKind::ExternalService => write!(f, "external_service"),
        }
    }
}

/// Definition of a worker type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTypeDef {
    /// Worker classification
    #[serde(rename = "type", default)]
    pub kind: WorkerKind,
    /// Whether instances bind to GPUs
    #[serde(default)]
    pub is_gpu_bound: bool,
    /// Explicit scaling strategy; defaults derived from `is_gpu_bound`
    #[serde(default)]
    pub scaling_strategy: Option<ScalingStrategy>,
    /// Services this worker requires co-located, in order
    #[serde(default)]
    pub services: Vec<String>,
    /// Host env names forwarded to instances when present
    #[serde(default)]
    pub required_env: Vec<String>,
}

impl WorkerTypeDef {
    /// Effective strategy: explicit wins, then the legacy binding (already
    /// folded in at load time), then a default derived from `is_gpu_bound`.
    pub fn effective_strategy(&self) -> ScalingStrategy {
        match self.scaling_strategy {
            Some(strategy) => strategy,
            None if self.is_gpu_bound => ScalingStrategy::GpuBound,
            None => ScalingStrategy::Concurrency,
        }
    }
}

/// Definition of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDef {
    /// Service classification
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Installer strategy identifier; `None` means no installer
    #[serde(default)]
    pub installer: Option<String>,
    /// Explicit installer path, wins over derivation from `installer`
    #[serde(default)]
    pub installer_filename: Option<String>,
    /// Whether the service binds to a GPU
    #[serde(default)]
    pub is_gpu_bound: bool,
    /// Logical connector name for env lookup
    #[serde(default)]
    pub connector: Option<String>,
    /// Job types for the env lookup fallback
    #[serde(default)]
    pub job_types_accepted: Vec<String>,
}

/// The parsed service-mapping catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Worker type definitions by name
    #[serde(default)]
    pub workers: HashMap<String, WorkerTypeDef>,
    /// Service definitions by name
    #[serde(default)]
    pub services: HashMap<String, ServiceDef>,
    /// Legacy resource-binding block, keyed by worker type
    #[serde(default)]
    pub resource_bindings: HashMap<String, String>,
}

/// Declarative env tables from `service-env-mapping.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceEnvMapping {
    /// Required env per connector name
    #[serde(default)]
    pub connectors: HashMap<String, HashMap<String, String>>,
    /// Fallback env per job type
    #[serde(default)]
    pub job_types: HashMap<String, HashMap<String, String>>,
}

impl ServiceEnvMapping {
    /// Load the env mapping expected next to a catalog file; absent is fine.
    pub fn load_sibling(catalog_path: &Path, env: &Env) -> Result<Self> {
        load_env_mapping(catalog_path, env)
    }
}

impl Catalog {
    /// Candidate catalog paths, first existing wins: bundled (next to the
    /// executable), installed (under the workspace service-manager),
    /// colocated (one level above the executable), then relative.
    pub fn candidate_paths(workspace_dir: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(CATALOG_FILENAME));
            }
            if let Some(parent) = exe.parent().and_then(|d| d.parent()) {
                candidates.push(parent.join(CATALOG_FILENAME));
            }
        }
        // Installed location slots in between bundled and colocated
        let installed = workspace_dir.join("service-manager").join(CATALOG_FILENAME);
        let insert_at = candidates.len().min(1);
        candidates.insert(insert_at, installed);
        candidates.push(PathBuf::from("./config").join(CATALOG_FILENAME));
        candidates
    }

    /// Locate and load the catalog plus the optional sibling env mapping.
    pub fn load(env: &Env, workspace_dir: &Path) -> Result<(Catalog, ServiceEnvMapping)> {
        let candidates = Self::candidate_paths(workspace_dir);
        let found = candidates.iter().find(|p| p.exists());

        let path = match found {
            Some(path) => path,
            None => {
                return Err(OrchestratorError::CatalogMissing {
                    searched: candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        };

        let catalog = Self::load_from_path(path, env)?;
        let env_mapping = load_env_mapping(path, env)?;
        Ok((catalog, env_mapping))
    }

    /// Load and materialize a catalog from an explicit path.
    pub fn load_from_path(path: &Path, env: &Env) -> Result<Catalog> {
        let raw = std::fs::read_to_string(path)?;
        let mut value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| OrchestratorError::CatalogInvalid {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        substitute_value(&mut value, env);

        let mut catalog: Catalog =
            serde_json::from_value(value).map_err(|e| OrchestratorError::CatalogInvalid {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        catalog.fold_legacy_bindings();
        Ok(catalog)
    }

    /// Look up a worker type definition.
    pub fn worker_type(&self, name: &str) -> Option<&WorkerTypeDef> {
        self.workers.get(name)
    }

    /// Look up a service definition.
    pub fn service(&self, name: &str) -> Option<&ServiceDef> {
        self.services.get(name)
    }

    /// Fold the legacy `resource_bindings` block into worker strategies.
    ///
    /// An explicit `scaling_strategy` always wins; when both are present for
    /// one worker type a single warning records the shadowed legacy value.
    fn fold_legacy_bindings(&mut self) {
        for (worker_name, binding) in &self.resource_bindings {
            let Some(def) = self.workers.get_mut(worker_name) else {
                log::warn!("resource_bindings names unknown worker type '{worker_name}'");
                continue;
            };
            let legacy = match binding.as_str() {
                "per_gpu" => ScalingStrategy::GpuBound,
                "per_machine" => ScalingStrategy::Singleton,
                "unlimited" => ScalingStrategy::Concurrency,
                other => {
                    log::warn!(
                        "resource_bindings['{worker_name}'] has unrecognized value '{other}', ignoring"
                    );
                    continue;
                }
            };
            match def.scaling_strategy {
                Some(explicit) => log::warn!(
                    "worker type '{worker_name}' declares scaling_strategy {explicit:?} and legacy \
                     resource_binding '{binding}'; scaling_strategy wins"
                ),
                None => def.scaling_strategy = Some(legacy),
            }
        }
    }
}

fn load_env_mapping(catalog_path: &Path, env: &Env) -> Result<ServiceEnvMapping> {
    let sibling = catalog_path
        .parent()
        .map(|d| d.join(SERVICE_ENV_FILENAME))
        .filter(|p| p.exists());

    let Some(path) = sibling else {
        return Ok(ServiceEnvMapping::default());
    };

    let raw = std::fs::read_to_string(&path)?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| OrchestratorError::CatalogInvalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    substitute_value(&mut value, env);
    serde_json::from_value(value).map_err(|e| OrchestratorError::CatalogInvalid {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Walk a JSON tree substituting `${VAR}` references in every string.
///
/// A string that was entirely a reference and now reads as a number or
/// boolean is coerced, so `"${COMFYUI_BASE_PORT:-8188}"` materializes as
/// `8188`, not `"8188"`.
fn substitute_value(value: &mut serde_json::Value, env: &Env) {
    match value {
        serde_json::Value::String(s) => {
            if !s.contains("${") {
                return;
            }
            let was_pure_reference = s.starts_with("${") && s.ends_with('}');
            let expanded = env.substitute(s);
            if was_pure_reference {
                if let Ok(n) = expanded.parse::<i64>() {
                    *value = serde_json::Value::from(n);
                    return;
                }
                if let Ok(b) = expanded.parse::<bool>() {
                    *value = serde_json::Value::from(b);
                    return;
                }
            }
            *value = serde_json::Value::String(expanded);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_value(item, env);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, env);
            }
        }
        _ => {}
    }
}
