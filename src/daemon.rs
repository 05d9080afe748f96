//! Daemon-service bootstrap
//!
//! Daemon-class catalog entries (`daemon_service`, legacy `managed_service`)
//! run as singleton binaries outside the supervisor. Before the manifest is
//! emitted, every daemon needed by the selected workers gets one sequential,
//! blocking `install()` invocation. Individual failures are warnings: the
//! daemon-client workers in the manifest surface their own connection errors.
//!
//! Installers are a closed set constructed by table lookup from the catalog's
//! `installer` string; unknown identifiers are a hard error before any daemon
//! is touched.

use crate::catalog::{Catalog, ServiceDef};
use crate::error::{OrchestratorError, Result};
use crate::settings::Settings;
use crate::workers::WorkerSpec;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

/// Installer script derived for the ComfyUI management identifier.
const COMFYUI_INSTALLER_SCRIPT: &str = "install-comfyui.sh";
/// Installer script derived for the simulation service identifier.
const SIMULATION_INSTALLER_SCRIPT: &str = "install-simulation.sh";

/// The closed set of installer strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Installer {
    /// ComfyUI management client install routine
    ComfyUiManagement {
        /// Script to execute
        script: PathBuf,
    },
    /// Simulation service install routine
    Simulation {
        /// Script to execute
        script: PathBuf,
    },
    /// No installer; the daemon is provisioned outside the orchestrator
    Null,
}

impl Installer {
    /// Construct the installer for a service by table lookup.
    ///
    /// An explicit `installer_filename` wins over the per-identifier derived
    /// script, but must stay inside the installer directory: any path whose
    /// normalized form escapes it is treated as an unknown installer.
    pub fn resolve(service_name: &str, service: &ServiceDef, installer_dir: &Path) -> Result<Self> {
        let explicit = match service.installer_filename.as_deref() {
            Some(filename) => {
                Some(contained_path(installer_dir, filename).ok_or_else(|| {
                    OrchestratorError::UnknownInstaller {
                        installer: filename.to_string(),
                        service: service_name.to_string(),
                    }
                })?)
            }
            None => None,
        };

        match service.installer.as_deref() {
            Some("ComfyUIManagementClient") => Ok(Installer::ComfyUiManagement {
                script: explicit.unwrap_or_else(|| installer_dir.join(COMFYUI_INSTALLER_SCRIPT)),
            }),
            Some("SimulationService") => Ok(Installer::Simulation {
                script: explicit.unwrap_or_else(|| installer_dir.join(SIMULATION_INSTALLER_SCRIPT)),
            }),
            None => {
                if explicit.is_some() {
                    log::warn!(
                        "service '{service_name}' sets installer_filename without an installer \
                         identifier, treating as externally managed"
                    );
                }
                Ok(Installer::Null)
            }
            Some(unknown) => Err(OrchestratorError::UnknownInstaller {
                installer: unknown.to_string(),
                service: service_name.to_string(),
            }),
        }
    }

    /// Run the install routine to completion. May span minutes.
    pub fn install(&self, service_name: &str) -> std::result::Result<(), String> {
        let script = match self {
            Installer::ComfyUiManagement { script } | Installer::Simulation { script } => script,
            Installer::Null => {
                log::info!("daemon '{service_name}' has no installer, assuming it is provisioned");
                return Ok(());
            }
        };

        log::info!("installing daemon '{service_name}' via {}", script.display());
        let status = Command::new(script)
            .status()
            .map_err(|e| format!("failed to spawn {}: {e}", script.display()))?;
        if !status.success() {
            return Err(format!("{} exited with {status}", script.display()));
        }
        log::info!("daemon '{service_name}' installed");
        Ok(())
    }
}

/// Outcome of one daemon bootstrap attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonReport {
    /// Service name from the catalog
    pub service: String,
    /// Whether `install()` completed successfully
    pub installed: bool,
}

/// Daemon-class services required by the selected workers, in spec order,
/// deduplicated.
pub fn required_daemon_services(specs: &[WorkerSpec], catalog: &Catalog) -> Vec<String> {
    let mut required: Vec<String> = Vec::new();
    for spec in specs {
        let Some(def) = catalog.worker_type(&spec.worker_type) else {
            continue;
        };
        for service_name in &def.services {
            let is_daemon = catalog
                .service(service_name)
                .is_some_and(|s| s.kind.is_daemon());
            if is_daemon && !required.contains(service_name) {
                required.push(service_name.clone());
            }
        }
    }
    required
}

/// Bootstrap every daemon the selected workers need.
///
/// Installer resolution errors abort the run before any daemon is touched;
/// install execution failures are logged and the remaining daemons still run.
pub fn bootstrap_daemons(
    specs: &[WorkerSpec],
    catalog: &Catalog,
    settings: &Settings,
) -> Result<Vec<DaemonReport>> {
    let required = required_daemon_services(specs, catalog);
    let installer_dir = settings.installer_dir();

    // Resolve everything first so an unknown installer fails fast
    let mut resolved = Vec::with_capacity(required.len());
    for service_name in &required {
        if let Some(service) = catalog.service(service_name) {
            let installer = Installer::resolve(service_name, service, &installer_dir)?;
            resolved.push((service_name.clone(), installer));
        }
    }

    let mut reports = Vec::with_capacity(resolved.len());
    for (service_name, installer) in resolved {
        let installed = match installer.install(&service_name) {
            Ok(()) => true,
            Err(reason) => {
                log::warn!("daemon '{service_name}' install failed: {reason}");
                false
            }
        };
        reports.push(DaemonReport { service: service_name, installed });
    }
    Ok(reports)
}

/// Join `filename` under `dir`, rejecting any form that escapes it.
fn contained_path(dir: &Path, filename: &str) -> Option<PathBuf> {
    let candidate = Path::new(filename);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        dir.join(candidate)
    };
    if joined.components().any(|c| matches!(c, Component::ParentDir)) {
        return None;
    }
    if !joined.starts_with(dir) {
        return None;
    }
    Some(joined)
}
