//! Process manifest data model and emission
//!
//! The manifest is the contract the external supervisor consumes: an ordered
//! list of process descriptors plus the worker/service pair records. It is
//! built once per run and written atomically to
//! `<workspace>/ecosystem.manifest`.

pub mod builder;
pub mod env;

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

pub use builder::ManifestBuilder;

/// Supervision defaults per process class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessClass {
    /// The health-check HTTP server
    HealthServer,
    /// Any job-claiming worker
    Worker,
    /// Co-located inference backend (ComfyUI class)
    InferenceService,
    /// Co-located simulation backend
    SimulationService,
    /// Co-located service without an installer
    MinimalService,
}

impl ProcessClass {
    fn min_uptime(self) -> &'static str {
        match self {
            ProcessClass::Worker | ProcessClass::InferenceService => "10s",
            _ => "5s",
        }
    }

    fn max_memory_restart(self) -> &'static str {
        match self {
            ProcessClass::HealthServer | ProcessClass::SimulationService => "512M",
            ProcessClass::Worker => "1G",
            ProcessClass::InferenceService => "2G",
            ProcessClass::MinimalService => "256M",
        }
    }

    fn restart_delay_ms(self) -> u64 {
        match self {
            ProcessClass::Worker => 3000,
            ProcessClass::InferenceService => 5000,
            _ => 2000,
        }
    }

    fn max_restarts(self) -> u32 {
        10
    }
}

/// One supervised process, the full contract the supervisor consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Unique name within the manifest
    pub name: String,
    /// Entry path the supervisor executes
    pub script: String,
    /// Ordered arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: String,
    /// Always one; scaling happens through distinct descriptors
    pub instances: u32,
    /// Supervisor restarts the process on exit
    pub autorestart: bool,
    /// Restart budget before the supervisor gives up
    pub max_restarts: u32,
    /// Minimum uptime before a restart counts as stable
    pub min_uptime: String,
    /// Memory cap that triggers a restart
    pub max_memory_restart: String,
    /// Delay between restarts, milliseconds
    pub restart_delay: u64,
    /// Stderr log destination
    pub error_file: String,
    /// Stdout log destination
    pub out_file: String,
    /// Combined log destination
    pub log_file: String,
    /// Merge per-instance logs
    pub merge_logs: bool,
    /// Process environment (sorted for deterministic output)
    pub env: BTreeMap<String, String>,
}

impl ProcessDescriptor {
    /// Build a descriptor with the class defaults and name-derived log paths.
    pub fn new(
        name: impl Into<String>,
        class: ProcessClass,
        script: &Path,
        cwd: &Path,
        log_dir: &Path,
    ) -> Self {
        let name = name.into();
        Self {
            script: script.to_string_lossy().into_owned(),
            args: Vec::new(),
            cwd: cwd.to_string_lossy().into_owned(),
            instances: 1,
            autorestart: true,
            max_restarts: class.max_restarts(),
            min_uptime: class.min_uptime().to_string(),
            max_memory_restart: class.max_memory_restart().to_string(),
            restart_delay: class.restart_delay_ms(),
            error_file: log_dir.join(format!("{name}-error.log")).to_string_lossy().into_owned(),
            out_file: log_dir.join(format!("{name}-out.log")).to_string_lossy().into_owned(),
            log_file: log_dir.join(format!("{name}.log")).to_string_lossy().into_owned(),
            merge_logs: true,
            env: BTreeMap::new(),
            name,
        }
    }

    /// The port this process is bound to, if any.
    ///
    /// Inspection order: a `--port=` argument, then the `COMFYUI_PORT`,
    /// `PORT`, `SIMULATION_PORT`, `SERVICE_PORT` env entries.
    pub fn bound_port(&self) -> Option<u16> {
        for arg in &self.args {
            if let Some(value) = arg.strip_prefix("--port=") {
                if let Ok(port) = value.parse() {
                    return Some(port);
                }
            }
        }
        for key in ["COMFYUI_PORT", "PORT", "SIMULATION_PORT", "SERVICE_PORT"] {
            if let Some(port) = self.env.get(key).and_then(|v| v.parse().ok()) {
                return Some(port);
            }
        }
        None
    }
}

/// Recorded 1:1 association between a worker instance and its co-located
/// service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePair {
    /// Worker descriptor name
    pub worker_name: String,
    /// Service descriptor name
    pub service_name: String,
    /// Catalog service type
    pub service_type: String,
    /// Port bound by the service instance
    pub port: u16,
}

/// The serialized `apps + service_pairs` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Ordered process descriptors: health server first, then workers and
    /// their services in parse order
    pub apps: Vec<ProcessDescriptor>,
    /// Pairs in creation order
    pub service_pairs: Vec<ServicePair>,
}

impl Manifest {
    /// Enforce port uniqueness across all pairs on this host.
    pub fn validate_ports(&self) -> Result<()> {
        let mut seen: BTreeMap<u16, &str> = BTreeMap::new();
        for pair in &self.service_pairs {
            if let Some(first) = seen.insert(pair.port, &pair.service_name) {
                return Err(OrchestratorError::PortConflict {
                    port: pair.port,
                    first: first.to_string(),
                    second: pair.service_name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))
    }

    /// Write the manifest atomically at `path`.
    ///
    /// The document lands in a temp file in the target directory first and
    /// is renamed into place, so an aborted run never leaves a partial
    /// manifest at the canonical path.
    pub fn emit(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = path.with_extension("manifest.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        log::info!(
            "manifest written: {} apps, {} pairs -> {}",
            self.apps.len(),
            self.service_pairs.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, class: ProcessClass) -> ProcessDescriptor {
        ProcessDescriptor::new(
            name,
            class,
            Path::new("/ws/bin/launcher"),
            Path::new("/ws"),
            Path::new("/ws/logs"),
        )
    }

    #[test]
    fn test_class_defaults() {
        let worker = descriptor("redis-worker-sim-0", ProcessClass::Worker);
        assert_eq!(worker.min_uptime, "10s");
        assert_eq!(worker.max_memory_restart, "1G");
        assert_eq!(worker.restart_delay, 3000);
        assert_eq!(worker.max_restarts, 10);
        assert!(worker.autorestart);
        assert!(worker.merge_logs);
        assert_eq!(worker.instances, 1);

        let inference = descriptor("comfyui-gpu0", ProcessClass::InferenceService);
        assert_eq!(inference.max_memory_restart, "2G");
        assert_eq!(inference.restart_delay, 5000);

        let minimal = descriptor("widget-0", ProcessClass::MinimalService);
        assert_eq!(minimal.max_memory_restart, "256M");
        assert_eq!(minimal.min_uptime, "5s");
    }

    #[test]
    fn test_log_paths_derive_from_name() {
        let d = descriptor("health-server", ProcessClass::HealthServer);
        assert_eq!(d.error_file, "/ws/logs/health-server-error.log");
        assert_eq!(d.out_file, "/ws/logs/health-server-out.log");
        assert_eq!(d.log_file, "/ws/logs/health-server.log");
    }

    #[test]
    fn test_bound_port_prefers_arg() {
        let mut d = descriptor("comfyui-gpu0", ProcessClass::InferenceService);
        d.args = vec!["comfyui".into(), "--port=8189".into()];
        d.env.insert("COMFYUI_PORT".into(), "9999".into());
        assert_eq!(d.bound_port(), Some(8189));
    }

    #[test]
    fn test_bound_port_env_order() {
        let mut d = descriptor("simulation-0", ProcessClass::SimulationService);
        d.env.insert("SIMULATION_PORT".into(), "8299".into());
        d.env.insert("SERVICE_PORT".into(), "8300".into());
        assert_eq!(d.bound_port(), Some(8299));
        d.env.insert("PORT".into(), "7000".into());
        assert_eq!(d.bound_port(), Some(7000));
    }

    #[test]
    fn test_port_conflict_detected() {
        let manifest = Manifest {
            apps: vec![],
            service_pairs: vec![
                ServicePair {
                    worker_name: "redis-worker-a-0".into(),
                    service_name: "a-0".into(),
                    service_type: "pm2_service".into(),
                    port: 8300,
                },
                ServicePair {
                    worker_name: "redis-worker-b-0".into(),
                    service_name: "b-0".into(),
                    service_type: "pm2_service".into(),
                    port: 8300,
                },
            ],
        };
        assert!(matches!(
            manifest.validate_ports().unwrap_err(),
            OrchestratorError::PortConflict { port: 8300, .. }
        ));
    }

    #[test]
    fn test_emit_atomic_and_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecosystem.manifest");
        let manifest = Manifest {
            apps: vec![descriptor("health-server", ProcessClass::HealthServer)],
            service_pairs: vec![],
        };
        manifest.emit(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.apps.len(), 1);
        assert_eq!(parsed.apps[0].name, "health-server");
        // No temp file left behind
        assert!(!dir.path().join("ecosystem.manifest.tmp").exists());
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let mut d = descriptor("redis-worker-sim-0", ProcessClass::Worker);
        d.env.insert("B".into(), "2".into());
        d.env.insert("A".into(), "1".into());
        let manifest = Manifest { apps: vec![d], service_pairs: vec![] };
        assert_eq!(manifest.to_json().unwrap(), manifest.to_json().unwrap());
        let json = manifest.to_json().unwrap();
        assert!(json.find("\"A\"").unwrap() < json.find("\"B\"").unwrap());
    }
}
