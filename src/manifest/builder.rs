//! Manifest assembly
//!
//! [`ManifestBuilder`] turns resolved worker specs into the ordered
//! descriptor list: health server first, then each worker type's instances in
//! ascending index order, each worker followed by its co-located services.
//! Worker/service pairs are recorded as the services are expanded; the
//! builder value is threaded through the run, there is no global state.

use crate::catalog::{Catalog, ServiceDef, ServiceEnvMapping};
use crate::env::Env;
use crate::error::{OrchestratorError, Result};
use crate::manifest::env::EnvDerivation;
use crate::manifest::{Manifest, ProcessClass, ProcessDescriptor, ServicePair};
use crate::settings::Settings;
use crate::workers::WorkerSpec;

/// Base port for simulation HTTP services
const SIMULATION_BASE_PORT: u16 = 8299;
/// Base port for simulation websocket services
const SIMULATION_WS_BASE_PORT: u16 = 8399;
/// Base port for minimal services
const MINIMAL_BASE_PORT: u16 = 8300;

/// Builds the process manifest for one run.
pub struct ManifestBuilder<'a> {
    settings: &'a Settings,
    catalog: &'a Catalog,
    derivation: EnvDerivation<'a>,
    apps: Vec<ProcessDescriptor>,
    pairs: Vec<ServicePair>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(
        env: &'a Env,
        settings: &'a Settings,
        catalog: &'a Catalog,
        mapping: &'a ServiceEnvMapping,
    ) -> Self {
        Self {
            settings,
            catalog,
            derivation: EnvDerivation::new(env, settings, catalog, mapping),
            apps: Vec::new(),
            pairs: Vec::new(),
        }
    }

    /// Expand the resolved specs into the complete manifest.
    pub fn build(mut self, specs: &[WorkerSpec]) -> Result<Manifest> {
        self.push_health_server();
        for spec in specs {
            for index in 0..spec.count {
                self.push_worker_instance(spec, index)?;
            }
        }

        let manifest = Manifest {
            apps: self.apps,
            service_pairs: self.pairs,
        };
        manifest.validate_ports()?;
        Ok(manifest)
    }

    fn descriptor(&self, name: impl Into<String>, class: ProcessClass) -> ProcessDescriptor {
        ProcessDescriptor::new(
            name,
            class,
            &self.settings.launcher_script,
            &self.settings.workspace_dir,
            &self.settings.log_dir(),
        )
    }

    fn push_health_server(&mut self) {
        let mut health = self.descriptor("health-server", ProcessClass::HealthServer);
        health.args = vec!["health-server".to_string()];
        health.env = self.derivation.health_env(self.settings.health_port);
        self.apps.push(health);
    }

    fn push_worker_instance(&mut self, spec: &WorkerSpec, index: u32) -> Result<()> {
        let Some(def) = self.catalog.worker_type(&spec.worker_type) else {
            log::warn!("spec names undefined worker type '{}', skipping", spec.worker_type);
            return Ok(());
        };

        let worker_name = if def.is_gpu_bound {
            format!("redis-worker-{}-gpu{index}", spec.worker_type)
        } else {
            format!("redis-worker-{}-{index}", spec.worker_type)
        };

        let mut worker = self.descriptor(&worker_name, ProcessClass::Worker);
        worker.args.push("redis-worker".to_string());
        if def.is_gpu_bound {
            worker.args.push(format!("--cuda-device={index}"));
        } else {
            worker.args.push(format!("--index={index}"));
        }
        if self.declares_comfyui(def.services.iter()) {
            let port = self.settings.comfyui_base_port as u32 + index;
            worker.args.push(format!("--service-port={port}"));
        }
        worker.env = self.derivation.worker_env(&spec.worker_type, def, index);
        self.apps.push(worker);

        for service_name in &def.services {
            let Some(service) = self.catalog.service(service_name) else {
                log::warn!(
                    "worker type '{}' names unknown service '{service_name}', skipping it",
                    spec.worker_type
                );
                continue;
            };
            if !service.kind.is_colocated() {
                // Daemon-class and external services never produce descriptors
                continue;
            }
            let descriptor = self.service_descriptor(service_name, service, index)?;
            let port = descriptor.bound_port().unwrap_or_default();
            self.pairs.push(ServicePair {
                worker_name: worker_name.clone(),
                service_name: descriptor.name.clone(),
                service_type: service.kind.to_string(),
                port,
            });
            self.apps.push(descriptor);
        }
        Ok(())
    }

    /// Instantiate one co-located service, driven by its installer.
    fn service_descriptor(
        &self,
        service_name: &str,
        service: &ServiceDef,
        index: u32,
    ) -> Result<ProcessDescriptor> {
        match service.installer.as_deref() {
            Some("ComfyUIManagementClient") => {
                let port = self.settings.comfyui_base_port + index as u16;
                let mut d =
                    self.descriptor(format!("{service_name}-gpu{index}"), ProcessClass::InferenceService);
                d.args = vec![
                    "comfyui".to_string(),
                    format!("--cuda-device={index}"),
                    format!("--port={port}"),
                ];
                d.env = self.derivation.service_env(service, index, "COMFYUI_PORT", port);
                Ok(d)
            }
            Some("SimulationService") => {
                let port = SIMULATION_BASE_PORT + index as u16;
                let mut d =
                    self.descriptor(format!("{service_name}-{index}"), ProcessClass::SimulationService);
                d.args = vec!["simulation".to_string(), format!("--gpu={index}")];
                d.env = self.derivation.service_env(service, index, "SIMULATION_PORT", port);
                Ok(d)
            }
            None if service_name == "simulation-websocket" => {
                let port = SIMULATION_WS_BASE_PORT + index as u16;
                let mut d =
                    self.descriptor(format!("{service_name}-{index}"), ProcessClass::SimulationService);
                d.args = vec![service_name.to_string(), format!("--index={index}")];
                d.env = self.derivation.service_env(service, index, "SIMULATION_PORT", port);
                Ok(d)
            }
            None => {
                let port = MINIMAL_BASE_PORT + index as u16;
                let mut d =
                    self.descriptor(format!("{service_name}-{index}"), ProcessClass::MinimalService);
                d.args = vec![service_name.to_string(), format!("--index={index}")];
                d.env = self.derivation.service_env(service, index, "SERVICE_PORT", port);
                Ok(d)
            }
            Some(unknown) => Err(OrchestratorError::UnknownInstaller {
                installer: unknown.to_string(),
                service: service_name.to_string(),
            }),
        }
    }

    fn declares_comfyui<'s>(&self, mut services: impl Iterator<Item = &'s String>) -> bool {
        services.any(|name| {
            self.catalog
                .service(name)
                .and_then(|s| s.installer.as_deref())
                .is_some_and(|installer| installer == "ComfyUIManagementClient")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ServiceKind, WorkerKind, WorkerTypeDef};

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.workers.insert(
            "comfyui".to_string(),
            WorkerTypeDef {
                kind: WorkerKind::DirectWorker,
                is_gpu_bound: true,
                scaling_strategy: None,
                services: vec!["comfyui".to_string()],
                required_env: vec![],
            },
        );
        catalog.workers.insert(
            "simulation".to_string(),
            WorkerTypeDef {
                kind: WorkerKind::ServiceClient,
                is_gpu_bound: false,
                scaling_strategy: Some(crate::catalog::ScalingStrategy::Concurrency),
                services: vec!["simulation".to_string()],
                required_env: vec![],
            },
        );
        catalog.services.insert(
            "comfyui".to_string(),
            ServiceDef {
                kind: ServiceKind::Pm2Service,
                installer: Some("ComfyUIManagementClient".to_string()),
                installer_filename: None,
                is_gpu_bound: true,
                connector: Some("comfyui".to_string()),
                job_types_accepted: vec![],
            },
        );
        catalog.services.insert(
            "simulation".to_string(),
            ServiceDef {
                kind: ServiceKind::Pm2Service,
                installer: Some("SimulationService".to_string()),
                installer_filename: None,
                is_gpu_bound: false,
                connector: Some("simulation".to_string()),
                job_types_accepted: vec![],
            },
        );
        catalog
    }

    fn build(env: &Env, specs: &[WorkerSpec]) -> Result<Manifest> {
        let settings = Settings::from_env(env).unwrap();
        let catalog = catalog();
        let mapping = ServiceEnvMapping::default();
        ManifestBuilder::new(env, &settings, &catalog, &mapping).build(specs)
    }

    fn base_env() -> Env {
        Env::from_pairs([
            ("REDIS_URL", "redis://queue:6379"),
            ("MACHINE_ID", "node-A"),
            ("WORKSPACE_DIR", "/ws"),
        ])
    }

    #[test]
    fn test_health_server_is_first() {
        let manifest = build(&base_env(), &[]).unwrap();
        assert_eq!(manifest.apps.len(), 1);
        assert_eq!(manifest.apps[0].name, "health-server");
        assert_eq!(manifest.apps[0].args, vec!["health-server"]);
    }

    #[test]
    fn test_gpu_worker_expansion_with_services() {
        let specs = [WorkerSpec { worker_type: "comfyui".into(), count: 2 }];
        let manifest = build(&base_env(), &specs).unwrap();

        let names: Vec<&str> = manifest.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "health-server",
                "redis-worker-comfyui-gpu0",
                "comfyui-gpu0",
                "redis-worker-comfyui-gpu1",
                "comfyui-gpu1",
            ]
        );

        let worker0 = &manifest.apps[1];
        assert_eq!(worker0.args, vec!["redis-worker", "--cuda-device=0", "--service-port=8188"]);
        let worker1 = &manifest.apps[3];
        assert_eq!(worker1.args, vec!["redis-worker", "--cuda-device=1", "--service-port=8189"]);

        let service0 = &manifest.apps[2];
        assert_eq!(service0.args, vec!["comfyui", "--cuda-device=0", "--port=8188"]);
        assert_eq!(service0.env["CUDA_VISIBLE_DEVICES"], "0");

        assert_eq!(manifest.service_pairs.len(), 2);
        assert_eq!(
            manifest.service_pairs[0],
            ServicePair {
                worker_name: "redis-worker-comfyui-gpu0".into(),
                service_name: "comfyui-gpu0".into(),
                service_type: "pm2_service".into(),
                port: 8188,
            }
        );
        assert_eq!(manifest.service_pairs[1].port, 8189);
    }

    #[test]
    fn test_non_gpu_worker_naming_and_args() {
        let specs = [WorkerSpec { worker_type: "simulation".into(), count: 1 }];
        let manifest = build(&base_env(), &specs).unwrap();

        let worker = &manifest.apps[1];
        assert_eq!(worker.name, "redis-worker-simulation-0");
        assert_eq!(worker.args, vec!["redis-worker", "--index=0"]);

        let service = &manifest.apps[2];
        assert_eq!(service.name, "simulation-0");
        assert_eq!(service.args, vec!["simulation", "--gpu=0"]);
        assert_eq!(service.env["SIMULATION_PORT"], "8299");
        assert_eq!(manifest.service_pairs[0].port, 8299);
    }

    #[test]
    fn test_unknown_installer_is_fatal() {
        let env = base_env();
        let settings = Settings::from_env(&env).unwrap();
        let mut catalog = catalog();
        catalog.services.insert(
            "mystery".to_string(),
            ServiceDef {
                kind: ServiceKind::Pm2Service,
                installer: Some("MysteryClient".to_string()),
                installer_filename: None,
                is_gpu_bound: false,
                connector: None,
                job_types_accepted: vec![],
            },
        );
        catalog.workers.insert(
            "mystery".to_string(),
            WorkerTypeDef {
                kind: WorkerKind::ServiceClient,
                is_gpu_bound: false,
                scaling_strategy: None,
                services: vec!["mystery".to_string()],
                required_env: vec![],
            },
        );
        let mapping = ServiceEnvMapping::default();
        let specs = [WorkerSpec { worker_type: "mystery".into(), count: 1 }];
        let err = ManifestBuilder::new(&env, &settings, &catalog, &mapping)
            .build(&specs)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownInstaller { .. }));
    }

    #[test]
    fn test_daemon_services_produce_no_descriptors() {
        let env = base_env();
        let settings = Settings::from_env(&env).unwrap();
        let mut catalog = catalog();
        catalog.services.insert(
            "ollama".to_string(),
            ServiceDef {
                kind: ServiceKind::DaemonService,
                installer: None,
                installer_filename: None,
                is_gpu_bound: true,
                connector: Some("ollama".to_string()),
                job_types_accepted: vec![],
            },
        );
        catalog.workers.insert(
            "ollama".to_string(),
            WorkerTypeDef {
                kind: WorkerKind::DaemonClient,
                is_gpu_bound: false,
                scaling_strategy: Some(crate::catalog::ScalingStrategy::Concurrency),
                services: vec!["ollama".to_string()],
                required_env: vec![],
            },
        );
        let mapping = ServiceEnvMapping::default();
        let specs = [WorkerSpec { worker_type: "ollama".into(), count: 3 }];
        let manifest = ManifestBuilder::new(&env, &settings, &catalog, &mapping)
            .build(&specs)
            .unwrap();

        // Health server + three workers, no service descriptors, no pairs
        assert_eq!(manifest.apps.len(), 4);
        assert!(manifest.service_pairs.is_empty());
        assert!(manifest.apps.iter().all(|a| !a.name.contains("ollama-") || a.name.starts_with("redis-worker")));
    }

    #[test]
    fn test_minimal_service_port_family() {
        let env = base_env();
        let settings = Settings::from_env(&env).unwrap();
        let mut catalog = catalog();
        catalog.services.insert(
            "widget".to_string(),
            ServiceDef {
                kind: ServiceKind::Pm2Service,
                installer: None,
                installer_filename: None,
                is_gpu_bound: false,
                connector: None,
                job_types_accepted: vec![],
            },
        );
        catalog.workers.insert(
            "widget".to_string(),
            WorkerTypeDef {
                kind: WorkerKind::ServiceClient,
                is_gpu_bound: false,
                scaling_strategy: None,
                services: vec!["widget".to_string()],
                required_env: vec![],
            },
        );
        let mapping = ServiceEnvMapping::default();
        let specs = [WorkerSpec { worker_type: "widget".into(), count: 2 }];
        let manifest = ManifestBuilder::new(&env, &settings, &catalog, &mapping)
            .build(&specs)
            .unwrap();

        let service = manifest.apps.iter().find(|a| a.name == "widget-0").unwrap();
        assert_eq!(service.args, vec!["widget", "--index=0"]);
        assert_eq!(service.env["SERVICE_PORT"], "8300");
        assert_eq!(service.max_memory_restart, "256M");
        assert_eq!(manifest.service_pairs[1].port, 8301);
    }

    #[test]
    fn test_worker_log_files_under_workspace() {
        let specs = [WorkerSpec { worker_type: "comfyui".into(), count: 1 }];
        let manifest = build(&base_env(), &specs).unwrap();
        let worker = &manifest.apps[1];
        assert_eq!(worker.error_file, "/ws/logs/redis-worker-comfyui-gpu0-error.log");
        assert_eq!(worker.cwd, "/ws");
        assert_eq!(worker.script, "/ws/bin/launcher");
    }
}
