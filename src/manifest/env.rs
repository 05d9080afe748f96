//! Per-instance environment derivation
//!
//! Worker and service environments are ordered merges, later entries win:
//! host pass-through, fixed overrides, common worker knobs, declared
//! `required_env` forwards, service-derived env from the connector tables,
//! and finally service-specific port overrides.

use crate::catalog::{Catalog, ServiceDef, ServiceEnvMapping, WorkerTypeDef};
use crate::env::Env;
use crate::settings::Settings;
use std::collections::BTreeMap;

/// Common worker knobs and their documented defaults.
const WORKER_KNOBS: &[(&str, &str)] = &[
    ("WORKER_POLL_INTERVAL_MS", "1000"),
    ("WORKER_JOB_TIMEOUT_MINUTES", "30"),
    ("WORKER_QUALITY_LEVELS", "fast,quality"),
    ("WORKER_DEBUGGING_ENABLED", "false"),
    ("WORKER_DEVELOPMENT_MODE", "false"),
    ("WORKER_WEBSOCKET_AUTH_TOKEN", ""),
];

/// Everything env derivation needs, threaded explicitly through the builder.
pub struct EnvDerivation<'a> {
    pub(crate) env: &'a Env,
    pub(crate) settings: &'a Settings,
    pub(crate) catalog: &'a Catalog,
    pub(crate) mapping: &'a ServiceEnvMapping,
}

impl<'a> EnvDerivation<'a> {
    pub fn new(
        env: &'a Env,
        settings: &'a Settings,
        catalog: &'a Catalog,
        mapping: &'a ServiceEnvMapping,
    ) -> Self {
        Self { env, settings, catalog, mapping }
    }

    /// Environment for worker instance `index` of `worker_type`.
    pub fn worker_env(
        &self,
        worker_type: &str,
        def: &WorkerTypeDef,
        index: u32,
    ) -> BTreeMap<String, String> {
        let mut merged = self.passthrough();
        self.apply_fixed_overrides(&mut merged, worker_type, index);
        self.apply_worker_knobs(&mut merged);

        for name in &def.required_env {
            if let Some(value) = self.env.get(name) {
                merged.insert(name.clone(), value.to_string());
            }
        }

        for service_name in &def.services {
            if let Some(service) = self.catalog.service(service_name) {
                self.apply_service_derived(&mut merged, service, index);
                self.apply_service_port_override(&mut merged, service_name, service, index);
            }
        }
        merged
    }

    /// Environment for the health server descriptor.
    pub fn health_env(&self, port: u16) -> BTreeMap<String, String> {
        let mut merged = self.passthrough();
        merged.insert("LOG_LEVEL".to_string(), "info".to_string());
        merged.insert("APP_ENV".to_string(), "production".to_string());
        merged.insert("MACHINE_ID".to_string(), self.settings.machine_id.clone());
        merged.insert("LOG_SHIPPER_DISABLED".to_string(), "true".to_string());
        merged.insert("PORT".to_string(), port.to_string());
        merged
    }

    /// Environment for a co-located service instance.
    pub fn service_env(
        &self,
        service: &ServiceDef,
        index: u32,
        port_var: &str,
        port: u16,
    ) -> BTreeMap<String, String> {
        let mut merged = self.passthrough();
        merged.insert("LOG_LEVEL".to_string(), "info".to_string());
        merged.insert("APP_ENV".to_string(), "production".to_string());
        merged.insert("MACHINE_ID".to_string(), self.settings.machine_id.clone());
        merged.insert("LOG_SHIPPER_DISABLED".to_string(), "true".to_string());

        self.apply_service_derived(&mut merged, service, index);

        merged.insert(port_var.to_string(), port.to_string());
        if service.is_gpu_bound {
            merged.insert("CUDA_VISIBLE_DEVICES".to_string(), index.to_string());
        }
        merged
    }

    fn passthrough(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn apply_fixed_overrides(
        &self,
        merged: &mut BTreeMap<String, String>,
        worker_type: &str,
        index: u32,
    ) {
        merged.insert("LOG_LEVEL".to_string(), "info".to_string());
        merged.insert("APP_ENV".to_string(), "production".to_string());
        merged.insert(
            "WORKER_ID".to_string(),
            format!("{}-worker-{}-{}", self.settings.machine_id, worker_type, index),
        );
        merged.insert("CONNECTORS".to_string(), worker_type.to_string());
        merged.insert("MACHINE_ID".to_string(), self.settings.machine_id.clone());
        merged.insert("REDIS_URL".to_string(), self.settings.transport_url.clone());
        merged.insert("LOG_SHIPPER_DISABLED".to_string(), "true".to_string());
    }

    fn apply_worker_knobs(&self, merged: &mut BTreeMap<String, String>) {
        for (key, default) in WORKER_KNOBS {
            merged.insert(key.to_string(), self.env.get_or(key, default));
        }
    }

    /// Connector-declared env, falling back to the per-job-type tables.
    ///
    /// Values go through `${VAR:-default}` expansion against the host env;
    /// ComfyUI port variables additionally get the per-instance offset.
    fn apply_service_derived(
        &self,
        merged: &mut BTreeMap<String, String>,
        service: &ServiceDef,
        index: u32,
    ) {
        let connector_table = service
            .connector
            .as_deref()
            .and_then(|c| self.mapping.connectors.get(c));

        let tables: Vec<&std::collections::HashMap<String, String>> = match connector_table {
            Some(table) => vec![table],
            None => service
                .job_types_accepted
                .iter()
                .filter_map(|jt| self.mapping.job_types.get(jt))
                .collect(),
        };

        // Deterministic application order regardless of table iteration order
        let mut derived: BTreeMap<&str, &str> = BTreeMap::new();
        for table in tables {
            for (key, value) in table {
                derived.insert(key, value);
            }
        }

        for (key, raw) in derived {
            let mut value = self.env.substitute(raw);
            if key.contains("PORT") && key.contains("COMFYUI") {
                if let Ok(base) = value.trim().parse::<u32>() {
                    value = (base + index).to_string();
                }
            }
            merged.insert(key.to_string(), value);
        }
    }

    fn apply_service_port_override(
        &self,
        merged: &mut BTreeMap<String, String>,
        service_name: &str,
        service: &ServiceDef,
        index: u32,
    ) {
        match service.installer.as_deref() {
            Some("ComfyUIManagementClient") => {
                let port = self.settings.comfyui_base_port as u32 + index;
                merged.insert("COMFYUI_PORT".to_string(), port.to_string());
            }
            Some("SimulationService") => {
                merged.insert("SIMULATION_PORT".to_string(), (8299 + index).to_string());
            }
            None if service_name == "simulation-websocket" => {
                merged.insert("SIMULATION_PORT".to_string(), (8399 + index).to_string());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ServiceKind, WorkerKind};
    use std::collections::HashMap;

    fn make_settings(env: &Env) -> Settings {
        Settings::from_env(env).unwrap()
    }

    fn comfy_service() -> ServiceDef {
        ServiceDef {
            kind: ServiceKind::Pm2Service,
            installer: Some("ComfyUIManagementClient".to_string()),
            installer_filename: None,
            is_gpu_bound: true,
            connector: Some("comfyui".to_string()),
            job_types_accepted: vec!["image_generation".to_string()],
        }
    }

    fn comfy_catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.services.insert("comfyui".to_string(), comfy_service());
        catalog.workers.insert(
            "comfyui".to_string(),
            WorkerTypeDef {
                kind: WorkerKind::DirectWorker,
                is_gpu_bound: true,
                scaling_strategy: None,
                services: vec!["comfyui".to_string()],
                required_env: vec!["HF_TOKEN".to_string()],
            },
        );
        catalog
    }

    #[test]
    fn test_fixed_overrides_beat_passthrough() {
        let env = Env::from_pairs([
            ("REDIS_URL", "redis://queue:6379"),
            ("MACHINE_ID", "node-A"),
            ("LOG_LEVEL", "trace"),
        ]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mapping = ServiceEnvMapping::default();
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);

        let worker_env =
            derivation.worker_env("comfyui", catalog.worker_type("comfyui").unwrap(), 0);
        assert_eq!(worker_env["LOG_LEVEL"], "info");
        assert_eq!(worker_env["APP_ENV"], "production");
        assert_eq!(worker_env["WORKER_ID"], "node-A-worker-comfyui-0");
        assert_eq!(worker_env["CONNECTORS"], "comfyui");
        assert_eq!(worker_env["REDIS_URL"], "redis://queue:6379");
        assert_eq!(worker_env["LOG_SHIPPER_DISABLED"], "true");
    }

    #[test]
    fn test_worker_knobs_defaults_and_host_overrides() {
        let env = Env::from_pairs([
            ("REDIS_URL", "redis://q:6379"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
        ]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mapping = ServiceEnvMapping::default();
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);

        let worker_env =
            derivation.worker_env("comfyui", catalog.worker_type("comfyui").unwrap(), 0);
        assert_eq!(worker_env["WORKER_POLL_INTERVAL_MS"], "250");
        assert_eq!(worker_env["WORKER_JOB_TIMEOUT_MINUTES"], "30");
        assert_eq!(worker_env["WORKER_DEBUGGING_ENABLED"], "false");
    }

    #[test]
    fn test_required_env_forwarded_only_when_present() {
        let env = Env::from_pairs([("REDIS_URL", "redis://q:6379"), ("HF_TOKEN", "hf_abc")]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mapping = ServiceEnvMapping::default();
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);
        let worker_env =
            derivation.worker_env("comfyui", catalog.worker_type("comfyui").unwrap(), 0);
        assert_eq!(worker_env["HF_TOKEN"], "hf_abc");

        let env = Env::from_pairs([("REDIS_URL", "redis://q:6379")]);
        let settings2 = make_settings(&env);
        let derivation = EnvDerivation::new(&env, &settings2, &catalog, &mapping);
        let worker_env =
            derivation.worker_env("comfyui", catalog.worker_type("comfyui").unwrap(), 0);
        assert!(!worker_env.contains_key("HF_TOKEN"));
    }

    #[test]
    fn test_comfyui_port_offsets_per_instance() {
        let env = Env::from_pairs([("REDIS_URL", "redis://q:6379")]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mapping = ServiceEnvMapping::default();
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);

        let def = catalog.worker_type("comfyui").unwrap();
        assert_eq!(derivation.worker_env("comfyui", def, 0)["COMFYUI_PORT"], "8188");
        assert_eq!(derivation.worker_env("comfyui", def, 1)["COMFYUI_PORT"], "8189");
    }

    #[test]
    fn test_connector_table_with_port_offset_expansion() {
        let env = Env::from_pairs([("REDIS_URL", "redis://q:6379"), ("COMFYUI_HOST", "gpu-3")]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mut mapping = ServiceEnvMapping::default();
        let mut table = HashMap::new();
        table.insert("COMFYUI_API_HOST".to_string(), "${COMFYUI_HOST:-localhost}".to_string());
        table.insert("COMFYUI_API_PORT".to_string(), "${COMFYUI_API_PORT:-8188}".to_string());
        mapping.connectors.insert("comfyui".to_string(), table);
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);

        let def = catalog.worker_type("comfyui").unwrap();
        let worker_env = derivation.worker_env("comfyui", def, 2);
        assert_eq!(worker_env["COMFYUI_API_HOST"], "gpu-3");
        // Declarative default 8188, plus the instance offset
        assert_eq!(worker_env["COMFYUI_API_PORT"], "8190");
    }

    #[test]
    fn test_job_type_fallback_when_no_connector_table() {
        let env = Env::from_pairs([("REDIS_URL", "redis://q:6379")]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mut mapping = ServiceEnvMapping::default();
        let mut table = HashMap::new();
        table.insert("MODEL_CACHE_DIR".to_string(), "${MODEL_CACHE_DIR:-/models}".to_string());
        mapping.job_types.insert("image_generation".to_string(), table);
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);

        let def = catalog.worker_type("comfyui").unwrap();
        let worker_env = derivation.worker_env("comfyui", def, 0);
        assert_eq!(worker_env["MODEL_CACHE_DIR"], "/models");
    }

    #[test]
    fn test_service_env_port_and_cuda_binding() {
        let env = Env::from_pairs([("REDIS_URL", "redis://q:6379")]);
        let settings = make_settings(&env);
        let catalog = comfy_catalog();
        let mapping = ServiceEnvMapping::default();
        let derivation = EnvDerivation::new(&env, &settings, &catalog, &mapping);

        let service_env = derivation.service_env(&comfy_service(), 1, "COMFYUI_PORT", 8189);
        assert_eq!(service_env["COMFYUI_PORT"], "8189");
        assert_eq!(service_env["CUDA_VISIBLE_DEVICES"], "1");
        assert_eq!(service_env["LOG_LEVEL"], "info");
    }
}
