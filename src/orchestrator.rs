//! The orchestration pipeline
//!
//! One [`Orchestrator`] run wires the components in data-flow order: catalog
//! load, hardware detection, worker-spec resolution, manifest assembly,
//! daemon bootstrap, manifest emission. Everything after hardware detection
//! is strictly sequential; daemons start before the manifest is written so
//! dependent workers never race them.

use crate::catalog::{Catalog, ServiceEnvMapping};
use crate::daemon::{self, DaemonReport};
use crate::env::Env;
use crate::error::Result;
use crate::hardware::{self, HardwareResources};
use crate::manifest::{Manifest, ManifestBuilder};
use crate::settings::Settings;
use crate::workers::{self, WorkerSpec};

/// Everything a run decided, before and after emission.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The hardware snapshot the resolution used
    pub hardware: HardwareResources,
    /// Resolved worker specs, no `auto` remaining
    pub specs: Vec<WorkerSpec>,
    /// The assembled manifest
    pub manifest: Manifest,
}

/// Orchestrator entry point.
pub struct Orchestrator {
    env: Env,
    settings: Settings,
    catalog: Catalog,
    mapping: ServiceEnvMapping,
}

impl Orchestrator {
    /// Assemble from pre-loaded parts.
    pub fn new(env: Env, settings: Settings, catalog: Catalog, mapping: ServiceEnvMapping) -> Self {
        Self { env, settings, catalog, mapping }
    }

    /// Bootstrap from the environment: resolve settings and locate the
    /// catalog through the candidate-path search.
    pub fn from_env(env: Env) -> Result<Self> {
        let settings = Settings::from_env(&env)?;
        let (catalog, mapping) = Catalog::load(&env, &settings.workspace_dir)?;
        Ok(Self::new(env, settings, catalog, mapping))
    }

    /// Bootstrap with an explicit catalog path, bypassing the search.
    pub fn with_catalog_path(env: Env, catalog_path: &std::path::Path) -> Result<Self> {
        let settings = Settings::from_env(&env)?;
        let catalog = Catalog::load_from_path(catalog_path, &env)?;
        // The env mapping stays a sibling of whichever catalog file is used
        let mapping = ServiceEnvMapping::load_sibling(catalog_path, &env)?;
        Ok(Self::new(env, settings, catalog, mapping))
    }

    /// Resolved settings for this run.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Detect hardware and assemble the manifest.
    pub fn plan(&self) -> Result<Plan> {
        let hardware = hardware::detect(&self.env, self.settings.gpu_mode, &self.settings.workspace_dir);
        log::info!(
            "hardware: {} x {} ({}), {} cores, {:.0} GB RAM, mode {}",
            hardware.gpu_count,
            hardware.gpu_model,
            hardware.gpu_vendor,
            hardware.cpu_cores,
            hardware.ram_gb,
            self.settings.gpu_mode
        );
        self.plan_for(hardware)
    }

    /// Assemble the manifest against a known hardware snapshot.
    pub fn plan_for(&self, hardware: HardwareResources) -> Result<Plan> {
        let specs =
            workers::parse_worker_specs(&self.env, &self.catalog, &hardware, self.settings.gpu_mode);
        let manifest =
            ManifestBuilder::new(&self.env, &self.settings, &self.catalog, &self.mapping)
                .build(&specs)?;
        Ok(Plan { hardware, specs, manifest })
    }

    /// Bootstrap the daemons a plan requires.
    pub fn bootstrap_daemons(&self, plan: &Plan) -> Result<Vec<DaemonReport>> {
        daemon::bootstrap_daemons(&plan.specs, &self.catalog, &self.settings)
    }

    /// Full run: plan, start daemons, emit the manifest.
    ///
    /// With `skip_daemons` the bootstrap step is left out entirely; the
    /// manifest still emits.
    pub fn run(&self, skip_daemons: bool) -> Result<Plan> {
        let plan = self.plan()?;
        if skip_daemons {
            log::info!("daemon bootstrap skipped");
        } else {
            let reports = self.bootstrap_daemons(&plan)?;
            for report in &reports {
                if !report.installed {
                    log::warn!("daemon '{}' unavailable, dependent workers will report connect errors", report.service);
                }
            }
        }
        plan.manifest.emit(&self.settings.manifest_path())?;
        Ok(plan)
    }
}
