//! Worker-spec parsing and instance-count resolution
//!
//! `WORKERS` is formatted `type:count(,type:count)*` where `count` is a
//! decimal integer or the literal `auto`. Parsing drops unknown worker types
//! with a warning and resolves every `auto` against the hardware snapshot,
//! so no `auto` survives into a [`WorkerSpec`].

use crate::catalog::{Catalog, ScalingStrategy, WorkerKind, WorkerTypeDef};
use crate::env::Env;
use crate::hardware::HardwareResources;
use crate::settings::GpuMode;
use serde::{Deserialize, Serialize};

/// Default spec applied when `WORKERS` is absent or empty.
pub const DEFAULT_WORKERS: &str = "simulation:1";

/// A resolved worker specification; `count` is always a positive integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Worker type name from the catalog
    pub worker_type: String,
    /// Resolved instance count
    pub count: u32,
}

/// Requested count before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedCount {
    /// The literal `auto`
    Auto,
    /// An explicit integer
    Fixed(u32),
}

/// Parse and resolve the `WORKERS` specification.
pub fn parse_worker_specs(
    env: &Env,
    catalog: &Catalog,
    hardware: &HardwareResources,
    gpu_mode: GpuMode,
) -> Vec<WorkerSpec> {
    let raw = match env.get("WORKERS").filter(|v| !v.trim().is_empty()) {
        Some(v) => v.to_string(),
        None => {
            log::warn!("WORKERS not set, defaulting to '{DEFAULT_WORKERS}'");
            DEFAULT_WORKERS.to_string()
        }
    };

    let mut specs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (type_name, count_str) = match entry.split_once(':') {
            Some((t, c)) => (t.trim(), c.trim()),
            None => (entry, "1"),
        };

        let Some(def) = catalog.worker_type(type_name) else {
            log::warn!("unknown worker type '{type_name}' in WORKERS, dropping it");
            continue;
        };

        let requested = if count_str.eq_ignore_ascii_case("auto") {
            RequestedCount::Auto
        } else {
            RequestedCount::Fixed(count_str.parse().unwrap_or_else(|_| {
                log::warn!("unparseable count '{count_str}' for '{type_name}', using 1");
                1
            }))
        };

        let count = resolve_instance_count(type_name, def, requested, catalog, hardware, gpu_mode, env);
        if count == 0 {
            log::warn!("worker type '{type_name}' resolved to zero instances, dropping it");
            continue;
        }
        specs.push(WorkerSpec {
            worker_type: type_name.to_string(),
            count,
        });
    }
    specs
}

/// Apply the scaling rules to one worker type.
///
/// `singleton` pins the count to one regardless of the request. GPU-bound
/// direct workers bind to `gpu_count` in actual mode (explicit requests are
/// truncated, with one informational log line). Concurrency-scaled clients
/// read their `<TYPE>_CONCURRENCY` knob, except daemon clients whose daemon
/// itself consumes the GPUs, which scale with the GPU count instead.
pub fn resolve_instance_count(
    name: &str,
    def: &WorkerTypeDef,
    requested: RequestedCount,
    catalog: &Catalog,
    hardware: &HardwareResources,
    gpu_mode: GpuMode,
    env: &Env,
) -> u32 {
    let strategy = def.effective_strategy();
    if strategy == ScalingStrategy::Singleton {
        return 1;
    }

    match def.kind {
        WorkerKind::DirectWorker => {
            if !def.is_gpu_bound {
                return match requested {
                    RequestedCount::Auto => 1,
                    RequestedCount::Fixed(n) => n,
                };
            }
            match (gpu_mode, requested) {
                (GpuMode::Actual, RequestedCount::Auto) => hardware.gpu_count,
                (GpuMode::Actual, RequestedCount::Fixed(n)) => {
                    let count = n.min(hardware.gpu_count);
                    if count < n {
                        log::info!(
                            "truncating '{name}' workers {n} -> {count} ({} GPUs detected)",
                            hardware.gpu_count
                        );
                    }
                    count
                }
                (GpuMode::Mock, RequestedCount::Auto) => 1,
                (GpuMode::Mock, RequestedCount::Fixed(n)) => n,
            }
        }
        WorkerKind::ServiceClient => match requested {
            RequestedCount::Fixed(n) => n,
            RequestedCount::Auto if strategy == ScalingStrategy::Concurrency => {
                env.get_u32(&concurrency_env_key(name), 2)
            }
            RequestedCount::Auto => 1,
        },
        WorkerKind::DaemonClient => match requested {
            RequestedCount::Fixed(n) => n,
            RequestedCount::Auto => {
                if strategy != ScalingStrategy::Concurrency {
                    return 1;
                }
                if daemon_uses_gpu(def, catalog) {
                    match gpu_mode {
                        GpuMode::Actual => hardware.gpu_count.max(1),
                        GpuMode::Mock => env.get_u32("NUM_GPUS", 1).max(1),
                    }
                } else {
                    env.get_u32(&concurrency_env_key(name), 2)
                }
            }
        },
    }
}

/// A daemon client is GPU-consuming when any of its declared services is a
/// daemon-class catalog entry.
fn daemon_uses_gpu(def: &WorkerTypeDef, catalog: &Catalog) -> bool {
    def.services
        .iter()
        .any(|name| catalog.service(name).is_some_and(|s| s.kind.is_daemon()))
}

/// `<TYPE>_CONCURRENCY` knob name for a worker type.
fn concurrency_env_key(worker_type: &str) -> String {
    format!(
        "{}_CONCURRENCY",
        worker_type.to_uppercase().replace('-', "_")
    )
}
