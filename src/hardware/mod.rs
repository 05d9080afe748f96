// SPDX-License-Identifier: Apache-2.0

//! Node hardware discovery
//!
//! [`detect`] produces one [`HardwareResources`] snapshot per run. The four
//! sub-detections (GPU, CPU, memory, disk) fan out on threads and are joined
//! before worker-spec resolution starts; each degrades independently and the
//! operation as a whole never fails.

pub mod gpu;
pub mod probe;
pub mod system;

use crate::env::Env;
use crate::settings::GpuMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use gpu::{GpuSnapshot, GpuVendor};

/// Snapshot of the node's hardware, computed once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareResources {
    /// Number of GPUs
    pub gpu_count: u32,
    /// Representative GPU model name
    pub gpu_model: String,
    /// GPU vendor classification
    pub gpu_vendor: GpuVendor,
    /// GPU memory in GB (hint)
    pub gpu_memory_gb: f64,
    /// Logical CPU cores
    pub cpu_cores: u32,
    /// Total RAM in GB
    pub ram_gb: f64,
    /// Available RAM in GB
    pub free_ram_gb: f64,
    /// Total disk space of the workspace filesystem in GB
    pub disk_gb: f64,
    /// Available disk space in GB
    pub free_disk_gb: f64,
    /// Operating system
    pub platform: String,
    /// CPU architecture
    pub architecture: String,
    /// Node hostname
    pub hostname: String,
    /// Detection timestamp, RFC 3339
    pub detected_at: String,
}

impl HardwareResources {
    /// Whether the node has any GPU.
    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// Detect node hardware.
///
/// GPU, memory, and disk probes run concurrently; the join is the single
/// synchronization point. Never fails: a failed probe leaves its own fields
/// at env-fallback or zero values and everything else stays valid.
pub fn detect(env: &Env, gpu_mode: GpuMode, workspace: &Path) -> HardwareResources {
    let gpu_env = env.clone();
    let gpu_handle = std::thread::spawn(move || gpu::detect_gpus(&gpu_env, gpu_mode));

    let mem_env = env.clone();
    let mem_handle = std::thread::spawn(move || system::detect_memory(&mem_env));

    let disk_env = env.clone();
    let disk_workspace = workspace.to_path_buf();
    let disk_handle =
        std::thread::spawn(move || system::detect_disk(&disk_env, &disk_workspace));

    let cpu_cores = system::detect_cpu_cores(env);

    let gpu = gpu_handle
        .join()
        .unwrap_or_else(|_| gpu::detect_gpus(env, gpu_mode));
    let (ram_gb, free_ram_gb) = mem_handle.join().unwrap_or((0.0, 0.0));
    let (disk_gb, free_disk_gb) = disk_handle.join().unwrap_or((0.0, 0.0));

    HardwareResources {
        gpu_count: gpu.count,
        gpu_model: gpu.model,
        gpu_vendor: gpu.vendor,
        gpu_memory_gb: gpu.memory_gb,
        cpu_cores,
        ram_gb,
        free_ram_gb,
        disk_gb,
        free_disk_gb,
        platform: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string()),
        detected_at: chrono::Utc::now().to_rfc3339(),
    }
}

/// Fixed snapshot for resolver and builder tests.
#[cfg(test)]
pub(crate) fn fake(gpu_count: u32) -> HardwareResources {
    HardwareResources {
        gpu_count,
        gpu_model: if gpu_count > 0 {
            "NVIDIA GeForce RTX 4090".to_string()
        } else {
            "none".to_string()
        },
        gpu_vendor: if gpu_count > 0 {
            GpuVendor::Nvidia
        } else {
            GpuVendor::None
        },
        gpu_memory_gb: if gpu_count > 0 { 24.0 } else { 0.0 },
        cpu_cores: 16,
        ram_gb: 64.0,
        free_ram_gb: 32.0,
        disk_gb: 1000.0,
        free_disk_gb: 500.0,
        platform: "linux".to_string(),
        architecture: "x86_64".to_string(),
        hostname: "test-node".to_string(),
        detected_at: "2024-01-01T00:00:00+00:00".to_string(),
    }
}
