// SPDX-License-Identifier: Apache-2.0

//! GPU enumeration and vendor classification
//!
//! Detection is an ordered fall-through, first success wins:
//!
//! 1. `nvidia-smi -L` when the host has the NVIDIA enumeration tool
//! 2. Platform listing: `lspci` (Linux), `system_profiler` (macOS),
//!    `wmic` (Windows)
//! 3. `MACHINE_*` environment fallbacks, only under `GPU_MODE=mock`
//! 4. Zero GPUs
//!
//! All probes are bounded by [`probe::PROBE_TIMEOUT`](super::probe); a failed
//! probe only moves detection to the next rung.

use crate::env::Env;
use crate::hardware::probe::{run_probe, PROBE_TIMEOUT};
use crate::settings::GpuMode;
use serde::{Deserialize, Serialize};

/// GPU vendor classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    /// NVIDIA GPUs
    #[serde(rename = "NVIDIA")]
    Nvidia,
    /// AMD GPUs
    #[serde(rename = "AMD")]
    Amd,
    /// Intel GPUs
    Intel,
    /// Apple silicon GPUs
    Apple,
    /// Declared through `MACHINE_*` env fallbacks
    Environment,
    /// No GPU detected
    #[serde(rename = "none")]
    None,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Apple => write!(f, "Apple"),
            GpuVendor::Environment => write!(f, "Environment"),
            GpuVendor::None => write!(f, "none"),
        }
    }
}

/// Result of GPU detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSnapshot {
    /// Number of GPUs
    pub count: u32,
    /// Representative model name
    pub model: String,
    /// Vendor classification
    pub vendor: GpuVendor,
    /// Memory per GPU in GB; a hint, not a contract
    pub memory_gb: f64,
}

impl GpuSnapshot {
    fn none() -> Self {
        Self {
            count: 0,
            model: "none".to_string(),
            vendor: GpuVendor::None,
            memory_gb: 0.0,
        }
    }
}

/// Detect GPUs for this node.
pub fn detect_gpus(env: &Env, gpu_mode: GpuMode) -> GpuSnapshot {
    if let Some(snapshot) = nvidia_smi_detect() {
        return snapshot;
    }
    if let Some(snapshot) = platform_detect() {
        return snapshot;
    }
    if gpu_mode == GpuMode::Mock {
        if let Some(snapshot) = env_fallback(env) {
            log::info!(
                "no GPUs detected, using environment fallback: {} x {}",
                snapshot.count,
                snapshot.model
            );
            return snapshot;
        }
    }
    GpuSnapshot::none()
}

fn nvidia_smi_detect() -> Option<GpuSnapshot> {
    let listing = run_probe("nvidia-smi", &["-L"], PROBE_TIMEOUT)?;
    let mut snapshot = parse_nvidia_smi_list(&listing)?;

    // The query form reports real memory; the model heuristic is the hint
    // used when it is unavailable.
    snapshot.memory_gb = run_probe(
        "nvidia-smi",
        &["--query-gpu=memory.total", "--format=csv,noheader,nounits"],
        PROBE_TIMEOUT,
    )
    .and_then(|out| parse_memory_query(&out))
    .unwrap_or_else(|| model_memory_hint(&snapshot.model));

    Some(snapshot)
}

/// Parse `nvidia-smi -L` output: one `GPU <i>: <model> (UUID: ...)` per line.
fn parse_nvidia_smi_list(output: &str) -> Option<GpuSnapshot> {
    let mut models: Vec<String> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("GPU ") {
            continue;
        }
        let model = line
            .split_once(": ")
            .map(|(_, rest)| rest)
            .map(|rest| rest.split(" (UUID").next().unwrap_or(rest))
            .unwrap_or("Unknown NVIDIA GPU")
            .trim()
            .to_string();
        models.push(model);
    }
    if models.is_empty() {
        return None;
    }

    let count = models.len() as u32;
    let mut unique: Vec<&String> = Vec::new();
    for model in &models {
        if !unique.contains(&model) {
            unique.push(model);
        }
    }
    let model = if unique.len() > 1 {
        format!("{} (+{} more)", unique[0], unique.len() - 1)
    } else {
        unique[0].clone()
    };

    Some(GpuSnapshot {
        count,
        model,
        vendor: GpuVendor::Nvidia,
        memory_gb: 0.0,
    })
}

/// Parse the memory query form: one MiB value per line.
fn parse_memory_query(output: &str) -> Option<f64> {
    let mib: f64 = output.lines().next()?.trim().parse().ok()?;
    Some((mib / 1024.0 * 10.0).round() / 10.0)
}

/// Memory hint per well-known model identifier, in GB.
fn model_memory_hint(model: &str) -> f64 {
    let model = model.to_lowercase();
    const HINTS: &[(&str, f64)] = &[
        ("5090", 32.0),
        ("4090", 24.0),
        ("3090", 24.0),
        ("4080", 16.0),
        ("3080", 10.0),
        ("a6000", 48.0),
        ("l40s", 48.0),
        ("l4", 24.0),
        ("a100", 40.0),
        ("h100", 80.0),
        ("t4", 16.0),
    ];
    for (needle, gb) in HINTS {
        if model.contains(needle) {
            return *gb;
        }
    }
    8.0
}

#[cfg(target_os = "linux")]
fn platform_detect() -> Option<GpuSnapshot> {
    let listing = run_probe("lspci", &[], PROBE_TIMEOUT)?;
    parse_lspci(&listing)
}

#[cfg(target_os = "macos")]
fn platform_detect() -> Option<GpuSnapshot> {
    let listing = run_probe("system_profiler", &["SPDisplaysDataType"], PROBE_TIMEOUT)?;
    parse_system_profiler(&listing)
}

#[cfg(target_os = "windows")]
fn platform_detect() -> Option<GpuSnapshot> {
    let listing = run_probe(
        "wmic",
        &["path", "win32_VideoController", "get", "name"],
        PROBE_TIMEOUT,
    )?;
    parse_video_controllers(&listing)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn platform_detect() -> Option<GpuSnapshot> {
    None
}

/// Count PCI display-class devices and classify the vendor by substring.
fn parse_lspci(output: &str) -> Option<GpuSnapshot> {
    let mut count = 0u32;
    let mut vendor = GpuVendor::None;
    let mut model = String::new();

    for line in output.lines() {
        let lower = line.to_lowercase();
        let is_display = lower.contains("vga") || lower.contains("display") || lower.contains(" 3d ");
        if !is_display {
            continue;
        }
        count += 1;
        if vendor == GpuVendor::None {
            vendor = classify_vendor(&lower);
            model = line
                .split_once(": ")
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_else(|| "Unknown GPU".to_string());
        }
    }

    if count == 0 {
        return None;
    }
    let memory_gb = model_memory_hint(&model);
    Some(GpuSnapshot {
        count,
        model,
        vendor,
        memory_gb,
    })
}

/// Count `Chipset Model:` entries from `system_profiler SPDisplaysDataType`.
#[allow(dead_code)]
fn parse_system_profiler(output: &str) -> Option<GpuSnapshot> {
    let mut count = 0u32;
    let mut model = String::new();
    for line in output.lines() {
        if let Some(value) = line.trim().strip_prefix("Chipset Model:") {
            count += 1;
            if model.is_empty() {
                model = value.trim().to_string();
            }
        }
    }
    if count == 0 {
        return None;
    }
    let vendor = if model.contains("Apple") {
        GpuVendor::Apple
    } else {
        classify_vendor(&model.to_lowercase())
    };
    Some(GpuSnapshot {
        count,
        model,
        vendor,
        memory_gb: 0.0,
    })
}

/// Parse `wmic path win32_VideoController get name` output.
#[allow(dead_code)]
fn parse_video_controllers(output: &str) -> Option<GpuSnapshot> {
    let mut count = 0u32;
    let mut model = String::new();
    for line in output.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;
        if model.is_empty() {
            model = line.to_string();
        }
    }
    if count == 0 {
        return None;
    }
    Some(GpuSnapshot {
        count,
        vendor: classify_vendor(&model.to_lowercase()),
        memory_gb: model_memory_hint(&model),
        model,
    })
}

fn classify_vendor(lower: &str) -> GpuVendor {
    if lower.contains("nvidia") {
        GpuVendor::Nvidia
    } else if lower.contains("amd") || lower.contains("ati ") || lower.contains("radeon") {
        GpuVendor::Amd
    } else if lower.contains("intel") {
        GpuVendor::Intel
    } else {
        GpuVendor::None
    }
}

/// `MACHINE_*` fallbacks, honored only under mock mode.
fn env_fallback(env: &Env) -> Option<GpuSnapshot> {
    let count = match env.get("MACHINE_NUM_GPUS") {
        Some(v) => v.trim().parse().ok()?,
        None if env.get_bool("MACHINE_HAS_GPU", false) => 1,
        None => return None,
    };
    if count == 0 {
        return None;
    }
    Some(GpuSnapshot {
        count,
        model: env.get_or("MACHINE_GPU_MODEL", "Mock GPU"),
        vendor: GpuVendor::Environment,
        memory_gb: env.get_f64("MACHINE_GPU_MEMORY_GB", 24.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMI_TWO_4090: &str = "\
GPU 0: NVIDIA GeForce RTX 4090 (UUID: GPU-8a5c1d2e-0000-0000-0000-000000000000)
GPU 1: NVIDIA GeForce RTX 4090 (UUID: GPU-9b6d2e3f-0000-0000-0000-000000000000)
";

    const SMI_MIXED: &str = "\
GPU 0: NVIDIA GeForce RTX 4090 (UUID: GPU-aaaa)
GPU 1: NVIDIA L40S (UUID: GPU-bbbb)
GPU 2: NVIDIA GeForce RTX 4090 (UUID: GPU-cccc)
";

    #[test]
    fn test_parse_nvidia_smi_list() {
        let snap = parse_nvidia_smi_list(SMI_TWO_4090).unwrap();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.vendor, GpuVendor::Nvidia);
        assert_eq!(snap.model, "NVIDIA GeForce RTX 4090");
    }

    #[test]
    fn test_parse_nvidia_smi_mixed_models() {
        let snap = parse_nvidia_smi_list(SMI_MIXED).unwrap();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.model, "NVIDIA GeForce RTX 4090 (+1 more)");
    }

    #[test]
    fn test_parse_nvidia_smi_empty() {
        assert!(parse_nvidia_smi_list("No devices found.\n").is_none());
    }

    #[test]
    fn test_parse_memory_query() {
        assert_eq!(parse_memory_query("24564\n24564\n"), Some(24.0));
        assert!(parse_memory_query("garbage").is_none());
    }

    #[test]
    fn test_model_memory_hint() {
        assert_eq!(model_memory_hint("NVIDIA GeForce RTX 4090"), 24.0);
        assert_eq!(model_memory_hint("NVIDIA H100 PCIe"), 80.0);
        assert_eq!(model_memory_hint("Matrox G200"), 8.0);
    }

    #[test]
    fn test_parse_lspci() {
        let out = "\
00:02.0 VGA compatible controller: Intel Corporation UHD Graphics 630
01:00.0 VGA compatible controller: NVIDIA Corporation AD102 [GeForce RTX 4090]
02:00.0 Audio device: NVIDIA Corporation AD102 High Definition Audio
";
        let snap = parse_lspci(out).unwrap();
        assert_eq!(snap.count, 2);
        // First display line wins vendor classification
        assert_eq!(snap.vendor, GpuVendor::Intel);
    }

    #[test]
    fn test_parse_system_profiler() {
        let out = "\
Graphics/Displays:

    Apple M2 Max:

      Chipset Model: Apple M2 Max
      Type: GPU
";
        let snap = parse_system_profiler(out).unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.vendor, GpuVendor::Apple);
        assert_eq!(snap.model, "Apple M2 Max");
    }

    #[test]
    fn test_env_fallback_only_with_gpu_declared() {
        let env = Env::from_pairs([
            ("MACHINE_NUM_GPUS", "4"),
            ("MACHINE_GPU_MODEL", "RTX 4090"),
            ("MACHINE_GPU_MEMORY_GB", "24"),
        ]);
        let snap = env_fallback(&env).unwrap();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.vendor, GpuVendor::Environment);
        assert_eq!(snap.memory_gb, 24.0);

        assert!(env_fallback(&Env::default()).is_none());

        let env = Env::from_pairs([("MACHINE_HAS_GPU", "true")]);
        assert_eq!(env_fallback(&env).unwrap().count, 1);
    }

    #[test]
    fn test_vendor_display() {
        assert_eq!(GpuVendor::Nvidia.to_string(), "NVIDIA");
        assert_eq!(GpuVendor::None.to_string(), "none");
        assert_eq!(GpuVendor::Environment.to_string(), "Environment");
    }
}
