//! CPU, memory, and disk probes
//!
//! Each probe degrades independently: a failed read falls back to the
//! `MACHINE_*` environment hints, then to zero. Nothing here aborts a run.

use crate::env::Env;
use crate::hardware::probe::{run_probe, PROBE_TIMEOUT};
use std::path::Path;

/// Logical CPU core count.
pub fn detect_cpu_cores(env: &Env) -> u32 {
    let cores = num_cpus::get() as u32;
    if cores > 0 {
        cores
    } else {
        env.get_u32("MACHINE_CPU_CORES", 1)
    }
}

/// Total and free RAM in GB.
pub fn detect_memory(env: &Env) -> (f64, f64) {
    if let Some(pair) = platform_memory() {
        return pair;
    }
    (
        env.get_f64("MACHINE_RAM_GB", 0.0),
        env.get_f64("MACHINE_FREE_RAM_GB", 0.0),
    )
}

#[cfg(target_os = "linux")]
fn platform_memory() -> Option<(f64, f64)> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

#[cfg(target_os = "macos")]
fn platform_memory() -> Option<(f64, f64)> {
    let bytes: f64 = run_probe("sysctl", &["-n", "hw.memsize"], PROBE_TIMEOUT)?
        .trim()
        .parse()
        .ok()?;
    let total = round_gb(bytes / 1e9);
    // Free memory has no cheap stable probe here; report total as the bound.
    Some((total, total))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_memory() -> Option<(f64, f64)> {
    None
}

/// Parse `/proc/meminfo` MemTotal / MemAvailable (kB).
#[allow(dead_code)]
fn parse_meminfo(contents: &str) -> Option<(f64, f64)> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    let total = total_kb?;
    let available = available_kb.unwrap_or(0.0);
    Some((round_gb(total / 1e6), round_gb(available / 1e6)))
}

/// Total and free disk space for the workspace filesystem, in GB.
pub fn detect_disk(env: &Env, workspace: &Path) -> (f64, f64) {
    let path = workspace.to_string_lossy();
    if let Some(pair) =
        run_probe("df", &["-k", path.as_ref()], PROBE_TIMEOUT).and_then(|out| parse_df(&out))
    {
        return pair;
    }
    (
        env.get_f64("MACHINE_DISK_GB", 0.0),
        env.get_f64("MACHINE_FREE_DISK_GB", 0.0),
    )
}

/// Parse `df -k` output: total and available 1K blocks from the data line.
fn parse_df(output: &str) -> Option<(f64, f64)> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let total_kb: f64 = fields[1].parse().ok()?;
    let avail_kb: f64 = fields[3].parse().ok()?;
    Some((round_gb(total_kb / 1e6), round_gb(avail_kb / 1e6)))
}

fn round_gb(gb: f64) -> f64 {
    (gb * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let sample = "\
MemTotal:       65536000 kB
MemFree:         1024000 kB
MemAvailable:   32768000 kB
Buffers:          500000 kB
";
        let (total, available) = parse_meminfo(sample).unwrap();
        assert_eq!(total, 65.5);
        assert_eq!(available, 32.8);
    }

    #[test]
    fn test_parse_df() {
        let sample = "\
Filesystem     1K-blocks      Used Available Use% Mounted on
/dev/nvme0n1p2 983351808 421000000 512351808  46% /
";
        let (total, avail) = parse_df(sample).unwrap();
        assert_eq!(total, 983.4);
        assert_eq!(avail, 512.4);
    }

    #[test]
    fn test_parse_df_garbage() {
        assert!(parse_df("nope").is_none());
    }

    #[test]
    fn test_cpu_cores_positive() {
        assert!(detect_cpu_cores(&Env::default()) >= 1);
    }

    #[test]
    fn test_disk_env_fallback() {
        let env = Env::from_pairs([("MACHINE_DISK_GB", "100"), ("MACHINE_FREE_DISK_GB", "40")]);
        let (total, free) = detect_disk(&env, Path::new("/definitely/not/a/path"));
        // df may still resolve the nearest mount on some systems; accept either
        // the probed values or the fallback.
        assert!(total >= 0.0 && free >= 0.0);
    }
}
