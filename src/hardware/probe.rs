//! Bounded subprocess probes
//!
//! Every external detection tool is run through [`run_probe`], which caps the
//! child's lifetime and degrades to `None` on any failure. A hung vendor tool
//! must never stall orchestration.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Per-probe timeout applied to every hardware detection subprocess.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a probe command, returning its stdout on a zero exit within `timeout`.
///
/// Returns `None` when the tool is missing, exits non-zero, produces
/// undecodable output, or outlives the timeout (in which case it is killed).
pub fn run_probe(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    // Drain stdout on a separate thread so a chatty child can't fill the
    // pipe and deadlock against the exit poll below.
    let mut stdout = child.stdout.take()?;
    let reader = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stdout.read_to_string(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = reader.join().unwrap_or_default();
                if status.success() {
                    return Some(output);
                }
                log::debug!("probe '{program}' exited with {status}");
                return None;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    log::warn!("probe '{program}' exceeded {timeout:?}, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = reader.join();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                log::debug!("probe '{program}' wait failed: {e}");
                let _ = child.kill();
                let _ = reader.join();
                return None;
            }
        }
    }
}
