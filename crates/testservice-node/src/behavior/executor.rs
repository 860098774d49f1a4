//! Behavior execution with a strict, observable phase order:
//!
//! latency, disk fill, crash-if-file, error-if-file, panic, error
//! injection, then CPU/memory pressure. File gates run before the
//! probabilistic failures so configuration-driven terminal conditions stay
//! deterministic, and disk fill runs before panic so callers can observe
//! the 507 instead of a process termination.

use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::pressure;
use super::value::{format_bytes, format_duration};
use super::{Behavior, DiskSpec, LatencySpec};

/// Per-execution inputs the phases need: the request-scoped cancellation
/// token and the trace identifier (used in fill-file names).
pub struct ExecutionContext<'a> {
    pub cancel: &'a CancellationToken,
    pub trace_id: &'a str,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed to upstream dispatch.
    Continue,
    /// Build a response from `code`/`body` and skip upstreams entirely.
    EarlyExit {
        code: u16,
        body: String,
        behavior: String,
    },
}

fn early_exit(code: u16, body: impl Into<String>, behavior: &str) -> Outcome {
    Outcome::EarlyExit {
        code,
        body: body.into(),
        behavior: behavior.to_string(),
    }
}

/// Run the resolved behavior. Labels for every phase that actually applied
/// are appended to `applied` in execution order.
pub async fn execute(
    behavior: &Behavior,
    ctx: &ExecutionContext<'_>,
    applied: &mut Vec<String>,
) -> Outcome {
    // Phase 1: latency.
    if let Some(latency) = behavior.latency {
        let (delay, label) = match latency {
            LatencySpec::Fixed(d) => (d, format!("latency:fixed:{}", format_duration(d))),
            LatencySpec::Range { min, max } => {
                let nanos = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(min.as_nanos() as u64..=max.as_nanos() as u64)
                };
                (
                    Duration::from_nanos(nanos),
                    format!(
                        "latency:range:{}-{}",
                        format_duration(min),
                        format_duration(max)
                    ),
                )
            }
        };
        applied.push(label);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancel.cancelled() => {
                return early_exit(499, "request cancelled", "cancelled");
            }
        }
    }

    // Phase 2: disk fill. Creation is synchronous so failure surfaces as a
    // 507; the hold-then-delete phase runs in the background.
    if let Some(disk) = &behavior.disk {
        match create_fill_file(disk, ctx.trace_id).await {
            Ok(path) => {
                applied.push(format!(
                    "disk:fill:{}:{}",
                    format_bytes(disk.size),
                    disk.dir
                ));
                spawn_fill_cleanup(path, disk.hold, ctx.cancel.clone());
            }
            Err(e) => {
                warn!(dir = %disk.dir, size = disk.size, error = %e, "disk fill failed");
                return early_exit(507, format!("Disk fill failed: {e}"), "disk-fill-failed");
            }
        }
    }

    // Phase 3: crash-if-file. Read errors are logged and never terminate.
    if let Some(gate) = &behavior.crash_if_file {
        match tokio::fs::read_to_string(&gate.path).await {
            Ok(content) => {
                if let Some(matched) = gate.substrings.iter().find(|s| content.contains(s.as_str()))
                {
                    error!(
                        file = %gate.path,
                        substring = %matched,
                        "crash gate matched, terminating process"
                    );
                    std::process::exit(1);
                }
            }
            Err(e) => warn!(file = %gate.path, error = %e, "crash gate file unreadable"),
        }
    }

    // Phase 4: error-if-file.
    if let Some(gate) = &behavior.error_if_file {
        match tokio::fs::read_to_string(&gate.path).await {
            Ok(content) => {
                if let Some(matched) = gate.substrings.iter().find(|s| content.contains(s.as_str()))
                {
                    applied.push("error-if-file".to_string());
                    return early_exit(
                        gate.code,
                        format!("File {} contains invalid content {:?}", gate.path, matched),
                        "error-if-file",
                    );
                }
            }
            Err(e) => warn!(file = %gate.path, error = %e, "error gate file unreadable"),
        }
    }

    // Phase 5: panic.
    if let Some(probability) = behavior.panic {
        let fired = rand::thread_rng().gen::<f64>() < probability;
        if fired {
            error!(probability, "panic behavior triggered, aborting process");
            std::process::abort();
        }
    }

    // Phase 6: error injection.
    if let Some(spec) = behavior.error {
        let fired = rand::thread_rng().gen::<f64>() < spec.probability;
        if fired {
            applied.push(format!("error:{}:{:.2}", spec.code, spec.probability));
            return early_exit(spec.code, format!("Injected error: {}", spec.code), "error");
        }
    }

    // Phase 7: CPU and memory pressure, fire and forget.
    if let Some(cpu) = behavior.cpu {
        applied.push(format!(
            "cpu:{}:{}:{}",
            cpu.pattern.as_str(),
            format_duration(cpu.duration),
            cpu.intensity
        ));
        pressure::spawn_cpu_load(cpu, ctx.cancel.clone());
    }
    if let Some(memory) = behavior.memory {
        let mut label = format!("memory:{}", memory.pattern.as_str());
        if let Some(amount) = memory.amount {
            label.push_str(&format!(":{amount}"));
        }
        applied.push(label);
        pressure::spawn_memory_load(memory, ctx.cancel.clone());
    }

    Outcome::Continue
}

/// Create a sparse file of the requested size via seek-and-write. The name
/// embeds the trace id suffix plus random hex so concurrent requests never
/// collide.
async fn create_fill_file(spec: &DiskSpec, trace_id: &str) -> io::Result<PathBuf> {
    let suffix = &trace_id[trace_id.len().saturating_sub(8)..];
    let rand_hex = format!("{:08x}", rand::thread_rng().gen::<u32>());
    let path = Path::new(&spec.dir).join(format!(".testservice-fill-{suffix}-{rand_hex}.dat"));
    let size = spec.size;
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::create(&path)?;
        if size > 0 {
            file.seek(SeekFrom::Start(size - 1))?;
            file.write_all(&[0])?;
        }
        file.sync_all()?;
        Ok(path)
    })
    .await
    .map_err(|e| io::Error::other(e))?
}

/// Delete the fill file after the hold duration, or as soon as the request
/// is cancelled.
fn spawn_fill_cleanup(path: PathBuf, hold: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(hold) => {}
            _ = cancel.cancelled() => {}
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed fill file"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove fill file"),
        }
    });
}
