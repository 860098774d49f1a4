//! Background CPU and memory pressure tasks.
//!
//! Pressure never fails the request that started it: the executor spawns
//! these and immediately continues. Every task is bounded by its own timer
//! and by the request-scoped cancellation token, so nothing outlives both.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CpuPattern, CpuSpec, MemoryAmount, MemoryPattern, MemorySpec};

const SLOT: Duration = Duration::from_millis(10);

const LEAK_CHUNK: usize = 1024 * 1024;
const SPIKE_CHUNK: usize = 10 * 1024 * 1024;
const PAGE: usize = 4096;

const DEFAULT_MEMORY_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_SPIKE_DURATION: Duration = Duration::from_secs(10);

/// Busy share of the current slot, percent. Ramp scales linearly from zero
/// to the target over the duration; spike and steady hold the target from
/// the start (spike differs only in intent and typical duration).
fn intensity_at(spec: &CpuSpec, elapsed: Duration) -> f64 {
    let target = f64::from(spec.intensity);
    match spec.pattern {
        CpuPattern::Spike | CpuPattern::Steady => target,
        CpuPattern::Ramp => {
            let frac = elapsed.as_secs_f64() / spec.duration.as_secs_f64().max(f64::EPSILON);
            target * frac.min(1.0)
        }
    }
}

/// Burn CPU on a dedicated blocking thread: out of every 10 ms slot, spin
/// for `intensity` percent and sleep the rest.
pub fn spawn_cpu_load(spec: CpuSpec, cancel: CancellationToken) {
    info!(
        pattern = spec.pattern.as_str(),
        duration_ms = spec.duration.as_millis() as u64,
        intensity = spec.intensity,
        "starting cpu pressure"
    );
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        while start.elapsed() < spec.duration {
            if cancel.is_cancelled() {
                debug!("cpu pressure cancelled");
                return;
            }
            let busy = SLOT.mul_f64(intensity_at(&spec, start.elapsed()) / 100.0);
            let slot_start = Instant::now();
            while slot_start.elapsed() < busy {
                std::hint::spin_loop();
            }
            if busy < SLOT {
                std::thread::sleep(SLOT - busy);
            }
        }
        debug!("cpu pressure finished");
    });
}

/// Resolve the allocation target in bytes. Percent amounts need a
/// discoverable container limit; without one the task logs and allocates
/// nothing.
fn resolve_target(amount: Option<MemoryAmount>) -> Option<u64> {
    match amount {
        Some(MemoryAmount::Bytes(n)) => Some(n),
        Some(MemoryAmount::Percent(p)) => match container_memory_limit() {
            Some(limit) => Some(limit / 100 * u64::from(p)),
            None => {
                warn!(
                    percent = p,
                    "no container memory limit discoverable, skipping allocation"
                );
                None
            }
        },
        None => None,
    }
}

/// cgroup v2 first, then v1. `max` (v2) and the kernel's no-limit sentinel
/// (v1) both mean unlimited.
fn container_memory_limit() -> Option<u64> {
    for path in [
        "/sys/fs/cgroup/memory.max",
        "/sys/fs/cgroup/memory/memory.limit_in_bytes",
    ] {
        if let Ok(raw) = std::fs::read_to_string(path) {
            let raw = raw.trim();
            if raw == "max" {
                return None;
            }
            if let Ok(n) = raw.parse::<u64>() {
                if n >= 1 << 60 {
                    return None;
                }
                return Some(n);
            }
        }
    }
    None
}

fn alloc_chunk(size: usize) -> Vec<u8> {
    let mut chunk = vec![0u8; size];
    // Touch every page so the kernel actually commits the memory.
    let mut i = 0;
    while i < chunk.len() {
        chunk[i] = 1;
        i += PAGE;
    }
    chunk
}

/// Allocate memory according to the pattern, hold it, then release it.
/// Leaks grow one chunk per tick until the target (or the deadline when no
/// target is set); steady and spike allocate up front and hold.
pub fn spawn_memory_load(spec: MemorySpec, cancel: CancellationToken) {
    info!(
        pattern = spec.pattern.as_str(),
        "starting memory pressure"
    );
    tokio::spawn(async move {
        let target = resolve_target(spec.amount);
        if spec.amount.is_some() && target.is_none() {
            return;
        }
        let duration = spec.duration.unwrap_or(match spec.pattern {
            MemoryPattern::Spike => DEFAULT_SPIKE_DURATION,
            _ => DEFAULT_MEMORY_DURATION,
        });
        let deadline = Instant::now() + duration;
        let mut held: Vec<Vec<u8>> = Vec::new();
        let mut held_bytes: u64 = 0;

        match spec.pattern {
            MemoryPattern::Steady | MemoryPattern::Spike => {
                if let Some(target) = target {
                    while held_bytes < target && !cancel.is_cancelled() {
                        let next = SPIKE_CHUNK.min((target - held_bytes) as usize);
                        held.push(alloc_chunk(next));
                        held_bytes += next as u64;
                        tokio::task::yield_now().await;
                    }
                }
            }
            MemoryPattern::LeakSlow | MemoryPattern::LeakFast => {
                let tick = if spec.pattern == MemoryPattern::LeakFast {
                    Duration::from_millis(100)
                } else {
                    Duration::from_secs(1)
                };
                loop {
                    if Instant::now() >= deadline || cancel.is_cancelled() {
                        break;
                    }
                    if let Some(target) = target {
                        if held_bytes >= target {
                            break;
                        }
                    }
                    held.push(alloc_chunk(LEAK_CHUNK));
                    held_bytes += LEAK_CHUNK as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        debug!(held_bytes, "memory pressure holding");
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = cancel.cancelled() => {}
        }
        drop(held);
        debug!("memory pressure released");
    });
}
