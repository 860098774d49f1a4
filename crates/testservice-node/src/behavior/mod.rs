//! The behavior engine: a declarative, composable DSL for per-service
//! fault and pressure injection.
//!
//! A behavior string such as `latency=100ms,order-api:error=503:0.5` parses
//! into a [`BehaviorChain`] of `(service, Behavior)` entries. Each service
//! along a call path resolves the chain against its own name with
//! [`BehaviorChain::for_service`] and executes the result, then propagates
//! the unmodified chain string to its upstreams.

mod executor;
mod parse;
pub mod pressure;
mod registry;
pub mod value;

pub use executor::{execute, ExecutionContext, Outcome};
pub use parse::parse_chain;
pub use registry::{global_registry, DirectiveParser, Registry};

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::BehaviorError;

use value::{format_bytes, format_duration, format_probability};

/// Artificial delay applied before any other work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LatencySpec {
    Fixed(Duration),
    /// Uniformly sampled from `[min, max]` per request.
    Range { min: Duration, max: Duration },
}

/// Probabilistic error injection. `probability` of 1.0 fails every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorSpec {
    pub code: u16,
    pub probability: f64,
}

pub const DEFAULT_ERROR_CODE: u16 = 500;
pub const DEFAULT_ERROR_IF_FILE_CODE: u16 = 401;

/// Terminate the process when the gate file contains any listed substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashFileSpec {
    pub path: String,
    pub substrings: Vec<String>,
}

/// Return a configured error code when the gate file contains any listed
/// substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFileSpec {
    pub path: String,
    pub substrings: Vec<String>,
    pub code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPattern {
    Spike,
    Steady,
    Ramp,
}

impl CpuPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuPattern::Spike => "spike",
            CpuPattern::Steady => "steady",
            CpuPattern::Ramp => "ramp",
        }
    }
}

/// Background CPU pressure. Never fails the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSpec {
    pub pattern: CpuPattern,
    pub duration: Duration,
    /// Busy share of each scheduling slot, percent in [1,100].
    pub intensity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPattern {
    LeakSlow,
    LeakFast,
    Steady,
    Spike,
}

impl MemoryPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPattern::LeakSlow => "leak-slow",
            MemoryPattern::LeakFast => "leak-fast",
            MemoryPattern::Steady => "steady",
            MemoryPattern::Spike => "spike",
        }
    }
}

/// Allocation target: absolute bytes or a share of the container limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAmount {
    Bytes(u64),
    /// Percent of the cgroup memory limit, in [1,100].
    Percent(u8),
}

impl fmt::Display for MemoryAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAmount::Bytes(n) => f.write_str(&format_bytes(*n)),
            MemoryAmount::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// Background memory pressure. Never fails the request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySpec {
    pub pattern: MemoryPattern,
    pub amount: Option<MemoryAmount>,
    pub duration: Option<Duration>,
}

/// Synchronous disk fill with a background hold-then-delete phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub size: u64,
    pub dir: String,
    pub hold: Duration,
}

pub const DEFAULT_DISK_HOLD: Duration = Duration::from_secs(600);

/// A record of optional directive values. Fields are independently
/// settable; merging a later behavior over an earlier one replaces fields
/// wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Behavior {
    pub latency: Option<LatencySpec>,
    pub error: Option<ErrorSpec>,
    pub panic: Option<f64>,
    pub crash_if_file: Option<CrashFileSpec>,
    pub error_if_file: Option<ErrorFileSpec>,
    pub cpu: Option<CpuSpec>,
    pub memory: Option<MemorySpec>,
    pub disk: Option<DiskSpec>,
    pub upstream_weights: Option<BTreeMap<String, u32>>,
}

impl Behavior {
    pub fn is_empty(&self) -> bool {
        self.latency.is_none()
            && self.error.is_none()
            && self.panic.is_none()
            && self.crash_if_file.is_none()
            && self.error_if_file.is_none()
            && self.cpu.is_none()
            && self.memory.is_none()
            && self.disk.is_none()
            && self.upstream_weights.is_none()
    }

    /// Overlay `other` on top of `self`: set fields of `other` win.
    pub fn merge_from(&mut self, other: &Behavior) {
        if let Some(v) = other.latency {
            self.latency = Some(v);
        }
        if let Some(v) = other.error {
            self.error = Some(v);
        }
        if let Some(v) = other.panic {
            self.panic = Some(v);
        }
        if let Some(v) = &other.crash_if_file {
            self.crash_if_file = Some(v.clone());
        }
        if let Some(v) = &other.error_if_file {
            self.error_if_file = Some(v.clone());
        }
        if let Some(v) = other.cpu {
            self.cpu = Some(v);
        }
        if let Some(v) = other.memory {
            self.memory = Some(v);
        }
        if let Some(v) = &other.disk {
            self.disk = Some(v.clone());
        }
        if let Some(v) = &other.upstream_weights {
            self.upstream_weights = Some(v.clone());
        }
    }

    /// Canonical `key=value` fragments in a fixed order. The output parses
    /// back to an identical behavior.
    pub fn directives(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(latency) = self.latency {
            let v = match latency {
                LatencySpec::Fixed(d) => format_duration(d),
                LatencySpec::Range { min, max } => {
                    format!("{}-{}", format_duration(min), format_duration(max))
                }
            };
            out.push(format!("latency={v}"));
        }
        if let Some(error) = self.error {
            let v = if error.probability == 1.0 {
                format!("{}", error.code)
            } else if error.code == DEFAULT_ERROR_CODE {
                format_probability(error.probability)
            } else {
                format!("{}:{}", error.code, format_probability(error.probability))
            };
            out.push(format!("error={v}"));
        }
        if let Some(p) = self.panic {
            out.push(format!("panic={}", format_probability(p)));
        }
        if let Some(crash) = &self.crash_if_file {
            out.push(format!(
                "crash-if-file={}:{}",
                crash.path,
                crash.substrings.join(";")
            ));
        }
        if let Some(gate) = &self.error_if_file {
            // The code is always emitted: a trailing substring that happens
            // to look like a status code would otherwise change meaning on
            // re-parse.
            out.push(format!(
                "error-if-file={}:{}:{}",
                gate.path,
                gate.substrings.join(";"),
                gate.code
            ));
        }
        if let Some(cpu) = self.cpu {
            out.push(format!(
                "cpu={}:{}:{}",
                cpu.pattern.as_str(),
                format_duration(cpu.duration),
                cpu.intensity
            ));
        }
        if let Some(memory) = self.memory {
            let mut v = memory.pattern.as_str().to_string();
            if let Some(amount) = memory.amount {
                v.push_str(&format!(":{amount}"));
                if let Some(d) = memory.duration {
                    v.push_str(&format!(":{}", format_duration(d)));
                }
            }
            out.push(format!("memory={v}"));
        }
        if let Some(disk) = &self.disk {
            out.push(format!(
                "disk=fill:{}:{}:{}",
                format_bytes(disk.size),
                disk.dir,
                format_duration(disk.hold)
            ));
        }
        if let Some(weights) = &self.upstream_weights {
            let v = weights
                .iter()
                .map(|(name, w)| format!("{name}:{w}"))
                .collect::<Vec<_>>()
                .join(";");
            out.push(format!("upstreamWeights={v}"));
        }
        out
    }
}

/// A behavior scoped to one service. An empty service name means global:
/// the entry applies to any service without a specific entry of its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceBehavior {
    pub service: String,
    pub behavior: Behavior,
}

impl ServiceBehavior {
    pub fn new(service: impl Into<String>) -> Self {
        ServiceBehavior {
            service: service.into(),
            behavior: Behavior::default(),
        }
    }
}

/// An ordered sequence of service-scoped behaviors parsed from one encoded
/// string and shared by every hop of a call path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BehaviorChain {
    entries: Vec<ServiceBehavior>,
}

impl BehaviorChain {
    pub fn parse(s: &str) -> Result<Self, BehaviorError> {
        parse::parse_chain(s)
    }

    pub fn from_entries(entries: Vec<ServiceBehavior>) -> Self {
        BehaviorChain { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ServiceBehavior] {
        &self.entries
    }

    /// Resolve the chain for one service.
    ///
    /// All entries naming the service merge in order into a specific
    /// accumulator; all global entries merge into a global accumulator. The
    /// specific result wins wholesale when any specific entry exists; fields
    /// never mix between the two buckets.
    pub fn for_service(&self, name: &str) -> Behavior {
        let mut specific: Option<Behavior> = None;
        let mut global: Option<Behavior> = None;
        for entry in &self.entries {
            // Entries with no directives carry no effect and must not
            // claim a bucket.
            if entry.behavior.is_empty() {
                continue;
            }
            if !name.is_empty() && entry.service == name {
                specific
                    .get_or_insert_with(Behavior::default)
                    .merge_from(&entry.behavior);
            } else if entry.service.is_empty() {
                global
                    .get_or_insert_with(Behavior::default)
                    .merge_from(&entry.behavior);
            }
        }
        specific.or(global).unwrap_or_default()
    }

    /// Canonical encoding. Buckets are merged (global first, then each
    /// service in first-appearance order) so the output is one item per
    /// scope; re-parsing resolves identically for every service name.
    fn canonical_entries(&self) -> Vec<ServiceBehavior> {
        let mut order: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !order.contains(&entry.service) {
                order.push(entry.service.clone());
            }
        }
        order.sort_by_key(|s| !s.is_empty());
        order
            .into_iter()
            .map(|service| {
                let mut merged = Behavior::default();
                for entry in &self.entries {
                    if entry.service == service {
                        merged.merge_from(&entry.behavior);
                    }
                }
                ServiceBehavior {
                    service,
                    behavior: merged,
                }
            })
            .filter(|e| !e.behavior.is_empty())
            .collect()
    }
}

impl fmt::Display for BehaviorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in self.canonical_entries() {
            for (i, directive) in entry.behavior.directives().into_iter().enumerate() {
                if !first {
                    f.write_str(",")?;
                }
                first = false;
                if i == 0 && !entry.service.is_empty() {
                    write!(f, "{}:", entry.service)?;
                }
                f.write_str(&directive)?;
            }
        }
        Ok(())
    }
}
