//! Directive registry: a process-wide map from directive key to parser.
//!
//! Built-in directives register themselves when the registry is first
//! touched; the map is read-only afterwards. Unknown keys fail parsing.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::BehaviorError;

use super::value::{
    duration_from_parts, parse_bytes, parse_duration, parse_probability, split_number_unit,
};
use super::{
    Behavior, CpuPattern, CpuSpec, CrashFileSpec, DiskSpec, ErrorFileSpec, ErrorSpec,
    LatencySpec, MemoryAmount, MemoryPattern, MemorySpec, DEFAULT_DISK_HOLD, DEFAULT_ERROR_CODE,
    DEFAULT_ERROR_IF_FILE_CODE,
};

/// Parses one directive value into its field on the behavior.
pub type DirectiveParser = fn(&mut Behavior, &str) -> Result<(), BehaviorError>;

pub struct Registry {
    parsers: HashMap<&'static str, DirectiveParser>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            parsers: HashMap::new(),
        }
    }

    /// Register a directive. Last registration for a key wins, which lets a
    /// deployment-specific build shadow a built-in.
    pub fn register(&mut self, key: &'static str, parser: DirectiveParser) {
        self.parsers.insert(key, parser);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.parsers.contains_key(key)
    }

    pub fn apply(
        &self,
        behavior: &mut Behavior,
        key: &str,
        value: &str,
    ) -> Result<(), BehaviorError> {
        match self.parsers.get(key) {
            Some(parser) => parser(behavior, value),
            None => Err(BehaviorError::UnknownDirective(key.to_string())),
        }
    }

    fn with_builtins() -> Self {
        let mut r = Registry::new();
        r.register("latency", parse_latency);
        r.register("error", parse_error);
        r.register("panic", parse_panic);
        r.register("crash-if-file", parse_crash_if_file);
        r.register("error-if-file", parse_error_if_file);
        r.register("cpu", parse_cpu);
        r.register("memory", parse_memory);
        r.register("disk", parse_disk);
        r.register("upstreamWeights", parse_upstream_weights);
        r
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_builtins()
    }
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::with_builtins);

pub fn global_registry() -> &'static Registry {
    &REGISTRY
}

/// `latency=<dur>` or `latency=<dur>-<dur>`. The left bound may omit its
/// unit when the right bound carries one: `50-200ms` reads as `50ms-200ms`.
fn parse_latency(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let spec = if let Some((left, right)) = value.split_once('-') {
        let (right_num, right_unit) = split_number_unit(right.trim());
        let (left_num, left_unit) = split_number_unit(left.trim());
        let left_unit = if left_unit.is_empty() {
            right_unit
        } else {
            left_unit
        };
        let min = duration_from_parts(left_num, left_unit)
            .map_err(|e| BehaviorError::invalid("latency", value, e))?;
        let max = duration_from_parts(right_num, right_unit)
            .map_err(|e| BehaviorError::invalid("latency", value, e))?;
        if min > max {
            return Err(BehaviorError::invalid(
                "latency",
                value,
                "range minimum exceeds maximum",
            ));
        }
        LatencySpec::Range { min, max }
    } else {
        LatencySpec::Fixed(
            parse_duration(value).map_err(|e| BehaviorError::invalid("latency", value, e))?,
        )
    };
    b.latency = Some(spec);
    Ok(())
}

fn parse_status_code(s: &str, key: &'static str, value: &str) -> Result<u16, BehaviorError> {
    let code: u16 = s
        .trim()
        .parse()
        .map_err(|_| BehaviorError::invalid(key, value, format!("invalid status code {s:?}")))?;
    if !(100..600).contains(&code) {
        return Err(BehaviorError::invalid(
            key,
            value,
            format!("status code {code} outside [100,600)"),
        ));
    }
    Ok(code)
}

/// `error=<prob>` | `error=<code>` | `error=<code>:<prob>`.
///
/// A bare value containing a dot is a probability (code defaults to 500);
/// otherwise it is a status code (probability defaults to 1.0). `error=1`
/// therefore means status 1 and fails code validation, while `error=1.0`
/// means always fail with 500 — the dot is the disambiguator.
fn parse_error(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let spec = if let Some((code, prob)) = value.split_once(':') {
        ErrorSpec {
            code: parse_status_code(code, "error", value)?,
            probability: parse_probability(prob)
                .map_err(|e| BehaviorError::invalid("error", value, e))?,
        }
    } else if value.contains('.') {
        ErrorSpec {
            code: DEFAULT_ERROR_CODE,
            probability: parse_probability(value)
                .map_err(|e| BehaviorError::invalid("error", value, e))?,
        }
    } else {
        ErrorSpec {
            code: parse_status_code(value, "error", value)?,
            probability: 1.0,
        }
    };
    b.error = Some(spec);
    Ok(())
}

fn parse_panic(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    b.panic =
        Some(parse_probability(value).map_err(|e| BehaviorError::invalid("panic", value, e))?);
    Ok(())
}

fn parse_substrings(segment: &str) -> Vec<String> {
    segment
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `crash-if-file=<path>:<substr>(;<substr>)*`.
fn parse_crash_if_file(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let (path, rest) = value.split_once(':').ok_or_else(|| {
        BehaviorError::invalid("crash-if-file", value, "expected <path>:<substring>")
    })?;
    let substrings = parse_substrings(rest);
    if path.trim().is_empty() || substrings.is_empty() {
        return Err(BehaviorError::invalid(
            "crash-if-file",
            value,
            "path and at least one substring are required",
        ));
    }
    b.crash_if_file = Some(CrashFileSpec {
        path: path.trim().to_string(),
        substrings,
    });
    Ok(())
}

/// `error-if-file=<path>:<substr>(;<substr>)*[:<code>]`. The trailing
/// segment is a status code only when it parses as an integer in
/// [100,600); anything else stays part of the substring list.
fn parse_error_if_file(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let mut parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 {
        return Err(BehaviorError::invalid(
            "error-if-file",
            value,
            "expected <path>:<substring>",
        ));
    }
    let mut code = DEFAULT_ERROR_IF_FILE_CODE;
    if parts.len() >= 3 {
        if let Ok(c) = parts[parts.len() - 1].trim().parse::<u16>() {
            if (100..600).contains(&c) {
                code = c;
                parts.pop();
            }
        }
    }
    let path = parts[0].trim();
    let substrings = parse_substrings(&parts[1..].join(":"));
    if path.is_empty() || substrings.is_empty() {
        return Err(BehaviorError::invalid(
            "error-if-file",
            value,
            "path and at least one substring are required",
        ));
    }
    b.error_if_file = Some(ErrorFileSpec {
        path: path.to_string(),
        substrings,
        code,
    });
    Ok(())
}

const DEFAULT_CPU_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_CPU_INTENSITY: u8 = 80;

/// `cpu=<pattern>[:<dur>[:<intensity>]]`, defaults `5s` and `80`.
fn parse_cpu(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let mut parts = value.split(':');
    let pattern = match parts.next().map(str::trim) {
        Some("spike") => CpuPattern::Spike,
        Some("steady") => CpuPattern::Steady,
        Some("ramp") => CpuPattern::Ramp,
        other => {
            return Err(BehaviorError::invalid(
                "cpu",
                value,
                format!("unknown pattern {:?}", other.unwrap_or("")),
            ))
        }
    };
    let duration = match parts.next() {
        Some(d) => parse_duration(d).map_err(|e| BehaviorError::invalid("cpu", value, e))?,
        None => DEFAULT_CPU_DURATION,
    };
    let intensity = match parts.next() {
        Some(i) => {
            let n: u8 = i.trim().parse().map_err(|_| {
                BehaviorError::invalid("cpu", value, format!("invalid intensity {i:?}"))
            })?;
            if !(1..=100).contains(&n) {
                return Err(BehaviorError::invalid(
                    "cpu",
                    value,
                    format!("intensity {n} outside [1,100]"),
                ));
            }
            n
        }
        None => DEFAULT_CPU_INTENSITY,
    };
    if parts.next().is_some() {
        return Err(BehaviorError::invalid("cpu", value, "too many fields"));
    }
    b.cpu = Some(CpuSpec {
        pattern,
        duration,
        intensity,
    });
    Ok(())
}

fn parse_memory_amount(s: &str, value: &str) -> Result<MemoryAmount, BehaviorError> {
    let s = s.trim();
    if let Some(pct) = s.strip_suffix('%') {
        let n: u8 = pct.parse().map_err(|_| {
            BehaviorError::invalid("memory", value, format!("invalid percent {s:?}"))
        })?;
        if !(1..=100).contains(&n) {
            return Err(BehaviorError::invalid(
                "memory",
                value,
                format!("percent {n} outside [1,100]"),
            ));
        }
        Ok(MemoryAmount::Percent(n))
    } else {
        Ok(MemoryAmount::Bytes(parse_bytes(s).map_err(|e| {
            BehaviorError::invalid("memory", value, e)
        })?))
    }
}

/// `memory=<pattern>[:<size>[:<dur>]]`. `spike` requires a size.
fn parse_memory(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let mut parts = value.split(':');
    let pattern = match parts.next().map(str::trim) {
        Some("leak-slow") => MemoryPattern::LeakSlow,
        Some("leak-fast") => MemoryPattern::LeakFast,
        Some("steady") => MemoryPattern::Steady,
        Some("spike") => MemoryPattern::Spike,
        other => {
            return Err(BehaviorError::invalid(
                "memory",
                value,
                format!("unknown pattern {:?}", other.unwrap_or("")),
            ))
        }
    };
    let amount = match parts.next() {
        Some(a) => Some(parse_memory_amount(a, value)?),
        None => None,
    };
    let duration = match parts.next() {
        Some(d) => {
            Some(parse_duration(d).map_err(|e| BehaviorError::invalid("memory", value, e))?)
        }
        None => None,
    };
    if parts.next().is_some() {
        return Err(BehaviorError::invalid("memory", value, "too many fields"));
    }
    if pattern == MemoryPattern::Spike && amount.is_none() {
        return Err(BehaviorError::invalid(
            "memory",
            value,
            "spike requires a size",
        ));
    }
    b.memory = Some(MemorySpec {
        pattern,
        amount,
        duration,
    });
    Ok(())
}

/// `disk=fill:<size>:<path>[:<dur>]`, default hold 10 minutes.
fn parse_disk(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 3 || parts[0].trim() != "fill" {
        return Err(BehaviorError::invalid(
            "disk",
            value,
            "expected fill:<size>:<path>[:<dur>]",
        ));
    }
    if parts.len() > 4 {
        return Err(BehaviorError::invalid("disk", value, "too many fields"));
    }
    let size =
        parse_bytes(parts[1]).map_err(|e| BehaviorError::invalid("disk", value, e))?;
    let dir = parts[2].trim();
    if dir.is_empty() {
        return Err(BehaviorError::invalid("disk", value, "empty target path"));
    }
    let hold = match parts.get(3) {
        Some(d) => parse_duration(d).map_err(|e| BehaviorError::invalid("disk", value, e))?,
        None => DEFAULT_DISK_HOLD,
    };
    b.disk = Some(DiskSpec {
        size,
        dir: dir.to_string(),
        hold,
    });
    Ok(())
}

/// `upstreamWeights=<id>:<int>(;<id>:<int>)*`.
fn parse_upstream_weights(b: &mut Behavior, value: &str) -> Result<(), BehaviorError> {
    let mut weights = BTreeMap::new();
    for pair in value.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, weight) = pair.split_once(':').ok_or_else(|| {
            BehaviorError::invalid("upstreamWeights", value, format!("expected <id>:<int> in {pair:?}"))
        })?;
        let w: u32 = weight.trim().parse().map_err(|_| {
            BehaviorError::invalid(
                "upstreamWeights",
                value,
                format!("invalid weight {weight:?}"),
            )
        })?;
        weights.insert(name.trim().to_string(), w);
    }
    if weights.is_empty() {
        return Err(BehaviorError::invalid(
            "upstreamWeights",
            value,
            "at least one <id>:<int> pair is required",
        ));
    }
    b.upstream_weights = Some(weights);
    Ok(())
}
