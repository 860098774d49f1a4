//! Scalar value grammars shared by the behavior directives: durations,
//! byte sizes and probabilities.

use std::time::Duration;

const NANOS_PER: &[(&str, u64)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60_000_000_000),
    ("h", 3_600_000_000_000),
];

/// Split a duration token into its numeric prefix and unit suffix.
/// `"200ms"` -> `("200", "ms")`, `"50"` -> `("50", "")`.
pub fn split_number_unit(s: &str) -> (&str, &str) {
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    s.split_at(idx)
}

fn unit_nanos(unit: &str) -> Option<u64> {
    NANOS_PER.iter().find(|(u, _)| *u == unit).map(|(_, n)| *n)
}

pub fn duration_from_parts(number: &str, unit: &str) -> Result<Duration, String> {
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid number {number:?}"))?;
    if value < 0.0 {
        return Err("duration must not be negative".to_string());
    }
    let nanos = unit_nanos(unit).ok_or_else(|| {
        if unit.is_empty() {
            "missing duration unit".to_string()
        } else {
            format!("unknown duration unit {unit:?}")
        }
    })?;
    Ok(Duration::from_nanos((value * nanos as f64).round() as u64))
}

/// Parse a single duration such as `100ms`, `1.5s` or `10m`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let (number, unit) = split_number_unit(s);
    duration_from_parts(number, unit)
}

/// Format a duration with the coarsest unit that loses no precision, so the
/// output parses back to the same value.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    for (unit, per) in [
        ("h", 3_600_000_000_000u128),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
    ] {
        if nanos % per == 0 {
            return format!("{}{}", nanos / per, unit);
        }
    }
    format!("{nanos}ns")
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Parse a byte size: `256Mi`, `1Gi`, `4096Ki` or a raw byte count.
pub fn parse_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (number, suffix) = split_number_unit(s);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid number {number:?}"))?;
    let mult = match suffix {
        "" => 1,
        "Ki" => KIB,
        "Mi" => MIB,
        "Gi" => GIB,
        other => return Err(format!("unknown size suffix {other:?}")),
    };
    value
        .checked_mul(mult)
        .ok_or_else(|| "size overflows u64".to_string())
}

/// Format a byte count using the largest binary suffix that divides it.
pub fn format_bytes(n: u64) -> String {
    if n > 0 && n % GIB == 0 {
        format!("{}Gi", n / GIB)
    } else if n > 0 && n % MIB == 0 {
        format!("{}Mi", n / MIB)
    } else if n > 0 && n % KIB == 0 {
        format!("{}Ki", n / KIB)
    } else {
        n.to_string()
    }
}

pub fn parse_probability(s: &str) -> Result<f64, String> {
    let p: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid probability {s:?}"))?;
    if !(0.0..=1.0).contains(&p) {
        return Err(format!("probability {p} outside [0,1]"));
    }
    Ok(p)
}

/// Format a probability so it always carries a decimal point. The parser
/// uses the dot to tell probabilities apart from status codes, so `1`
/// must come out as `1.0`.
pub fn format_probability(p: f64) -> String {
    let s = format!("{p}");
    if s.contains('.') {
        s
    } else {
        format!("{s}.0")
    }
}
