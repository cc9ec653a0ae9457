//! Trackable resource (TRES) and generic resource (GRES) strings.

use crate::GpuBreakdown;
use regex::Regex;
use std::sync::OnceLock;

fn tres_gpu_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"gres/gpu(?::([^=,]+))?=(\d+)").expect("valid regex"))
}

fn gres_gpu_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"gpu(?::([^:(),]+))?:(\d+)(?:\([^)]+\))?").expect("valid regex")
    })
}

fn tres_cpu_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?:^|,)cpu=(\d+)").expect("valid regex"))
}

fn tres_mem_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|,)mem=(\d+(?:\.\d+)?)([KMGTP]?)").expect("valid regex")
    })
}

/// GPUs from a TRES string such as `cpu=8,mem=64G,gres/gpu=4,gres/gpu:h200=4`.
///
/// The generic `gres/gpu=N` entry repeats the typed ones, so it is only kept
/// when no typed entry exists.
pub fn parse_tres_gpus(tres: &str) -> GpuBreakdown {
    collect_gpus(tres_gpu_pattern(), tres)
}

/// GPUs from a node `Gres=` field such as `gpu:h200:8(S:0-1)` or `gpu:4`.
pub fn parse_gres_gpus(gres: &str) -> GpuBreakdown {
    if is_absent(gres) {
        return GpuBreakdown::new();
    }
    collect_gpus(gres_gpu_pattern(), gres)
}

fn collect_gpus(pattern: &Regex, input: &str) -> GpuBreakdown {
    let mut typed = GpuBreakdown::new();
    let mut generic: u32 = 0;
    for captures in pattern.captures_iter(input) {
        let count = captures
            .get(2)
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(0);
        match captures.get(1).map(|value| value.as_str().trim()) {
            Some(gpu_type) if !gpu_type.is_empty() => typed.add(gpu_type, count),
            _ => generic = generic.saturating_add(count),
        }
    }
    if typed.0.is_empty() && generic > 0 {
        typed.add("gpu", generic);
    }
    typed
}

pub fn parse_tres_cpus(tres: &str) -> u32 {
    tres_cpu_pattern()
        .captures(tres)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse().ok())
        .unwrap_or(0)
}

pub fn parse_tres_memory_gb(tres: &str) -> f64 {
    let Some(captures) = tres_mem_pattern().captures(tres) else {
        return 0.0;
    };
    let value: f64 = captures
        .get(1)
        .and_then(|value| value.as_str().parse().ok())
        .unwrap_or(0.0);
    let unit = captures.get(2).map(|value| value.as_str()).unwrap_or("");
    scale_to_gb(value, unit)
}

/// Memory strings like `4G`, `4000M`, `1T`, `512K`, `16Gn`, `2000Mc`. Bare
/// numbers are megabytes. Returns `None` for values that are not numbers.
pub fn parse_memory_gb(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if is_absent(trimmed) {
        return Some(0.0);
    }
    let trimmed = trimmed.trim_end_matches(['n', 'c']);
    let split = trimmed
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().ok()?;
    match unit {
        "" | "K" | "M" | "G" | "T" | "P" => Some(scale_to_gb(value, unit)),
        _ => None,
    }
}

fn scale_to_gb(value: f64, unit: &str) -> f64 {
    match unit {
        "K" => value / (1024.0 * 1024.0),
        "G" => value,
        "T" => value * 1024.0,
        "P" => value * 1024.0 * 1024.0,
        _ => value / 1024.0,
    }
}

/// Scheduler placeholders for "no value".
pub fn is_absent(value: &str) -> bool {
    matches!(
        value.trim(),
        "" | "N/A" | "(null)" | "None" | "Unknown" | "n/a" | "(N/A)"
    )
}
