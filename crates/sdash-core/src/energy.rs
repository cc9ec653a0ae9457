//! Energy estimates for finished jobs, assuming every allocated CPU core and
//! GPU ran at its rated power for the whole elapsed time.

use crate::Job;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_GPU_TDP_W: u32 = 300;
pub const DEFAULT_CPU_TDP_PER_CORE_W: u32 = 10;

const VENDOR_PREFIXES: [&str; 6] = ["nvidia_", "nvidia-", "amd_", "amd-", "intel_", "intel-"];

/// Rated power per device, keyed by lowercase GPU model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerModel {
    pub gpu_tdp_w: BTreeMap<String, u32>,
    pub default_gpu_tdp_w: u32,
    pub cpu_tdp_per_core_w: u32,
}

impl Default for PowerModel {
    fn default() -> Self {
        let gpu_tdp_w = [
            ("h200", 700),
            ("h100", 700),
            ("gh200", 900),
            ("a100", 400),
            ("a40", 300),
            ("a30", 165),
            ("a10", 150),
            ("l40s", 350),
            ("l40", 300),
            ("l4", 72),
            ("v100", 300),
            ("p100", 250),
            ("t4", 70),
            ("mi300x", 750),
            ("mi250x", 560),
            ("mi250", 500),
            ("mi100", 300),
        ]
        .into_iter()
        .map(|(model, watts)| (model.to_string(), watts))
        .collect();
        Self {
            gpu_tdp_w,
            default_gpu_tdp_w: DEFAULT_GPU_TDP_W,
            cpu_tdp_per_core_w: DEFAULT_CPU_TDP_PER_CORE_W,
        }
    }
}

impl PowerModel {
    /// Watts for one GPU of `gpu_type`.
    ///
    /// Lookup is case-insensitive, ignores a vendor prefix, and otherwise
    /// takes the longest known model contained in the name, so `a100_80gb`
    /// resolves to `a100` rather than `a10`.
    pub fn gpu_tdp(&self, gpu_type: &str) -> u32 {
        let normalized = gpu_type.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return self.default_gpu_tdp_w;
        }
        if let Some(watts) = self.lookup(&normalized) {
            return watts;
        }
        if let Some(watts) = VENDOR_PREFIXES
            .iter()
            .find_map(|prefix| normalized.strip_prefix(prefix))
            .and_then(|stripped| self.lookup(stripped))
        {
            return watts;
        }
        self.gpu_tdp_w
            .iter()
            .filter(|(model, _)| normalized.contains(model.to_ascii_lowercase().as_str()))
            .max_by_key(|(model, _)| model.len())
            .map_or(self.default_gpu_tdp_w, |(_, watts)| *watts)
    }

    fn lookup(&self, normalized: &str) -> Option<u32> {
        self.gpu_tdp_w
            .iter()
            .find(|(model, _)| model.eq_ignore_ascii_case(normalized))
            .map(|(_, watts)| *watts)
    }

    /// Watt-hours for one job's allocation over `duration_secs`.
    pub fn job_energy_wh(&self, job: &Job, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }
        let hours = duration_secs / 3600.0;
        let gpu_watts: f64 = job
            .gpus
            .iter()
            .map(|(gpu_type, count)| f64::from(*count) * f64::from(self.gpu_tdp(gpu_type)))
            .sum();
        let cpu_watts = f64::from(job.effective_cpus()) * f64::from(self.cpu_tdp_per_core_w);
        (gpu_watts + cpu_watts) * hours
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserEnergyStats {
    pub username: String,
    pub total_energy_wh: f64,
    pub job_count: u32,
    pub gpu_hours: f64,
    pub cpu_hours: f64,
}

/// Slurm elapsed time (`D-HH:MM:SS`, `HH:MM:SS`, `MM:SS` or `SS`) in
/// seconds, zero when unparseable.
pub fn parse_elapsed_secs(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }
    let (days, clock) = match raw.split_once('-') {
        Some((days, clock)) => match days.parse::<u32>() {
            Ok(days) => (days, clock),
            Err(_) => return 0.0,
        },
        None => (0, raw),
    };
    let parts: Vec<&str> = clock.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u32>(), m.parse::<u32>(), s.parse::<f64>()),
        [m, s] => (Ok(0), m.parse::<u32>(), s.parse::<f64>()),
        [s] => (Ok(0), Ok(0), s.parse::<f64>()),
        _ => return 0.0,
    };
    match (hours, minutes, seconds) {
        (Ok(h), Ok(m), Ok(s)) => {
            let total = f64::from(days) * 86_400.0
                + f64::from(h) * 3600.0
                + f64::from(m) * 60.0
                + s;
            total.max(0.0)
        }
        _ => 0.0,
    }
}

/// Per-user energy totals over `jobs`, largest consumer first.
///
/// Jobs without a user or with no elapsed time are skipped.
pub fn aggregate_energy(jobs: &[Job], model: &PowerModel) -> Vec<UserEnergyStats> {
    let mut by_user: BTreeMap<&str, UserEnergyStats> = BTreeMap::new();
    for job in jobs {
        let username = job.user.trim();
        if username.is_empty() {
            continue;
        }
        let duration_secs = parse_elapsed_secs(&job.elapsed);
        if duration_secs <= 0.0 {
            continue;
        }
        let hours = duration_secs / 3600.0;
        let stats = by_user
            .entry(username)
            .or_insert_with(|| UserEnergyStats {
                username: username.to_string(),
                ..UserEnergyStats::default()
            });
        stats.total_energy_wh += model.job_energy_wh(job, duration_secs);
        stats.job_count += 1;
        stats.gpu_hours += f64::from(job.gpus.total()) * hours;
        stats.cpu_hours += f64::from(job.effective_cpus()) * hours;
    }

    let mut stats: Vec<UserEnergyStats> = by_user.into_values().collect();
    stats.sort_by(|a, b| {
        b.total_energy_wh
            .total_cmp(&a.total_energy_wh)
            .then_with(|| a.username.cmp(&b.username))
    });
    stats
}

/// Energy with an auto-scaled unit, e.g. `456 Wh`, `12.3 kWh`, `1.23 MWh`.
pub fn format_energy(wh: f64) -> String {
    if wh.is_nan() || wh < 0.0 {
        return "0 Wh".to_string();
    }
    if wh >= 1e9 {
        format!("{:.2} GWh", wh / 1e9)
    } else if wh >= 1e6 {
        format!("{:.2} MWh", wh / 1e6)
    } else if wh >= 1e3 {
        format!("{:.1} kWh", wh / 1e3)
    } else if wh >= 1.0 {
        format!("{wh:.0} Wh")
    } else {
        format!("{wh:.2} Wh")
    }
}
