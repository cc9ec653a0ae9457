//! Queue wait statistics per partition from accounting records.

use crate::{Job, PartitionWaitStats};
use std::collections::BTreeMap;

/// Submit-to-start wait in seconds, `None` when either timestamp is missing
/// or the clock went backwards.
pub fn wait_seconds(job: &Job) -> Option<f64> {
    let submit = job.submit_time?;
    let start = job.start_time?;
    let secs = start.signed_duration_since(submit).num_seconds();
    if secs < 0 {
        return None;
    }
    Some(secs as f64)
}

pub fn partition_wait_stats(jobs: &[Job]) -> Vec<PartitionWaitStats> {
    let mut waits: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for job in jobs {
        let Some(wait) = wait_seconds(job) else {
            continue;
        };
        let partition = if job.partition.is_empty() {
            "(none)".to_string()
        } else {
            job.partition.clone()
        };
        waits.entry(partition).or_default().push(wait);
    }

    waits
        .into_iter()
        .map(|(partition, mut values)| {
            values.sort_by(|a, b| a.total_cmp(b));
            let count = values.len();
            let sum: f64 = values.iter().sum();
            let median = if count % 2 == 1 {
                values[count / 2]
            } else {
                (values[count / 2 - 1] + values[count / 2]) / 2.0
            };
            PartitionWaitStats {
                partition,
                count: count as u32,
                mean_secs: sum / count as f64,
                median_secs: median,
                min_secs: values[0],
                max_secs: values[count - 1],
            }
        })
        .collect()
}

/// Compact wait label: `45s`, `12m`, `2.5h`, `14h`, `1.2d`.
pub fn format_wait(secs: f64) -> String {
    if secs < 60.0 {
        format!("{}s", secs.max(0.0) as u64)
    } else if secs < 3600.0 {
        format!("{}m", (secs / 60.0) as u64)
    } else if secs < 86_400.0 {
        one_decimal_below_ten(secs / 3600.0, 'h')
    } else {
        one_decimal_below_ten(secs / 86_400.0, 'd')
    }
}

fn one_decimal_below_ten(value: f64, unit: char) -> String {
    if value < 10.0 {
        format!("{value:.1}{unit}")
    } else {
        format!("{}{unit}", value as u64)
    }
}
