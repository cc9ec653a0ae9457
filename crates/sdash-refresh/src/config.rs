use crate::snapshot::Source;
use sdash_core::diff::DEFAULT_CHURN_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 1;
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 300;
pub const MIN_WAIT_TIME_DAYS: u32 = 1;
pub const MAX_WAIT_TIME_DAYS: u32 = 90;
pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 60;
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const MAX_RETRY_FACTOR: f64 = 10.0;

/// Per-source command timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceTimeouts {
    pub jobs: u64,
    pub history: u64,
    pub nodes: u64,
    pub all_jobs: u64,
    pub wait_time: u64,
    pub priority: u64,
}

impl Default for SourceTimeouts {
    fn default() -> Self {
        Self {
            jobs: 10,
            history: 20,
            nodes: 15,
            all_jobs: 15,
            wait_time: 30,
            priority: 15,
        }
    }
}

impl SourceTimeouts {
    fn slot(&mut self, source: Source) -> &mut u64 {
        match source {
            Source::Jobs => &mut self.jobs,
            Source::History => &mut self.history,
            Source::Nodes => &mut self.nodes,
            Source::AllJobs => &mut self.all_jobs,
            Source::WaitTime => &mut self.wait_time,
            Source::Priority => &mut self.priority,
        }
    }

    pub fn get(&self, source: Source) -> u64 {
        match source {
            Source::Jobs => self.jobs,
            Source::History => self.history,
            Source::Nodes => self.nodes,
            Source::AllJobs => self.all_jobs,
            Source::WaitTime => self.wait_time,
            Source::Priority => self.priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub refresh_interval_secs: u64,
    pub wait_time_days: u32,
    pub timeouts: SourceTimeouts,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_factor: f64,
    pub churn_threshold: f64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
            wait_time_days: 7,
            timeouts: SourceTimeouts::default(),
            max_retries: 3,
            retry_initial_delay_ms: 500,
            retry_factor: 1.5,
            churn_threshold: DEFAULT_CHURN_THRESHOLD,
        }
    }
}

impl RefreshConfig {
    /// Pulls every value into its accepted range and describes each change.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        clamp_into(
            &mut self.refresh_interval_secs,
            MIN_REFRESH_INTERVAL_SECS,
            MAX_REFRESH_INTERVAL_SECS,
            "refresh_interval_secs",
            &mut notes,
        );
        clamp_into(
            &mut self.wait_time_days,
            MIN_WAIT_TIME_DAYS,
            MAX_WAIT_TIME_DAYS,
            "wait_time_days",
            &mut notes,
        );
        for source in Source::ALL {
            let name = format!("timeouts.{}", source.as_str());
            clamp_into(
                self.timeouts.slot(source),
                MIN_TIMEOUT_SECS,
                MAX_TIMEOUT_SECS,
                &name,
                &mut notes,
            );
        }
        clamp_into(&mut self.max_retries, 0, 10, "max_retries", &mut notes);
        clamp_into(
            &mut self.retry_initial_delay_ms,
            1,
            MAX_RETRY_DELAY.as_millis() as u64,
            "retry_initial_delay_ms",
            &mut notes,
        );
        if !self.retry_factor.is_finite() || self.retry_factor < 1.0 {
            notes.push(format!("retry_factor {} reset to 1.5", self.retry_factor));
            self.retry_factor = 1.5;
        } else {
            clamp_into(
                &mut self.retry_factor,
                1.0,
                MAX_RETRY_FACTOR,
                "retry_factor",
                &mut notes,
            );
        }
        if !self.churn_threshold.is_finite() || !(0.0..=1.0).contains(&self.churn_threshold) {
            notes.push(format!(
                "churn_threshold {} reset to {DEFAULT_CHURN_THRESHOLD}",
                self.churn_threshold
            ));
            self.churn_threshold = DEFAULT_CHURN_THRESHOLD;
        }
        notes
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(MIN_REFRESH_INTERVAL_SECS))
    }

    pub fn timeout_for(&self, source: Source) -> Duration {
        Duration::from_secs(
            self.timeouts
                .get(source)
                .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        )
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }
}

fn clamp_into<T>(value: &mut T, min: T, max: T, name: &str, notes: &mut Vec<String>)
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let original = *value;
    let clamped = if original < min {
        min
    } else if original > max {
        max
    } else {
        original
    };
    if clamped != original {
        notes.push(format!("{name} {original} clamped to {clamped}"));
        *value = clamped;
    }
}

/// Next retry delay: `current * factor`, capped at ten seconds.
pub fn next_backoff(current: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * factor.max(1.0))
        .map_or(MAX_RETRY_DELAY, |next| next.min(MAX_RETRY_DELAY))
}
