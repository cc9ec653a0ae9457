use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

pub mod aggregate;
pub mod array;
pub mod diff;
pub mod energy;
pub mod jobs;
pub mod layout;
pub mod nodes;
pub mod parse;
pub mod priority;
pub mod rank;
pub mod tres;
pub mod validation;
pub mod wait_time;

pub use diff::{diff, DiffPolicy, RebuildReason, RowDelta, TableRow};
pub use layout::{Column, ColumnLayout};
pub use parse::{KeyValueRecord, ParseReport};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Requeued,
    NodeFail,
    OutOfMemory,
    Preempted,
    Suspended,
    Other(String),
}

impl Default for JobState {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::Cancelled => "CANCELLED",
            JobState::Requeued => "REQUEUED",
            JobState::NodeFail => "NODE_FAIL",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::Preempted => "PREEMPTED",
            JobState::Suspended => "SUSPENDED",
            JobState::Other(raw) => raw.as_str(),
        }
    }

    pub fn category(&self) -> JobCategory {
        match self {
            JobState::Running | JobState::Completing => JobCategory::Running,
            JobState::Pending | JobState::Requeued => JobCategory::Pending,
            JobState::Completed => JobCategory::Completed,
            JobState::Failed | JobState::NodeFail | JobState::OutOfMemory => JobCategory::Failed,
            JobState::Cancelled => JobCategory::Cancelled,
            JobState::Timeout => JobCategory::Timeout,
            JobState::Preempted | JobState::Suspended | JobState::Other(_) => JobCategory::Other,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.category(),
            JobCategory::Running | JobCategory::Pending
        ) || matches!(self, JobState::Suspended)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Infallible;

    // Accepts long names, squeue short codes and sacct decorations such as
    // "CANCELLED by 1234" or "COMPLETED+".
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let word = input
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_ascii_uppercase();
        let state = match word.as_str() {
            "PENDING" | "PD" => JobState::Pending,
            "RUNNING" | "R" => JobState::Running,
            "COMPLETING" | "CG" => JobState::Completing,
            "COMPLETED" | "CD" => JobState::Completed,
            "FAILED" | "F" => JobState::Failed,
            "TIMEOUT" | "TO" => JobState::Timeout,
            "CANCELLED" | "CANCELED" | "CA" => JobState::Cancelled,
            "REQUEUED" | "RQ" => JobState::Requeued,
            "NODE_FAIL" | "NF" => JobState::NodeFail,
            "OUT_OF_MEMORY" | "OOM" => JobState::OutOfMemory,
            "PREEMPTED" | "PR" => JobState::Preempted,
            "SUSPENDED" | "S" => JobState::Suspended,
            _ => JobState::Other(word),
        };
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobCategory {
    Running,
    Pending,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Other,
}

impl JobCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Running => "running",
            JobCategory::Pending => "pending",
            JobCategory::Completed => "completed",
            JobCategory::Failed => "failed",
            JobCategory::Cancelled => "cancelled",
            JobCategory::Timeout => "timeout",
            JobCategory::Other => "other",
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPU counts keyed by lowercase type name; generic GPUs use the key `gpu`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct GpuBreakdown(pub BTreeMap<String, u32>);

impl GpuBreakdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, gpu_type: &str, count: u32) {
        *self.0.entry(gpu_type.to_ascii_lowercase()).or_insert(0) += count;
    }

    pub fn merge(&mut self, other: &GpuBreakdown) {
        for (gpu_type, count) in &other.0 {
            self.add(gpu_type, *count);
        }
    }

    pub fn scaled(&self, factor: u32) -> GpuBreakdown {
        GpuBreakdown(
            self.0
                .iter()
                .map(|(gpu_type, count)| (gpu_type.clone(), count.saturating_mul(factor)))
                .collect(),
        )
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn get(&self, gpu_type: &str) -> u32 {
        self.0.get(gpu_type).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.0.iter()
    }

    /// Display form such as `2x A100, 8x H200`, ordered by type.
    pub fn label(&self) -> String {
        self.0
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(gpu_type, count)| format!("{count}x {}", gpu_type.to_ascii_uppercase()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub user: String,
    pub account: String,
    pub partition: String,
    pub state: JobState,
    pub elapsed: String,
    pub nodes: u32,
    pub req_cpus: u32,
    pub alloc_cpus: u32,
    pub req_memory_gb: f64,
    pub alloc_memory_gb: f64,
    pub gpus: GpuBreakdown,
    pub node_list: String,
    pub submit_time: Option<NaiveDateTime>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub requeues: u32,
    pub exit_code: String,
}

impl Job {
    pub fn effective_cpus(&self) -> u32 {
        if self.alloc_cpus > 0 {
            self.alloc_cpus
        } else {
            self.req_cpus
        }
    }

    pub fn effective_memory_gb(&self) -> f64 {
        if self.alloc_memory_gb > 0.0 {
            self.alloc_memory_gb
        } else {
            self.req_memory_gb
        }
    }

    /// Number of array elements this row stands for (1 for plain jobs).
    pub fn array_size(&self) -> u32 {
        array::array_size(&self.job_id)
    }

    /// Numeric part before any array suffix, used for ordering history.
    pub fn base_id(&self) -> u64 {
        let digits: String = self
            .job_id
            .chars()
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        digits.parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub state: String,
    pub reason: String,
    pub partitions: String,
    pub cpus_total: u32,
    pub cpus_alloc: u32,
    pub memory_total_gb: f64,
    pub memory_alloc_gb: f64,
    pub gpus_total: GpuBreakdown,
    pub gpus_alloc: GpuBreakdown,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn is_draining(&self) -> bool {
        self.state.to_ascii_uppercase().contains("DRAIN")
    }

    pub fn cpu_load_pct(&self) -> f64 {
        if self.cpus_total == 0 {
            return 0.0;
        }
        f64::from(self.cpus_alloc) / f64::from(self.cpus_total) * 100.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserStats {
    pub username: String,
    pub job_count: u32,
    pub total_cpus: u32,
    pub total_memory_gb: f64,
    pub total_gpus: u32,
    pub gpu_types: GpuBreakdown,
    /// Sum of per-job node counts.
    pub total_nodes: u32,
    /// Distinct raw node-list strings.
    pub node_count: u32,
    pub nodes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserPendingStats {
    pub username: String,
    pub job_count: u32,
    pub total_cpus: u32,
    pub total_memory_gb: f64,
    pub total_gpus: u32,
    pub gpu_types: GpuBreakdown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserPriority {
    pub username: String,
    pub account: String,
    /// Kept verbatim: sshare prints `parent` for inherited shares.
    pub raw_shares: String,
    pub norm_shares: f64,
    pub raw_usage: f64,
    pub norm_usage: f64,
    pub effective_usage: f64,
    pub fair_share: f64,
    pub rank: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountPriority {
    pub account: String,
    pub raw_shares: String,
    pub norm_shares: f64,
    pub raw_usage: f64,
    pub norm_usage: f64,
    pub effective_usage: f64,
    pub fair_share: f64,
    pub user_count: u32,
    pub rank: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobPriority {
    pub job_id: String,
    pub user: String,
    pub account: String,
    pub partition: String,
    pub priority: f64,
    pub age: f64,
    pub fair_share: f64,
    pub job_size: f64,
    pub qos: f64,
    pub rank: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterStats {
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub allocated_nodes: u32,
    pub down_nodes: u32,
    pub draining_nodes: u32,
    pub total_cpus: u32,
    pub allocated_cpus: u32,
    pub total_memory_gb: f64,
    pub allocated_memory_gb: f64,
    pub total_gpus: u32,
    pub allocated_gpus: u32,
    /// type -> (total, allocated)
    pub gpus_by_type: BTreeMap<String, (u32, u32)>,
    pub running_jobs: u32,
    pub pending_jobs: u32,
}

impl ClusterStats {
    pub fn free_nodes_pct(&self) -> f64 {
        pct(f64::from(self.free_nodes), f64::from(self.total_nodes))
    }

    pub fn free_cpus_pct(&self) -> f64 {
        pct(
            f64::from(self.total_cpus) - f64::from(self.allocated_cpus),
            f64::from(self.total_cpus),
        )
    }

    pub fn free_memory_pct(&self) -> f64 {
        pct(
            self.total_memory_gb - self.allocated_memory_gb,
            self.total_memory_gb,
        )
    }

    pub fn free_gpus_pct(&self) -> f64 {
        pct(
            f64::from(self.total_gpus) - f64::from(self.allocated_gpus),
            f64::from(self.total_gpus),
        )
    }
}

// Allocations on draining nodes can push the numerator past the total.
fn pct(part: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (part / total * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionWaitStats {
    pub partition: String,
    pub count: u32,
    pub mean_secs: f64,
    pub median_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobHistory {
    pub jobs: Vec<Job>,
    pub total_jobs: u32,
    pub total_requeues: u32,
    pub max_requeues: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PriorityTables {
    pub users: Vec<UserPriority>,
    pub accounts: Vec<AccountPriority>,
    pub jobs: Vec<JobPriority>,
}
