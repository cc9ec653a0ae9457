//! Row-level reconciliation between two snapshots of one table.

use crate::wait_time::format_wait;
use crate::{
    AccountPriority, Job, JobPriority, NodeInfo, PartitionWaitStats, UserPendingStats,
    UserPriority, UserStats,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_CHURN_THRESHOLD: f64 = 0.6;

/// A table row with named cells in a fixed order and a declared key column.
/// Rows whose identity spans more than that column override `key`.
pub trait TableRow: Clone + PartialEq {
    const COLUMNS: &'static [&'static str];
    const KEY_COLUMN: usize;

    fn cells(&self) -> Vec<String>;

    fn key(&self) -> String {
        self.cells()
            .into_iter()
            .nth(Self::KEY_COLUMN)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    /// Too many rows came or went for itemized updates to be worth it.
    Churn,
    /// The consumer shows a sorted or filtered view and membership changed.
    ViewReordered,
}

impl RebuildReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildReason::Churn => "churn",
            RebuildReason::ViewReordered => "view_reordered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffPolicy {
    pub churn_threshold: f64,
    pub view_reordered: bool,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            churn_threshold: DEFAULT_CHURN_THRESHOLD,
            view_reordered: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDelta<R> {
    pub added: Vec<R>,
    pub removed: Vec<String>,
    pub updated: Vec<R>,
    pub unchanged: Vec<String>,
    pub rebuild: Option<RebuildReason>,
}

impl<R> Default for RowDelta<R> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
            rebuild: None,
        }
    }
}

impl<R: TableRow> RowDelta<R> {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    pub fn membership_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Applies the delta to rows already on screen: removed rows go, updated
    /// rows are replaced in place and added rows are appended. Surviving keys
    /// keep their relative order.
    pub fn apply_to(&self, rows: &mut Vec<R>) {
        if !self.removed.is_empty() {
            let removed: HashSet<&str> = self.removed.iter().map(String::as_str).collect();
            rows.retain(|row| !removed.contains(row.key().as_str()));
        }
        if !self.updated.is_empty() {
            let updated: HashMap<String, &R> =
                self.updated.iter().map(|row| (row.key(), row)).collect();
            for row in rows.iter_mut() {
                if let Some(next) = updated.get(&row.key()) {
                    *row = (*next).clone();
                }
            }
        }
        rows.extend(self.added.iter().cloned());
    }
}

/// Compares two snapshots keyed by `R::key`. A surviving key whose row is not
/// equal field for field lands in `updated`. Output follows the order of `new`
/// and later duplicates of a key are ignored.
pub fn diff<R: TableRow>(old: &[R], new: &[R], policy: &DiffPolicy) -> RowDelta<R> {
    let mut old_by_key: HashMap<String, &R> = HashMap::with_capacity(old.len());
    let mut old_order: Vec<String> = Vec::with_capacity(old.len());
    for row in old {
        let key = row.key();
        if !old_by_key.contains_key(&key) {
            old_by_key.insert(key.clone(), row);
            old_order.push(key);
        }
    }

    let mut seen: HashSet<String> = HashSet::with_capacity(new.len());
    let mut delta = RowDelta::default();
    for row in new {
        let key = row.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        match old_by_key.get(&key) {
            Some(previous) if *previous == row => delta.unchanged.push(key),
            Some(_) => delta.updated.push(row.clone()),
            None => delta.added.push(row.clone()),
        }
    }

    delta.removed = old_order
        .into_iter()
        .filter(|key| !seen.contains(key))
        .collect();

    let churn = (delta.added.len() + delta.removed.len()) as f64 / old_by_key.len().max(1) as f64;
    delta.rebuild = if churn > policy.churn_threshold {
        Some(RebuildReason::Churn)
    } else if policy.view_reordered && delta.membership_changed() {
        Some(RebuildReason::ViewReordered)
    } else {
        None
    };
    delta
}

fn gb(value: f64) -> String {
    format!("{value:.1}")
}

fn share(value: f64) -> String {
    format!("{value:.6}")
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

impl TableRow for Job {
    const COLUMNS: &'static [&'static str] = &[
        "JobID",
        "Name",
        "User",
        "Account",
        "Partition",
        "State",
        "Elapsed",
        "Nodes",
        "CPUs",
        "Mem(GB)",
        "GPUs",
        "NodeList",
    ];
    const KEY_COLUMN: usize = 0;

    fn cells(&self) -> Vec<String> {
        vec![
            self.job_id.clone(),
            self.name.clone(),
            self.user.clone(),
            self.account.clone(),
            self.partition.clone(),
            self.state.to_string(),
            self.elapsed.clone(),
            self.nodes.to_string(),
            self.effective_cpus().to_string(),
            gb(self.effective_memory_gb()),
            or_dash(&self.gpus.label()),
            self.node_list.clone(),
        ]
    }

    fn key(&self) -> String {
        self.job_id.clone()
    }
}

impl TableRow for NodeInfo {
    const COLUMNS: &'static [&'static str] = &[
        "Node",
        "State",
        "CPUs",
        "Load%",
        "Mem(GB)",
        "GPUs",
        "Partitions",
        "Reason",
    ];
    const KEY_COLUMN: usize = 0;

    fn cells(&self) -> Vec<String> {
        let gpus = if self.gpus_total.is_empty() {
            "-".to_string()
        } else {
            format!("{}/{}", self.gpus_alloc.total(), self.gpus_total.label())
        };
        vec![
            self.name.clone(),
            self.state.clone(),
            format!("{}/{}", self.cpus_alloc, self.cpus_total),
            format!("{:.0}", self.cpu_load_pct()),
            format!("{}/{}", gb(self.memory_alloc_gb), gb(self.memory_total_gb)),
            gpus,
            self.partitions.clone(),
            self.reason.clone(),
        ]
    }

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl TableRow for UserStats {
    const COLUMNS: &'static [&'static str] = &[
        "User", "Jobs", "CPUs", "Mem(GB)", "GPUs", "GPU Types", "Nodes", "NodeList",
    ];
    const KEY_COLUMN: usize = 0;

    fn cells(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.job_count.to_string(),
            self.total_cpus.to_string(),
            gb(self.total_memory_gb),
            self.total_gpus.to_string(),
            or_dash(&self.gpu_types.label()),
            self.total_nodes.to_string(),
            self.nodes.clone(),
        ]
    }

    fn key(&self) -> String {
        self.username.clone()
    }
}

impl TableRow for UserPendingStats {
    const COLUMNS: &'static [&'static str] =
        &["User", "Jobs", "CPUs", "Mem(GB)", "GPUs", "GPU Types"];
    const KEY_COLUMN: usize = 0;

    fn cells(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.job_count.to_string(),
            self.total_cpus.to_string(),
            gb(self.total_memory_gb),
            self.total_gpus.to_string(),
            or_dash(&self.gpu_types.label()),
        ]
    }

    fn key(&self) -> String {
        self.username.clone()
    }
}

impl TableRow for UserPriority {
    const COLUMNS: &'static [&'static str] = &[
        "Rank",
        "User",
        "Account",
        "RawShares",
        "NormShares",
        "RawUsage",
        "EffectvUsage",
        "FairShare",
    ];
    const KEY_COLUMN: usize = 1;

    fn cells(&self) -> Vec<String> {
        vec![
            self.rank.clone(),
            self.username.clone(),
            self.account.clone(),
            or_dash(&self.raw_shares),
            share(self.norm_shares),
            format!("{:.0}", self.raw_usage),
            share(self.effective_usage),
            share(self.fair_share),
        ]
    }

    /// `sshare -a` lists a user once per account.
    fn key(&self) -> String {
        format!("{}/{}", self.account, self.username)
    }
}

impl TableRow for AccountPriority {
    const COLUMNS: &'static [&'static str] = &[
        "Rank",
        "Account",
        "Users",
        "RawShares",
        "NormShares",
        "RawUsage",
        "EffectvUsage",
        "FairShare",
    ];
    const KEY_COLUMN: usize = 1;

    fn cells(&self) -> Vec<String> {
        vec![
            self.rank.clone(),
            self.account.clone(),
            self.user_count.to_string(),
            or_dash(&self.raw_shares),
            share(self.norm_shares),
            format!("{:.0}", self.raw_usage),
            share(self.effective_usage),
            share(self.fair_share),
        ]
    }

    fn key(&self) -> String {
        self.account.clone()
    }
}

impl TableRow for JobPriority {
    const COLUMNS: &'static [&'static str] = &[
        "Rank",
        "JobID",
        "User",
        "Account",
        "Partition",
        "Priority",
        "Age",
        "FairShare",
        "JobSize",
        "QOS",
    ];
    const KEY_COLUMN: usize = 1;

    fn cells(&self) -> Vec<String> {
        vec![
            self.rank.clone(),
            self.job_id.clone(),
            self.user.clone(),
            self.account.clone(),
            self.partition.clone(),
            format!("{:.0}", self.priority),
            format!("{:.0}", self.age),
            format!("{:.0}", self.fair_share),
            format!("{:.0}", self.job_size),
            format!("{:.0}", self.qos),
        ]
    }

    fn key(&self) -> String {
        self.job_id.clone()
    }
}

impl TableRow for PartitionWaitStats {
    const COLUMNS: &'static [&'static str] =
        &["Partition", "Jobs", "Mean", "Median", "Min", "Max"];
    const KEY_COLUMN: usize = 0;

    fn cells(&self) -> Vec<String> {
        vec![
            self.partition.clone(),
            self.count.to_string(),
            format_wait(self.mean_secs),
            format_wait(self.median_secs),
            format_wait(self.min_secs),
            format_wait(self.max_secs),
        ]
    }

    fn key(&self) -> String {
        self.partition.clone()
    }
}
