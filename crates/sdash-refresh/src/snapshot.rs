//! Per-source payloads and the deltas published alongside them.

use chrono::{DateTime, Utc};
use sdash_core::{
    diff, AccountPriority, ClusterStats, DiffPolicy, Job, JobHistory, JobPriority, NodeInfo,
    PartitionWaitStats, PriorityTables, RebuildReason, RowDelta, UserPendingStats, UserPriority,
    UserStats,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Jobs,
    History,
    Nodes,
    AllJobs,
    WaitTime,
    Priority,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Jobs,
        Source::History,
        Source::Nodes,
        Source::AllJobs,
        Source::WaitTime,
        Source::Priority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Jobs => "jobs",
            Source::History => "history",
            Source::Nodes => "nodes",
            Source::AllJobs => "all_jobs",
            Source::WaitTime => "wait_time",
            Source::Priority => "priority",
        }
    }

    /// Executables the source needs, in call order.
    pub fn programs(&self) -> &'static [&'static str] {
        match self {
            Source::Jobs | Source::AllJobs => &["squeue"],
            Source::History | Source::WaitTime => &["sacct"],
            Source::Nodes => &["scontrol"],
            Source::Priority => &["sshare", "sprio"],
        }
    }

    /// Sources whose data feeds [`ClusterAggregates`].
    pub fn feeds_aggregates(&self) -> bool {
        matches!(self, Source::Nodes | Source::AllJobs)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tables a consumer can show sorted or filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Jobs,
    History,
    Nodes,
    AllJobs,
    WaitTime,
    PriorityUsers,
    PriorityAccounts,
    PriorityJobs,
    Users,
    PendingUsers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "data", rename_all = "snake_case")]
pub enum Snapshot {
    Jobs(Vec<Job>),
    History(JobHistory),
    Nodes(Vec<NodeInfo>),
    AllJobs(Vec<Job>),
    WaitTime(Vec<PartitionWaitStats>),
    Priority(PriorityTables),
}

impl Snapshot {
    pub fn source(&self) -> Source {
        match self {
            Snapshot::Jobs(_) => Source::Jobs,
            Snapshot::History(_) => Source::History,
            Snapshot::Nodes(_) => Source::Nodes,
            Snapshot::AllJobs(_) => Source::AllJobs,
            Snapshot::WaitTime(_) => Source::WaitTime,
            Snapshot::Priority(_) => Source::Priority,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            Snapshot::Jobs(rows) | Snapshot::AllJobs(rows) => rows.len(),
            Snapshot::History(history) => history.jobs.len(),
            Snapshot::Nodes(rows) => rows.len(),
            Snapshot::WaitTime(rows) => rows.len(),
            Snapshot::Priority(tables) => {
                tables.users.len() + tables.accounts.len() + tables.jobs.len()
            }
        }
    }
}

/// A stored snapshot and when it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

impl CachedSnapshot {
    pub fn source(&self) -> Source {
        self.snapshot.source()
    }
}

/// Cross-source statistics recomputed whenever nodes or all-jobs land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAggregates {
    pub cluster: ClusterStats,
    pub users: Vec<UserStats>,
    pub pending_users: Vec<UserPendingStats>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SnapshotDelta {
    Jobs(RowDelta<Job>),
    History(RowDelta<Job>),
    Nodes(RowDelta<NodeInfo>),
    AllJobs(RowDelta<Job>),
    WaitTime(RowDelta<PartitionWaitStats>),
    Priority {
        users: RowDelta<UserPriority>,
        accounts: RowDelta<AccountPriority>,
        jobs: RowDelta<JobPriority>,
    },
}

impl SnapshotDelta {
    pub fn is_noop(&self) -> bool {
        match self {
            SnapshotDelta::Jobs(delta)
            | SnapshotDelta::History(delta)
            | SnapshotDelta::AllJobs(delta) => delta.is_noop(),
            SnapshotDelta::Nodes(delta) => delta.is_noop(),
            SnapshotDelta::WaitTime(delta) => delta.is_noop(),
            SnapshotDelta::Priority {
                users,
                accounts,
                jobs,
            } => users.is_noop() && accounts.is_noop() && jobs.is_noop(),
        }
    }

    /// First rebuild recommendation among the tables this delta covers.
    pub fn rebuild(&self) -> Option<RebuildReason> {
        match self {
            SnapshotDelta::Jobs(delta)
            | SnapshotDelta::History(delta)
            | SnapshotDelta::AllJobs(delta) => delta.rebuild,
            SnapshotDelta::Nodes(delta) => delta.rebuild,
            SnapshotDelta::WaitTime(delta) => delta.rebuild,
            SnapshotDelta::Priority {
                users,
                accounts,
                jobs,
            } => users.rebuild.or(accounts.rebuild).or(jobs.rebuild),
        }
    }
}

/// Diff settings for every table, given which ones the consumer reordered.
#[derive(Debug, Clone, Default)]
pub struct DiffContext {
    pub churn_threshold: f64,
    pub reordered: HashSet<Table>,
}

impl DiffContext {
    pub fn policy(&self, table: Table) -> DiffPolicy {
        DiffPolicy {
            churn_threshold: self.churn_threshold,
            view_reordered: self.reordered.contains(&table),
        }
    }
}

/// Diffs `new` against the previous snapshot of the same source. A missing
/// or mismatched previous snapshot diffs against empty tables.
pub fn diff_snapshots(
    previous: Option<&Snapshot>,
    new: &Snapshot,
    context: &DiffContext,
) -> SnapshotDelta {
    match new {
        Snapshot::Jobs(rows) => {
            let old: &[Job] = match previous {
                Some(Snapshot::Jobs(old)) => old.as_slice(),
                _ => &[],
            };
            SnapshotDelta::Jobs(diff(old, rows, &context.policy(Table::Jobs)))
        }
        Snapshot::AllJobs(rows) => {
            let old: &[Job] = match previous {
                Some(Snapshot::AllJobs(old)) => old.as_slice(),
                _ => &[],
            };
            SnapshotDelta::AllJobs(diff(old, rows, &context.policy(Table::AllJobs)))
        }
        Snapshot::History(history) => {
            let old: &[Job] = match previous {
                Some(Snapshot::History(old)) => old.jobs.as_slice(),
                _ => &[],
            };
            SnapshotDelta::History(diff(old, &history.jobs, &context.policy(Table::History)))
        }
        Snapshot::Nodes(rows) => {
            let old: &[NodeInfo] = match previous {
                Some(Snapshot::Nodes(old)) => old.as_slice(),
                _ => &[],
            };
            SnapshotDelta::Nodes(diff(old, rows, &context.policy(Table::Nodes)))
        }
        Snapshot::WaitTime(rows) => {
            let old: &[PartitionWaitStats] = match previous {
                Some(Snapshot::WaitTime(old)) => old.as_slice(),
                _ => &[],
            };
            SnapshotDelta::WaitTime(diff(old, rows, &context.policy(Table::WaitTime)))
        }
        Snapshot::Priority(tables) => {
            let empty = PriorityTables::default();
            let old = match previous {
                Some(Snapshot::Priority(old)) => old,
                _ => &empty,
            };
            SnapshotDelta::Priority {
                users: diff(
                    &old.users,
                    &tables.users,
                    &context.policy(Table::PriorityUsers),
                ),
                accounts: diff(
                    &old.accounts,
                    &tables.accounts,
                    &context.policy(Table::PriorityAccounts),
                ),
                jobs: diff(
                    &old.jobs,
                    &tables.jobs,
                    &context.policy(Table::PriorityJobs),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdash_core::JobState;

    fn node(name: &str, state: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            state: state.to_string(),
            ..NodeInfo::default()
        }
    }

    fn context() -> DiffContext {
        DiffContext {
            churn_threshold: 0.6,
            reordered: HashSet::new(),
        }
    }

    #[test]
    fn node_snapshots_diff_by_name() {
        let old = Snapshot::Nodes(vec![node("a", "IDLE"), node("b", "IDLE")]);
        let new = Snapshot::Nodes(vec![node("a", "MIXED"), node("b", "IDLE")]);
        let SnapshotDelta::Nodes(delta) = diff_snapshots(Some(&old), &new, &context()) else {
            panic!("expected node delta");
        };
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.unchanged, vec!["b"]);
    }

    #[test]
    fn reordered_table_flag_only_touches_that_table() {
        let old = Snapshot::Jobs(
            (0..4)
                .map(|i| Job {
                    job_id: i.to_string(),
                    state: JobState::Running,
                    ..Job::default()
                })
                .collect(),
        );
        let Snapshot::Jobs(mut rows) = old.clone() else {
            unreachable!()
        };
        rows.pop();
        let new = Snapshot::Jobs(rows);

        let mut ctx = context();
        ctx.reordered.insert(Table::Nodes);
        assert_eq!(diff_snapshots(Some(&old), &new, &ctx).rebuild(), None);
        ctx.reordered.insert(Table::Jobs);
        assert_eq!(
            diff_snapshots(Some(&old), &new, &ctx).rebuild(),
            Some(RebuildReason::ViewReordered)
        );
    }

    #[test]
    fn first_priority_snapshot_is_all_added() {
        let tables = PriorityTables {
            users: vec![UserPriority {
                username: "ada".to_string(),
                ..UserPriority::default()
            }],
            ..PriorityTables::default()
        };
        let delta = diff_snapshots(None, &Snapshot::Priority(tables), &context());
        let SnapshotDelta::Priority { users, jobs, .. } = delta else {
            panic!("expected priority delta");
        };
        assert_eq!(users.added.len(), 1);
        assert!(jobs.is_noop());
    }

    #[test]
    fn programs_per_source() {
        assert_eq!(Source::Priority.programs(), &["sshare", "sprio"]);
        assert!(Source::AllJobs.feeds_aggregates());
        assert!(!Source::History.feeds_aggregates());
    }
}
