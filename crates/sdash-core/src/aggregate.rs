//! Derived statistics. Every function here is a pure fold over its inputs.

use crate::{
    ClusterStats, GpuBreakdown, Job, JobCategory, JobHistory, JobState, NodeInfo,
    UserPendingStats, UserStats,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Per-user totals over the given jobs, heaviest CPU users first. Callers
/// pick the job set; the refresh loop passes running jobs.
pub fn aggregate_user_stats(jobs: &[Job]) -> Vec<UserStats> {
    let mut by_user: BTreeMap<&str, (UserStats, BTreeSet<&str>)> = BTreeMap::new();
    for job in jobs {
        if job.user.is_empty() {
            continue;
        }
        let (stats, nodes) = by_user
            .entry(job.user.as_str())
            .or_insert_with(|| (UserStats::default(), BTreeSet::new()));
        stats.job_count += 1;
        stats.total_nodes += job.nodes;
        let cpus = job.effective_cpus();
        // No CPU information at all: count one per node rather than nothing.
        stats.total_cpus += if cpus > 0 { cpus } else { job.nodes };
        stats.total_memory_gb += job.effective_memory_gb();
        stats.total_gpus += job.gpus.total();
        stats.gpu_types.merge(&job.gpus);
        let node_list = job.node_list.trim();
        if !node_list.is_empty() && !is_reason_placeholder(node_list) {
            nodes.insert(node_list);
        }
    }

    let mut users: Vec<UserStats> = by_user
        .into_iter()
        .map(|(username, (mut stats, nodes))| {
            stats.username = username.to_string();
            stats.node_count = nodes.len() as u32;
            stats.nodes = nodes.into_iter().collect::<Vec<_>>().join(",");
            stats
        })
        .collect();
    users.sort_by(|a, b| {
        b.total_cpus
            .cmp(&a.total_cpus)
            .then_with(|| a.username.cmp(&b.username))
    });
    users
}

pub fn running_jobs(jobs: &[Job]) -> Vec<Job> {
    jobs.iter()
        .filter(|job| job.state.category() == JobCategory::Running)
        .cloned()
        .collect()
}

/// Per-user demand of pending jobs. Array rows count once per task.
pub fn aggregate_pending_user_stats(jobs: &[Job]) -> Vec<UserPendingStats> {
    let mut by_user: BTreeMap<&str, UserPendingStats> = BTreeMap::new();
    for job in jobs {
        if job.user.is_empty() || job.state != JobState::Pending {
            continue;
        }
        let tasks = job.array_size();
        let stats = by_user.entry(job.user.as_str()).or_default();
        stats.job_count += tasks;
        stats.total_cpus += job.effective_cpus().saturating_mul(tasks);
        stats.total_memory_gb += job.effective_memory_gb() * f64::from(tasks);
        stats.total_gpus += job.gpus.total().saturating_mul(tasks);
        stats.gpu_types.merge(&job.gpus.scaled(tasks));
    }

    let mut users: Vec<UserPendingStats> = by_user
        .into_iter()
        .map(|(username, mut stats)| {
            stats.username = username.to_string();
            stats
        })
        .collect();
    users.sort_by(|a, b| {
        b.total_cpus
            .cmp(&a.total_cpus)
            .then_with(|| a.username.cmp(&b.username))
    });
    users
}

/// A node-list value that is really a pending reason such as `(Resources)`.
pub fn is_reason_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.len() >= 2 && value.starts_with('(') && value.ends_with(')')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Draining { allocated: bool },
    Down,
    Free,
    Allocated,
    Other,
}

/// DRAIN is checked first so `IDLE+DRAIN` never reads as free capacity.
pub fn classify_node_state(state: &str) -> NodeClass {
    let upper = state.to_ascii_uppercase();
    let allocated = upper.contains("ALLOCATED") || upper.contains("MIXED");
    if upper.contains("DRAIN") {
        return NodeClass::Draining { allocated };
    }
    if upper.contains("DOWN") || upper.contains("FAIL") || upper.ends_with('*') {
        return NodeClass::Down;
    }
    if upper.contains("IDLE") {
        return NodeClass::Free;
    }
    if allocated || upper.contains("COMPLETING") {
        return NodeClass::Allocated;
    }
    NodeClass::Other
}

/// Cluster-wide capacity. Draining nodes stay out of every `total_*` but
/// their allocations still count. `all_jobs` is optional input and only
/// feeds the job counters.
pub fn cluster_stats(nodes: &[NodeInfo], all_jobs: Option<&[Job]>) -> ClusterStats {
    let mut stats = ClusterStats::default();
    for node in nodes {
        let class = classify_node_state(&node.state);
        let draining = matches!(class, NodeClass::Draining { .. });

        match class {
            NodeClass::Draining { allocated } => {
                stats.draining_nodes += 1;
                if allocated {
                    stats.allocated_nodes += 1;
                }
            }
            NodeClass::Down => {
                stats.total_nodes += 1;
                stats.down_nodes += 1;
            }
            NodeClass::Free => {
                stats.total_nodes += 1;
                stats.free_nodes += 1;
            }
            NodeClass::Allocated => {
                stats.total_nodes += 1;
                stats.allocated_nodes += 1;
            }
            NodeClass::Other => stats.total_nodes += 1,
        }

        if !draining {
            stats.total_cpus += node.cpus_total;
            stats.total_memory_gb += node.memory_total_gb;
            stats.total_gpus += node.gpus_total.total();
        }
        stats.allocated_cpus += node.cpus_alloc;
        stats.allocated_memory_gb += node.memory_alloc_gb;
        stats.allocated_gpus += node.gpus_alloc.total();

        accumulate_gpu_types(&mut stats, node, draining);
    }

    if let Some(jobs) = all_jobs {
        for job in jobs {
            match job.state.category() {
                JobCategory::Running => stats.running_jobs += 1,
                JobCategory::Pending => stats.pending_jobs += job.array_size(),
                _ => {}
            }
        }
    }
    stats
}

fn accumulate_gpu_types(stats: &mut ClusterStats, node: &NodeInfo, draining: bool) {
    if !draining {
        for (gpu_type, count) in node.gpus_total.iter() {
            stats.gpus_by_type.entry(gpu_type.clone()).or_insert((0, 0)).0 += count;
        }
    }
    for (gpu_type, count) in node.gpus_alloc.iter() {
        stats.gpus_by_type.entry(gpu_type.clone()).or_insert((0, 0)).1 += count;
    }
}

/// Newest jobs first, with requeue totals for the history header.
pub fn summarize_history(mut jobs: Vec<Job>) -> JobHistory {
    jobs.sort_by(|a, b| {
        b.base_id()
            .cmp(&a.base_id())
            .then_with(|| b.job_id.cmp(&a.job_id))
    });
    let total_requeues = jobs.iter().map(|job| job.requeues).sum();
    let max_requeues = jobs.iter().map(|job| job.requeues).max().unwrap_or(0);
    JobHistory {
        total_jobs: jobs.len() as u32,
        total_requeues,
        max_requeues,
        jobs,
    }
}

/// Live jobs first, then history rows the live source no longer reports.
pub fn merge_job_views(active: &[Job], history: &[Job]) -> Vec<Job> {
    let live: HashSet<&str> = active.iter().map(|job| job.job_id.as_str()).collect();
    active
        .iter()
        .cloned()
        .chain(
            history
                .iter()
                .filter(|job| !live.contains(job.job_id.as_str()))
                .cloned(),
        )
        .collect()
}

/// Job count per display category, for summary badges.
pub fn count_by_category(jobs: &[Job]) -> BTreeMap<JobCategory, u32> {
    let mut counts = BTreeMap::new();
    for job in jobs {
        *counts.entry(job.state.category()).or_insert(0) += 1;
    }
    counts
}

/// Total GPUs by type across jobs, used by the pending demand summary.
pub fn gpu_demand(jobs: &[Job]) -> GpuBreakdown {
    let mut total = GpuBreakdown::new();
    for job in jobs {
        total.merge(&job.gpus.scaled(job.array_size()));
    }
    total
}
