//! One-shot actions: job and node detail views, and job cancellation.

use crate::runner::{CommandError, CommandRunner};
use sdash_core::parse::parse_key_value_records;
use sdash_core::validation::{base_job_id, validate_job_id, validate_node_name, ValidationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Columns requested from accounting when the controller no longer knows the
/// job.
pub const ACCOUNTING_DETAIL_FIELDS: [&str; 24] = [
    "JobID",
    "JobName",
    "User",
    "Account",
    "Partition",
    "State",
    "ExitCode",
    "Start",
    "End",
    "Elapsed",
    "TimelimitRaw",
    "NNodes",
    "NCPUS",
    "NTasks",
    "ReqMem",
    "MaxRSS",
    "MaxVMSize",
    "NodeList",
    "WorkDir",
    "StdOut",
    "StdErr",
    "Submit",
    "Priority",
    "QOS",
];

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("job {0} not found")]
    UnknownJob(String),
    #[error("no information available for node {0}")]
    UnknownNode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailSource {
    Scontrol,
    Accounting,
}

/// Everything the scheduler reports about one job, in reported order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub job_id: String,
    pub fields: Vec<(String, String)>,
    pub source: DetailSource,
}

impl JobDetail {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn stdout_path(&self) -> Option<&str> {
        self.get("StdOut")
    }

    pub fn stderr_path(&self) -> Option<&str> {
        self.get("StdErr")
    }

    fn expand_log_paths(&mut self) {
        let expanded: Vec<(usize, String)> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, (key, value))| (key == "StdOut" || key == "StdErr") && value.contains('%'))
            .map(|(index, (_, value))| (index, expand_output_path(value, &self.job_id, &self.fields)))
            .collect();
        for (index, value) in expanded {
            self.fields[index].1 = value;
        }
    }
}

/// Fetches the detail view of `job_id`: the controller first, accounting
/// when the controller has forgotten the job.
///
/// A pending array row such as `4242_[0-9]` is looked up by its base id.
pub async fn job_detail<R: CommandRunner>(runner: &R, job_id: &str) -> Result<JobDetail, ActionError> {
    let job_id = validate_job_id(job_id)?;
    let job_id = if job_id.contains('[') {
        base_job_id(&job_id).to_string()
    } else {
        job_id
    };
    let args = vec!["show".to_string(), "job".to_string(), job_id.clone()];
    let controller = match runner.run("scontrol", &args, ACTION_TIMEOUT).await {
        Ok(raw) => parse_key_value_records(&raw)
            .into_iter()
            .next()
            .map(|record| record.into_pairs()),
        Err(err) => {
            debug!("job_detail_scontrol_failed: {job_id}: {err}");
            None
        }
    };

    let mut detail = match controller {
        Some(fields) => JobDetail {
            job_id,
            fields,
            source: DetailSource::Scontrol,
        },
        None => {
            let fields = accounting_detail(runner, &job_id).await?;
            JobDetail {
                job_id,
                fields,
                source: DetailSource::Accounting,
            }
        }
    };
    detail.expand_log_paths();
    Ok(detail)
}

async fn accounting_detail<R: CommandRunner>(
    runner: &R,
    job_id: &str,
) -> Result<Vec<(String, String)>, ActionError> {
    let args = vec![
        "--noheader".to_string(),
        "-X".to_string(),
        "-P".to_string(),
        "-j".to_string(),
        job_id.to_string(),
        format!("--format={}", ACCOUNTING_DETAIL_FIELDS.join(",")),
    ];
    let raw = runner.run("sacct", &args, ACTION_TIMEOUT).await?;
    let line = raw
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| ActionError::UnknownJob(job_id.to_string()))?;
    Ok(ACCOUNTING_DETAIL_FIELDS
        .iter()
        .zip(line.split('|'))
        .map(|(key, value)| (key.to_string(), value.trim().to_string()))
        .collect())
}

/// Substitutes the scheduler's filename placeholders in a log path.
///
/// `%j`/`%A` give the base job id, `%J` the full id, `%a` the array task
/// (`0` outside arrays), `%u` the owner, `%x` the job name, `%N` the first
/// node and `%%` a literal percent sign. Unknown placeholders are kept.
pub fn expand_output_path(path: &str, job_id: &str, fields: &[(String, String)]) -> String {
    let lookup = |key: &str| {
        fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    };
    let (base_id, array_task) = job_id.split_once('_').unwrap_or((job_id, "0"));
    let user = lookup("UserId")
        .map(|value| value.split('(').next().unwrap_or(value))
        .or_else(|| lookup("User"))
        .unwrap_or("");
    let name = lookup("JobName").or_else(|| lookup("Name")).unwrap_or("job");
    let node = lookup("NodeList")
        .or_else(|| lookup("BatchHost"))
        .unwrap_or("node");

    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('j') | Some('A') => out.push_str(base_id),
            Some('J') => out.push_str(job_id),
            Some('a') => out.push_str(array_task),
            Some('u') => out.push_str(user),
            Some('x') => out.push_str(name),
            Some('N') => out.push_str(node),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// What `scancel` is given for a validated id.
///
/// A pending array row keeps its task list so only the tasks it shows are
/// cancelled; the `%N` throttle is not part of a task list and is dropped.
pub fn scancel_target(job_id: &str) -> String {
    match (job_id.find('%'), job_id.rfind(']')) {
        (Some(throttle), Some(close)) if throttle < close => {
            format!("{}{}", &job_id[..throttle], &job_id[close..])
        }
        _ => job_id.to_string(),
    }
}

/// Cancels `job_id` with `scancel`.
pub async fn cancel_job<R: CommandRunner>(runner: &R, job_id: &str) -> Result<(), ActionError> {
    let job_id = validate_job_id(job_id)?;
    let target = scancel_target(&job_id);
    match runner
        .run("scancel", std::slice::from_ref(&target), ACTION_TIMEOUT)
        .await
    {
        Ok(_) => {
            info!(event = "job_cancelled", job_id = %job_id);
            Ok(())
        }
        Err(err) => {
            warn!(event = "job_cancel_failed", job_id = %job_id, error = %err);
            Err(err.into())
        }
    }
}

const NODE_SECTIONS: [(&str, &[&str]); 6] = [
    (
        "Identity",
        &["NodeName", "NodeAddr", "NodeHostName", "Arch", "OS", "Version"],
    ),
    ("Status", &["State", "Reason", "Owner", "MCS_label"]),
    (
        "Resources",
        &[
            "CPUTot",
            "CPUAlloc",
            "CPULoad",
            "CPUEfctv",
            "RealMemory",
            "AllocMem",
            "FreeMem",
            "CfgTRES",
            "AllocTRES",
            "Gres",
            "TmpDisk",
        ],
    ),
    (
        "Hardware",
        &[
            "CoresPerSocket",
            "Sockets",
            "Boards",
            "ThreadsPerCore",
            "Weight",
            "AvailableFeatures",
            "ActiveFeatures",
        ],
    ),
    ("Partitions", &["Partitions"]),
    (
        "Timing",
        &["BootTime", "SlurmdStartTime", "LastBusyTime", "ResumeAfterTime"],
    ),
];

/// `scontrol show node` output for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl NodeDetail {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Fields grouped under section titles; anything unlisted lands in a
    /// trailing `Other` section sorted by key. Empty sections are omitted.
    pub fn sections(&self) -> Vec<(&'static str, Vec<(&str, &str)>)> {
        let mut sections = Vec::new();
        for (title, keys) in NODE_SECTIONS {
            let entries: Vec<(&str, &str)> = keys
                .iter()
                .filter_map(|key| self.get(key).map(|value| (*key, value)))
                .collect();
            if !entries.is_empty() {
                sections.push((title, entries));
            }
        }
        let mut other: Vec<(&str, &str)> = self
            .fields
            .iter()
            .filter(|(key, _)| !NODE_SECTIONS.iter().any(|(_, keys)| keys.contains(&key.as_str())))
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        if !other.is_empty() {
            other.sort_by(|a, b| a.0.cmp(b.0));
            sections.push(("Other", other));
        }
        sections
    }
}

/// Fetches `scontrol show node` for a single node.
pub async fn node_detail<R: CommandRunner>(runner: &R, name: &str) -> Result<NodeDetail, ActionError> {
    let name = validate_node_name(name)?;
    let args = vec!["show".to_string(), "node".to_string(), name.clone()];
    let raw = runner.run("scontrol", &args, ACTION_TIMEOUT).await.map_err(|err| {
        warn!(event = "node_detail_failed", node = %name, error = %err);
        err
    })?;
    let fields = parse_key_value_records(&raw)
        .into_iter()
        .next()
        .map(|record| record.into_pairs())
        .filter(|fields| !fields.is_empty())
        .ok_or_else(|| ActionError::UnknownNode(name.clone()))?;
    debug!("node_detail: {name}: {} fields", fields.len());
    Ok(NodeDetail { name, fields })
}
