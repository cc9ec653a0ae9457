//! Job rows from `squeue --Format` and `sacct --format` output.

use crate::layout::{ColumnLayout, LayoutRecord};
use crate::parse::{parse_timestamp, parse_u32, ParseReport};
use crate::tres::{
    is_absent, parse_memory_gb, parse_tres_cpus, parse_tres_gpus, parse_tres_memory_gb,
};
use crate::{Job, JobState};
use tracing::warn;

/// `squeue --noheader --Format=...` fields. squeue pads each field to its
/// width without a separator.
pub fn squeue_layout() -> ColumnLayout {
    ColumnLayout::new(
        &[
            ("JobID", 20),
            ("ArrayJobID", 20),
            ("ArrayTaskID", 24),
            ("Name", 32),
            ("UserName", 16),
            ("Account", 16),
            ("Partition", 16),
            ("State", 16),
            ("TimeUsed", 14),
            ("NumNodes", 8),
            ("NumCPUs", 8),
            ("MinMemory", 12),
            ("tres-alloc", 96),
            ("SubmitTime", 20),
            ("StartTime", 20),
            ("ReasonList", 64),
        ],
        0,
    )
}

/// `sacct --noheader -X --format=...` fields for the job history view.
/// sacct separates fields with one space.
pub fn sacct_history_layout() -> ColumnLayout {
    ColumnLayout::new(
        &[
            ("JobID", 20),
            ("JobName", 32),
            ("User", 16),
            ("Account", 16),
            ("Partition", 16),
            ("State", 20),
            ("Restart", 8),
            ("Elapsed", 14),
            ("ExitCode", 8),
            ("NCPUS", 8),
            ("ReqMem", 12),
            ("Submit", 19),
            ("Start", 19),
            ("End", 19),
            ("AllocTRES", 96),
            ("NodeList", 64),
        ],
        1,
    )
}

/// Narrow accounting layout used for queue wait statistics.
pub fn sacct_wait_layout() -> ColumnLayout {
    ColumnLayout::new(
        &[
            ("JobID", 20),
            ("Partition", 16),
            ("State", 20),
            ("Submit", 19),
            ("Start", 19),
        ],
        1,
    )
}

pub fn parse_squeue(raw: &str, layout: &ColumnLayout) -> ParseReport<Job> {
    let mut report = ParseReport::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record = layout.split_record(line);
        match squeue_job(&record) {
            Some(job) => report.records.push(job),
            None => {
                warn!("squeue_line_skipped: {:?}", line.trim_end());
                report.skipped += 1;
            }
        }
    }
    report
}

fn squeue_job(record: &LayoutRecord<'_>) -> Option<Job> {
    let job_id = squeue_job_id(record)?;
    let state_raw = record.get("State");
    if state_raw.is_empty() {
        return None;
    }
    let state: JobState = state_raw.parse().unwrap_or_default();
    let context = format!("job {job_id}");

    let tres = record.get("tres-alloc");
    let nodes = parse_node_count(record.get("NumNodes"), &context);
    let mut job = Job {
        name: record.get("Name").to_string(),
        user: record.get("UserName").to_string(),
        account: record.get("Account").to_string(),
        partition: record.get("Partition").to_string(),
        elapsed: record.get("TimeUsed").to_string(),
        nodes,
        req_cpus: parse_u32("NumCPUs", record.get("NumCPUs"), &context),
        req_memory_gb: memory_field("MinMemory", record.get("MinMemory"), &context),
        gpus: parse_tres_gpus(tres),
        node_list: record.get("ReasonList").to_string(),
        submit_time: parse_timestamp(record.get("SubmitTime")),
        start_time: parse_timestamp(record.get("StartTime")),
        job_id,
        state,
        ..Job::default()
    };

    // squeue reports allocated TRES once a job runs and requested TRES before.
    let tres_cpus = parse_tres_cpus(tres);
    let tres_memory = parse_tres_memory_gb(tres);
    if matches!(job.state, JobState::Running | JobState::Completing) {
        job.alloc_cpus = tres_cpus;
        job.alloc_memory_gb = tres_memory;
    } else {
        if tres_cpus > 0 {
            job.req_cpus = tres_cpus;
        }
        if tres_memory > 0.0 {
            job.req_memory_gb = tres_memory;
        }
    }
    Some(job)
}

fn squeue_job_id(record: &LayoutRecord<'_>) -> Option<String> {
    let job_id = record.get("JobID");
    let array_job = record.get("ArrayJobID");
    let array_task = record.get("ArrayTaskID");
    if !is_absent(array_task) && !is_absent(array_job) {
        let pending_range = array_task.contains(['-', ',']) && !array_task.starts_with('[');
        if pending_range {
            return Some(format!("{array_job}_[{array_task}]"));
        }
        return Some(format!("{array_job}_{array_task}"));
    }
    if job_id.is_empty() {
        return None;
    }
    Some(job_id.to_string())
}

pub fn parse_sacct(raw: &str, layout: &ColumnLayout) -> ParseReport<Job> {
    let mut report = ParseReport::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record = layout.split_record(line);
        let job_id = record.get("JobID");
        // Job steps (`123.batch`, `123.0`) slip through when -X is not honoured.
        if job_id.contains('.') {
            continue;
        }
        let state_raw = record.get("State");
        if job_id.is_empty() || state_raw.is_empty() {
            warn!("sacct_line_skipped: {:?}", line.trim_end());
            report.skipped += 1;
            continue;
        }
        let context = format!("job {job_id}");
        let tres = record.get("AllocTRES");
        report.records.push(Job {
            job_id: job_id.to_string(),
            name: record.get("JobName").to_string(),
            user: record.get("User").to_string(),
            account: record.get("Account").to_string(),
            partition: record.get("Partition").to_string(),
            state: state_raw.parse().unwrap_or_default(),
            elapsed: record.get("Elapsed").to_string(),
            nodes: 0,
            req_cpus: parse_u32("NCPUS", record.get("NCPUS"), &context),
            alloc_cpus: parse_tres_cpus(tres),
            req_memory_gb: memory_field("ReqMem", record.get("ReqMem"), &context),
            alloc_memory_gb: parse_tres_memory_gb(tres),
            gpus: parse_tres_gpus(tres),
            node_list: record.get("NodeList").to_string(),
            submit_time: parse_timestamp(record.get("Submit")),
            start_time: parse_timestamp(record.get("Start")),
            end_time: parse_timestamp(record.get("End")),
            requeues: parse_u32("Restart", record.get("Restart"), &context),
            exit_code: record.get("ExitCode").to_string(),
        });
    }
    report
}

/// `4` or a pending range `4-8` (counted as 5, the span of the request).
pub fn parse_node_count(raw: &str, context: &str) -> u32 {
    let trimmed = raw.trim();
    if let Some((start, end)) = trimmed.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
            if end >= start {
                return end - start + 1;
            }
        }
        warn!("numeric_field_invalid: {context} NumNodes={trimmed:?}");
        return 0;
    }
    parse_u32("NumNodes", trimmed, context)
}

fn memory_field(field: &str, raw: &str, context: &str) -> f64 {
    match parse_memory_gb(raw) {
        Some(value) => value,
        None => {
            warn!("numeric_field_invalid: {context} {field}={:?}", raw.trim());
            0.0
        }
    }
}
