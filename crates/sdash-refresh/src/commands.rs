//! Command lines for each source and the parse step that turns their output
//! into snapshots.

use crate::runner::CommandError;
use sdash_core::aggregate::summarize_history;
use sdash_core::jobs::{
    parse_sacct, parse_squeue, sacct_history_layout, sacct_wait_layout, squeue_layout,
};
use sdash_core::nodes::parse_nodes;
use sdash_core::priority::{
    parse_sprio, parse_sshare, sprio_layout, sshare_layout, FairShareEntry, SPRIO_FORMAT,
};
use sdash_core::wait_time::partition_wait_stats;
use sdash_core::{Job, JobHistory, JobPriority, NodeInfo, ParseReport, PartitionWaitStats};
use tracing::debug;

pub const HISTORY_WINDOW: &str = "now-24hours";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn display(&self) -> String {
        let mut line = self.program.to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

pub fn user_jobs_command(user: &str) -> CommandSpec {
    let format = format!("--Format={}", squeue_layout().field_spec(':'));
    CommandSpec::new("squeue", &["--noheader", "-u", user, &format])
}

pub fn all_jobs_command() -> CommandSpec {
    let format = format!("--Format={}", squeue_layout().field_spec(':'));
    CommandSpec::new("squeue", &["--noheader", "--all", &format])
}

pub fn history_command(user: &str) -> CommandSpec {
    let format = format!("--format={}", sacct_history_layout().field_spec('%'));
    CommandSpec::new(
        "sacct",
        &["--noheader", "-X", "-u", user, "-S", HISTORY_WINDOW, &format],
    )
}

pub fn wait_time_command(days: u32) -> CommandSpec {
    let start = format!("now-{days}days");
    let format = format!("--format={}", sacct_wait_layout().field_spec('%'));
    CommandSpec::new("sacct", &["--noheader", "-X", "-a", "-S", &start, &format])
}

pub fn nodes_command() -> CommandSpec {
    CommandSpec::new("scontrol", &["--oneliner", "show", "nodes"])
}

pub fn fair_share_command() -> CommandSpec {
    let format = format!("--format={}", sshare_layout().field_spec('%'));
    CommandSpec::new("sshare", &["--noheader", "-a", &format])
}

pub fn job_priority_command() -> CommandSpec {
    let format = format!("--format={SPRIO_FORMAT}");
    CommandSpec::new("sprio", &["--noheader", "--sort=-y", &format])
}

/// Records of a report, or a parse error when the output had lines but none
/// of them could be read.
fn recognized<T>(report: ParseReport<T>, program: &str) -> Result<Vec<T>, CommandError> {
    if report.is_unrecognized() {
        return Err(CommandError::Parse {
            program: program.to_string(),
            message: format!("{} lines, none usable", report.skipped),
        });
    }
    if report.skipped > 0 {
        debug!(
            "{program}_lines_skipped: {} of {}",
            report.skipped,
            report.skipped + report.records.len()
        );
    }
    Ok(report.records)
}

pub fn parse_job_output(raw: &str) -> Result<Vec<Job>, CommandError> {
    recognized(parse_squeue(raw, &squeue_layout()), "squeue")
}

pub fn parse_history_output(raw: &str) -> Result<JobHistory, CommandError> {
    let jobs = recognized(parse_sacct(raw, &sacct_history_layout()), "sacct")?;
    Ok(summarize_history(jobs))
}

pub fn parse_wait_time_output(raw: &str) -> Result<Vec<PartitionWaitStats>, CommandError> {
    let jobs = recognized(parse_sacct(raw, &sacct_wait_layout()), "sacct")?;
    Ok(partition_wait_stats(&jobs))
}

pub fn parse_node_output(raw: &str) -> Result<Vec<NodeInfo>, CommandError> {
    recognized(parse_nodes(raw), "scontrol")
}

pub fn parse_fair_share_output(raw: &str) -> Result<Vec<FairShareEntry>, CommandError> {
    recognized(parse_sshare(raw, &sshare_layout()), "sshare")
}

pub fn parse_job_priority_output(raw: &str) -> Result<Vec<JobPriority>, CommandError> {
    recognized(parse_sprio(raw, &sprio_layout()), "sprio")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeue_format_uses_colon_widths() {
        let spec = user_jobs_command("ada");
        assert_eq!(spec.program, "squeue");
        assert_eq!(spec.args[..3], ["--noheader", "-u", "ada"]);
        assert!(spec.args[3].starts_with("--Format=JobID:20,ArrayJobID:20,"));
    }

    #[test]
    fn sacct_formats_use_percent_widths() {
        let spec = wait_time_command(7);
        assert!(spec.args.contains(&"now-7days".to_string()));
        assert_eq!(
            spec.args.last().map(String::as_str),
            Some("--format=JobID%20,Partition%16,State%20,Submit%19,Start%19")
        );
        assert!(history_command("ada").display().contains("-S now-24hours"));
    }

    #[test]
    fn empty_output_is_not_a_parse_failure() {
        assert!(parse_job_output("").expect("empty queue").is_empty());
        assert_eq!(
            parse_history_output("\n").expect("empty history").total_jobs,
            0
        );
    }

    #[test]
    fn wholly_unrecognized_output_is_an_error() {
        let err = parse_node_output("State=IDLE CPUTot=4\n").expect_err("no node names");
        assert!(matches!(err, CommandError::Parse { .. }));
        assert_eq!(err.to_string(), "scontrol output not recognized: 1 lines, none usable");
    }
}
