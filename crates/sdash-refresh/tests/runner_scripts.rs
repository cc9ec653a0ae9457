#![cfg(unix)]

use sdash_refresh::actions::{cancel_job, job_detail, node_detail, ActionError, DetailSource};
use sdash_refresh::{CommandError, CommandRunner, SystemRunner};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
}

fn runner_in(dir: &TempDir) -> SystemRunner {
    SystemRunner::with_search_path(dir.path().as_os_str())
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[tokio::test]
async fn stdout_is_returned_on_success() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "squeue", r#"echo "args: $*""#);
    let runner = runner_in(&dir);

    assert_eq!(
        runner.resolve("squeue"),
        Some(dir.path().join("squeue"))
    );
    let out = runner
        .run("squeue", &args(&["--noheader", "-u", "ada"]), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(out, "args: --noheader -u ada\n");
}

#[tokio::test]
async fn non_zero_exit_carries_stderr() {
    let dir = TempDir::new().unwrap();
    write_script(
        dir.path(),
        "sacct",
        "echo 'sacct: error: slurmdbd: connection refused' >&2\nexit 1",
    );
    let err = runner_in(&dir)
        .run("sacct", &[], Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        CommandError::Failed { code, stderr, .. } => {
            assert_eq!(code, Some(1));
            assert_eq!(stderr, "sacct: error: slurmdbd: connection refused");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_command_times_out() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "scontrol", "exec sleep 5");
    let started = Instant::now();
    let err = runner_in(&dir)
        .run("scontrol", &[], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn missing_executable_is_fatal() {
    let dir = TempDir::new().unwrap();
    let err = runner_in(&dir)
        .run("sprio", &[], Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.to_string(), "sprio not found on PATH");
}

#[tokio::test]
async fn job_detail_prefers_the_controller() {
    let dir = TempDir::new().unwrap();
    write_script(
        dir.path(),
        "scontrol",
        r#"cat <<'OUT'
JobId=4242 JobName=train
   UserId=ada(1000) GroupId=ada(1000)
   JobState=RUNNING Reason=None
   NodeList=gpu01 BatchHost=gpu01
   StdOut=/home/ada/logs/%x-%j.out
   StdErr=/home/ada/logs/%x-%j.err
OUT"#,
    );
    let detail = job_detail(&runner_in(&dir), "4242").await.unwrap();
    assert_eq!(detail.source, DetailSource::Scontrol);
    assert_eq!(detail.get("JobState"), Some("RUNNING"));
    assert_eq!(detail.stdout_path(), Some("/home/ada/logs/train-4242.out"));
    assert_eq!(detail.stderr_path(), Some("/home/ada/logs/train-4242.err"));
}

#[tokio::test]
async fn job_detail_falls_back_to_accounting() {
    let dir = TempDir::new().unwrap();
    write_script(
        dir.path(),
        "scontrol",
        "echo 'slurm_load_jobs error: Invalid job id specified' >&2\nexit 1",
    );
    write_script(
        dir.path(),
        "sacct",
        "echo '77|post|bob|bio|cpu|COMPLETED|0:0|2024-05-01T10:00:00|2024-05-01T11:00:00|01:00:00|120|1|4|1|8G|||cpu01|/work|/work/%x.%j.out|/work/%x.%j.err|2024-05-01T09:59:00|100|normal'",
    );
    let detail = job_detail(&runner_in(&dir), "77").await.unwrap();
    assert_eq!(detail.source, DetailSource::Accounting);
    assert_eq!(detail.get("State"), Some("COMPLETED"));
    assert_eq!(detail.get("MaxRSS"), None);
    assert_eq!(detail.stdout_path(), Some("/work/post.77.out"));
    assert_eq!(detail.get("QOS"), Some("normal"));
}

#[tokio::test]
async fn job_detail_reports_unknown_jobs() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "scontrol", "exit 1");
    write_script(dir.path(), "sacct", "exit 0");
    let err = job_detail(&runner_in(&dir), "12345").await.unwrap_err();
    assert!(matches!(err, ActionError::UnknownJob(id) if id == "12345"));
}

#[tokio::test]
async fn cancel_validates_before_running_anything() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("called");
    write_script(
        dir.path(),
        "scancel",
        &format!("echo \"$1\" > {}", marker.display()),
    );
    let runner = runner_in(&dir);

    let err = cancel_job(&runner, "42; rm -rf /").await.unwrap_err();
    assert!(matches!(err, ActionError::Invalid(_)));
    assert!(!marker.exists());

    cancel_job(&runner, " 4242_3 ").await.unwrap();
    assert_eq!(fs::read_to_string(&marker).unwrap(), "4242_3\n");
}

#[tokio::test]
async fn cancel_surfaces_scancel_errors() {
    let dir = TempDir::new().unwrap();
    write_script(
        dir.path(),
        "scancel",
        "echo 'scancel: error: Kill job error on job id 9: Access/permission denied' >&2\nexit 1",
    );
    let err = cancel_job(&runner_in(&dir), "9").await.unwrap_err();
    assert!(err.to_string().contains("Access/permission denied"));
}

#[tokio::test]
async fn pending_array_rows_cancel_only_their_tasks() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("called");
    write_script(
        dir.path(),
        "scancel",
        &format!("echo \"$1\" > {}", marker.display()),
    );
    cancel_job(&runner_in(&dir), "5000_[3-9%2]").await.unwrap();
    assert_eq!(fs::read_to_string(&marker).unwrap(), "5000_[3-9]\n");
}

#[tokio::test]
async fn pending_array_detail_uses_the_base_id() {
    let dir = TempDir::new().unwrap();
    write_script(
        dir.path(),
        "scontrol",
        r#"if [ "$3" != "5000" ]; then echo "bad id $3" >&2; exit 1; fi
cat <<'OUT'
JobId=5003 ArrayJobId=5000 ArrayTaskId=3-9%2 JobName=sweep
   JobState=PENDING Reason=JobArrayTaskLimit
   StdOut=/scratch/%x-%A.out
OUT"#,
    );
    let detail = job_detail(&runner_in(&dir), "5000_[3-9%2]").await.unwrap();
    assert_eq!(detail.source, DetailSource::Scontrol);
    assert_eq!(detail.job_id, "5000");
    assert_eq!(detail.get("Reason"), Some("JobArrayTaskLimit"));
    assert_eq!(detail.stdout_path(), Some("/scratch/sweep-5000.out"));
}

#[tokio::test]
async fn node_detail_reads_the_controller() {
    let dir = TempDir::new().unwrap();
    write_script(
        dir.path(),
        "scontrol",
        r#"if [ "$1 $2 $3" != "show node gpu01" ]; then exit 1; fi
cat <<'OUT'
NodeName=gpu01 Arch=x86_64 CoresPerSocket=32
   CPUAlloc=48 CPUTot=64 CPULoad=47.10
   Gres=gpu:h200:8(S:0-1)
   State=MIXED ThreadsPerCore=1
   Partitions=gpu,debug
OUT"#,
    );
    let detail = node_detail(&runner_in(&dir), " gpu01 ").await.unwrap();
    assert_eq!(detail.name, "gpu01");
    assert_eq!(detail.get("State"), Some("MIXED"));
    let titles: Vec<&str> = detail.sections().iter().map(|(title, _)| *title).collect();
    assert_eq!(
        titles,
        vec!["Identity", "Status", "Resources", "Hardware", "Partitions"]
    );
}

#[tokio::test]
async fn node_detail_errors() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("called");
    write_script(
        dir.path(),
        "scontrol",
        &format!("touch {}\nexit 0", marker.display()),
    );
    let runner = runner_in(&dir);

    let err = node_detail(&runner, "gpu01;id").await.unwrap_err();
    assert!(matches!(err, ActionError::Invalid(_)));
    assert!(!marker.exists());

    let err = node_detail(&runner, "gpu01").await.unwrap_err();
    assert!(matches!(err, ActionError::UnknownNode(name) if name == "gpu01"));

    write_script(
        dir.path(),
        "scontrol",
        "echo 'Node gpu99 not found' >&2\nexit 1",
    );
    let err = node_detail(&runner, "gpu99").await.unwrap_err();
    assert!(err.to_string().contains("Node gpu99 not found"));
}
