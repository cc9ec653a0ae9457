use sdash_core::aggregate::{
    aggregate_pending_user_stats, aggregate_user_stats, cluster_stats, running_jobs,
};
use sdash_core::jobs::{parse_squeue, squeue_layout};
use sdash_core::nodes::parse_nodes;
use sdash_core::{diff, DiffPolicy, JobState, RebuildReason};

const SCONTROL_NODES: &str = "\
NodeName=gpu01 Arch=x86_64 CoresPerSocket=48
   CPUAlloc=96 CPUTot=192 CPULoad=40.20
   Gres=gpu:h200:8(S:0-1)
   RealMemory=2048000 AllocMem=1024000 FreeMem=900000
   State=MIXED ThreadsPerCore=1
   Partitions=gpu
   CfgTRES=cpu=192,mem=2000G,billing=192,gres/gpu=8,gres/gpu:h200=8
   AllocTRES=cpu=96,mem=1000G,gres/gpu=4,gres/gpu:h200=4

NodeName=gpu02 Arch=x86_64 CoresPerSocket=48
   CPUAlloc=0 CPUTot=192
   Gres=gpu:h200:8(S:0-1)
   RealMemory=2048000 AllocMem=0
   State=IDLE+DRAIN
   Partitions=gpu
   Reason=Kill task failed [root@2024-05-01T10:00:00]

NodeName=cpu01 Arch=x86_64
   CPUAlloc=64 CPUTot=64
   RealMemory=512000 AllocMem=512000
   State=ALLOCATED
   Partitions=cpu
NodeName=cpu02 CPUAlloc=0 CPUTot=64 RealMemory=512000 AllocMem=0 State=IDLE Partitions=cpu
NodeName=cpu03 CPUAlloc=0 CPUTot=64 RealMemory=512000 AllocMem=0 State=DOWN* Partitions=cpu
";

fn squeue_output() -> String {
    let layout = squeue_layout();
    [
        layout.render(&[
            "4242", "4242", "N/A", "train", "ada", "physics", "gpu", "RUNNING", "1:02:03", "1",
            "96", "1000G", "cpu=96,mem=1000G,node=1,gres/gpu=4,gres/gpu:h200=4",
            "2024-05-01T10:00:00", "2024-05-01T10:05:00", "gpu01",
        ]),
        layout.render(&[
            "4300", "4300", "N/A", "etl", "bob", "bio", "cpu", "RUNNING", "5:00", "1", "64",
            "500G", "cpu=64,mem=500G,node=1", "2024-05-01T09:00:00", "2024-05-01T09:01:00",
            "cpu01",
        ]),
        layout.render(&[
            "5001", "5000", "[0-9]", "sweep", "ada", "physics", "gpu", "PENDING", "0:00", "1",
            "8", "64G", "cpu=8,mem=64G,node=1,gres/gpu:h200=1", "2024-05-01T11:00:00", "N/A",
            "(Priority)",
        ]),
    ]
    .join("\n")
}

#[test]
fn multi_line_node_records_feed_cluster_totals() {
    let report = parse_nodes(SCONTROL_NODES);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.records.len(), 5);

    let drained = &report.records[1];
    assert!(drained.is_draining());
    assert_eq!(drained.reason, "Kill task failed [root@2024-05-01T10:00:00]");
    assert_eq!(
        report.records[0].extra.get("CPULoad").map(String::as_str),
        Some("40.20")
    );

    let jobs = parse_squeue(&squeue_output(), &squeue_layout()).records;
    let stats = cluster_stats(&report.records, Some(&jobs));
    assert_eq!(stats.total_nodes, 4);
    assert_eq!(stats.draining_nodes, 1);
    assert_eq!(stats.down_nodes, 1);
    assert_eq!(stats.free_nodes, 1);
    assert_eq!(stats.allocated_nodes, 2);
    assert_eq!(stats.total_cpus, 192 + 64 * 3);
    assert_eq!(stats.allocated_cpus, 160);
    assert_eq!(stats.total_gpus, 8);
    assert_eq!(stats.allocated_gpus, 4);
    assert_eq!(stats.gpus_by_type.get("h200"), Some(&(8, 4)));
    assert_eq!(stats.running_jobs, 2);
    assert_eq!(stats.pending_jobs, 10);
    assert!(stats.free_gpus_pct() > 49.9 && stats.free_gpus_pct() < 50.1);
}

#[test]
fn user_tables_split_running_and_pending() {
    let jobs = parse_squeue(&squeue_output(), &squeue_layout()).records;
    let running = aggregate_user_stats(&running_jobs(&jobs));
    assert_eq!(running.len(), 2);
    assert_eq!(running[0].username, "ada");
    assert_eq!(running[0].total_gpus, 4);
    assert_eq!(running[0].nodes, "gpu01");

    let pending = aggregate_pending_user_stats(&jobs);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_count, 10);
    assert_eq!(pending[0].total_gpus, 10);
    assert_eq!(pending[0].gpu_types.label(), "10x H200");
}

#[test]
fn snapshots_serialize_for_the_summary_output() {
    let jobs = parse_squeue(&squeue_output(), &squeue_layout()).records;
    let value = serde_json::to_value(&jobs[0]).expect("serialize job");
    assert_eq!(value["job_id"], "4242");
    assert_eq!(value["state"], "RUNNING");
    assert_eq!(value["gpus"]["h200"], 4);

    let stats = cluster_stats(&parse_nodes(SCONTROL_NODES).records, None);
    let value = serde_json::to_value(&stats).expect("serialize stats");
    assert_eq!(value["gpus_by_type"]["h200"], serde_json::json!([8, 4]));
}

#[test]
fn successive_queue_snapshots_diff_by_job_id() {
    let before = parse_squeue(&squeue_output(), &squeue_layout()).records;
    let mut after = before.clone();
    after.retain(|job| job.job_id != "4300");
    if let Some(job) = after.iter_mut().find(|job| job.job_id == "5000_[0-9]") {
        job.state = JobState::Running;
    }
    let delta = diff(&before, &after, &DiffPolicy::default());
    assert_eq!(delta.removed, vec!["4300"]);
    assert_eq!(delta.updated.len(), 1);
    assert_eq!(delta.unchanged, vec!["4242"]);
    assert_eq!(delta.rebuild, None);

    let sorted = DiffPolicy {
        view_reordered: true,
        ..DiffPolicy::default()
    };
    assert_eq!(
        diff(&before, &after, &sorted).rebuild,
        Some(RebuildReason::ViewReordered)
    );
}
