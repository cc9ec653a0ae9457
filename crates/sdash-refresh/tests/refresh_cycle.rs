use sdash_core::jobs::squeue_layout;
use sdash_refresh::{
    CommandError, CommandRunner, FetchPhase, Orchestrator, RefreshConfig, RefreshEvent,
    RefreshTrigger, Snapshot, Source, SourceOutcome, StateStore, EVENT_QUEUE_CAPACITY,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

const NODES: &str = "\
NodeName=gpu01 CPUAlloc=96 CPUTot=192 RealMemory=2048000 AllocMem=1024000 State=MIXED Gres=gpu:h200:8 AllocTRES=cpu=96,gres/gpu:h200=4
NodeName=cpu01 CPUAlloc=0 CPUTot=64 RealMemory=512000 AllocMem=0 State=IDLE
";

enum Reply {
    Ok(String),
    Fail,
}

/// Answers each program from a script, then from a fixed default.
#[derive(Default)]
struct FakeRunner {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: HashMap<String, String>,
    missing: HashSet<String>,
    gates: HashMap<String, Arc<Semaphore>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn cluster() -> Self {
        let layout = squeue_layout();
        let queue = [
            layout.render(&[
                "4242", "4242", "N/A", "train", "ada", "physics", "gpu", "RUNNING", "1:00", "1",
                "96", "1000G", "cpu=96,mem=1000G,gres/gpu:h200=4", "2024-05-01T10:00:00",
                "2024-05-01T10:05:00", "gpu01",
            ]),
            layout.render(&[
                "5001", "5000", "[0-3]", "sweep", "bob", "bio", "cpu", "PENDING", "0:00", "1",
                "8", "16G", "cpu=8,mem=16G", "2024-05-01T11:00:00", "N/A", "(Priority)",
            ]),
        ]
        .join("\n");
        let mut defaults = HashMap::new();
        defaults.insert("squeue".to_string(), queue);
        defaults.insert("scontrol".to_string(), NODES.to_string());
        Self {
            defaults,
            ..Self::default()
        }
    }

    fn script(&self, program: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .extend(replies);
    }

    fn calls_to(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == program)
            .count()
    }
}

impl CommandRunner for FakeRunner {
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        (!self.missing.contains(program)).then(|| PathBuf::from("/opt/slurm/bin").join(program))
    }

    async fn run(
        &self,
        program: &str,
        _args: &[String],
        _timeout: Duration,
    ) -> Result<String, CommandError> {
        self.calls.lock().unwrap().push(program.to_string());
        if self.missing.contains(program) {
            return Err(CommandError::NotFound {
                program: program.to_string(),
            });
        }
        if let Some(gate) = self.gates.get(program).cloned() {
            gate.acquire().await.unwrap().forget();
        }
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(program)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Reply::Fail) => Err(CommandError::Failed {
                program: program.to_string(),
                code: Some(1),
                stderr: "slurm_load_node error: Socket timed out".to_string(),
            }),
            Some(Reply::Ok(raw)) => Ok(raw),
            None => Ok(self.defaults.get(program).cloned().unwrap_or_default()),
        }
    }
}

fn no_retries() -> RefreshConfig {
    RefreshConfig {
        max_retries: 0,
        retry_initial_delay_ms: 1,
        ..RefreshConfig::default()
    }
}

fn start(
    runner: FakeRunner,
    config: RefreshConfig,
) -> (
    Orchestrator<FakeRunner>,
    Arc<FakeRunner>,
    mpsc::Receiver<RefreshEvent>,
) {
    let runner = Arc::new(runner);
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let orchestrator = Orchestrator::new(
        Arc::clone(&runner),
        Arc::new(StateStore::new()),
        config,
        "ada",
        tx,
    );
    (orchestrator, runner, rx)
}

fn drain(rx: &mut mpsc::Receiver<RefreshEvent>) -> Vec<RefreshEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn failures_for(events: &[RefreshEvent], wanted: Source) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, RefreshEvent::Failed { source, .. } if *source == wanted))
        .count()
}

#[tokio::test]
async fn repeated_failures_notify_once_until_recovery() {
    let runner = FakeRunner::cluster();
    runner.script(
        "scontrol",
        vec![
            Reply::Ok(NODES.to_string()),
            Reply::Fail,
            Reply::Fail,
            Reply::Fail,
            Reply::Ok(NODES.to_string()),
            Reply::Fail,
        ],
    );
    let (orchestrator, _runner, mut rx) = start(runner, no_retries());

    let first = orchestrator.run_cycle(RefreshTrigger::Startup).await;
    assert_eq!(first.outcome(Source::Nodes), Some(SourceOutcome::Updated));
    drain(&mut rx);

    let mut notified = Vec::new();
    for _ in 0..3 {
        let summary = orchestrator.run_cycle(RefreshTrigger::Periodic).await;
        assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Failed));
        notified.push(failures_for(&drain(&mut rx), Source::Nodes));
    }
    assert_eq!(notified, vec![1, 0, 0]);
    assert!(orchestrator.store().is_error(Source::Nodes));
    assert_eq!(orchestrator.phase(Source::Nodes), FetchPhase::Failed);

    // Last good data stays readable while the source fails.
    let stale = orchestrator.store().get(Source::Nodes).expect("stale nodes");
    assert_eq!(stale.snapshot.row_count(), 2);

    let recovered = orchestrator.run_cycle(RefreshTrigger::Periodic).await;
    assert_eq!(recovered.outcome(Source::Nodes), Some(SourceOutcome::Updated));
    assert_eq!(failures_for(&drain(&mut rx), Source::Nodes), 0);
    assert!(!orchestrator.store().is_error(Source::Nodes));

    orchestrator.run_cycle(RefreshTrigger::Periodic).await;
    assert_eq!(failures_for(&drain(&mut rx), Source::Nodes), 1);
}

#[tokio::test]
async fn manual_refresh_notifies_again() {
    let runner = FakeRunner::cluster();
    runner.script("scontrol", vec![Reply::Fail, Reply::Fail, Reply::Fail]);
    let (orchestrator, _runner, mut rx) = start(runner, no_retries());

    orchestrator.run_cycle(RefreshTrigger::Startup).await;
    orchestrator.run_cycle(RefreshTrigger::Periodic).await;
    assert_eq!(failures_for(&drain(&mut rx), Source::Nodes), 1);

    orchestrator.prepare_manual_refresh();
    let manual = orchestrator.run_cycle(RefreshTrigger::Manual).await;
    assert_eq!(manual.trigger, RefreshTrigger::Manual);
    let events = drain(&mut rx);
    assert_eq!(failures_for(&events, Source::Nodes), 1);
    let message = events
        .iter()
        .find_map(|event| match event {
            RefreshEvent::Failed { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("failure message");
    assert!(message.contains("scontrol exited with status 1"));
}

#[tokio::test]
async fn busy_source_is_skipped_by_the_next_cycle() {
    let gate = Arc::new(Semaphore::new(0));
    let mut runner = FakeRunner::cluster();
    runner.gates.insert("scontrol".to_string(), Arc::clone(&gate));
    let (orchestrator, _runner, mut rx) = start(runner, no_retries());

    let slow = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle(RefreshTrigger::Startup).await })
    };
    for _ in 0..200 {
        if orchestrator.phase(Source::Nodes) == FetchPhase::Fetching {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(orchestrator.phase(Source::Nodes), FetchPhase::Fetching);

    let overlapping = orchestrator.run_cycle(RefreshTrigger::Periodic).await;
    assert_eq!(overlapping.outcome(Source::Nodes), Some(SourceOutcome::Skipped));
    assert_eq!(overlapping.outcome(Source::Jobs), Some(SourceOutcome::Updated));

    gate.add_permits(1);
    let first = slow.await.expect("cycle task");
    assert_eq!(first.outcome(Source::Nodes), Some(SourceOutcome::Updated));
    assert_eq!(orchestrator.phase(Source::Nodes), FetchPhase::Succeeded);

    let node_updates = drain(&mut rx)
        .into_iter()
        .filter(|event| {
            matches!(event, RefreshEvent::DataReady { source: Source::Nodes, .. })
        })
        .count();
    assert_eq!(node_updates, 1);
}

#[tokio::test]
async fn transient_failure_is_retried_within_the_cycle() {
    let runner = FakeRunner::cluster();
    runner.script("scontrol", vec![Reply::Fail, Reply::Fail]);
    let config = RefreshConfig {
        max_retries: 2,
        retry_initial_delay_ms: 1,
        ..RefreshConfig::default()
    };
    let (orchestrator, runner, mut rx) = start(runner, config);

    let summary = orchestrator.run_cycle(RefreshTrigger::Startup).await;
    assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Updated));
    assert_eq!(runner.calls_to("scontrol"), 3);
    assert_eq!(failures_for(&drain(&mut rx), Source::Nodes), 0);
}

#[tokio::test]
async fn cancelling_a_cycle_stops_its_retries() {
    let runner = FakeRunner::cluster();
    runner.script("scontrol", (0..6).map(|_| Reply::Fail).collect());
    let config = RefreshConfig {
        max_retries: 5,
        retry_initial_delay_ms: 80,
        ..RefreshConfig::default()
    };
    let (orchestrator, runner, _rx) = start(runner, config);

    let cycle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle(RefreshTrigger::Periodic).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.cancel_current();

    let summary = cycle.await.expect("cycle task");
    assert!(summary.cancelled);
    assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Failed));
    assert!(runner.calls_to("scontrol") <= 2);
}

fn slow_backoff() -> RefreshConfig {
    RefreshConfig {
        max_retries: 3,
        retry_initial_delay_ms: 5_000,
        ..RefreshConfig::default()
    }
}

async fn wait_for_calls(runner: &FakeRunner, program: &str, count: usize) {
    for _ in 0..400 {
        if runner.calls_to(program) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{program} was not called {count} times");
}

#[tokio::test]
async fn cancel_interrupts_a_retry_backoff() {
    let runner = FakeRunner::cluster();
    runner.script("scontrol", (0..4).map(|_| Reply::Fail).collect());
    let (orchestrator, runner, _rx) = start(runner, slow_backoff());

    let cycle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle(RefreshTrigger::Periodic).await })
    };
    wait_for_calls(&runner, "scontrol", 1).await;
    orchestrator.cancel_current();

    let summary = tokio::time::timeout(Duration::from_secs(2), cycle)
        .await
        .expect("cycle ends without waiting out the backoff")
        .expect("cycle task");
    assert!(summary.cancelled);
    assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Failed));
    assert_eq!(runner.calls_to("scontrol"), 1);
}

#[tokio::test]
async fn manual_refresh_cancels_older_cycles_too() {
    let runner = FakeRunner::cluster();
    runner.script("scontrol", (0..4).map(|_| Reply::Fail).collect());
    let (orchestrator, runner, _rx) = start(runner, slow_backoff());

    let older = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle(RefreshTrigger::Startup).await })
    };
    wait_for_calls(&runner, "scontrol", 1).await;
    let newer = orchestrator.run_cycle(RefreshTrigger::Periodic).await;
    assert_eq!(newer.outcome(Source::Nodes), Some(SourceOutcome::Skipped));

    orchestrator.prepare_manual_refresh();
    let summary = tokio::time::timeout(Duration::from_secs(2), older)
        .await
        .expect("older cycle stops on manual refresh")
        .expect("cycle task");
    assert!(summary.cancelled);
    assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Failed));
    assert_eq!(runner.calls_to("scontrol"), 1);
}

#[tokio::test]
async fn missing_program_marks_source_unavailable() {
    let mut runner = FakeRunner::cluster();
    runner.missing.insert("sprio".to_string());
    let (orchestrator, _runner, mut rx) = start(runner, no_retries());

    assert_eq!(orchestrator.check_programs().await, vec![Source::Priority]);
    let events = drain(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [RefreshEvent::Unavailable { source: Source::Priority, program }] if program == "sprio"
    ));

    let summary = orchestrator.run_cycle(RefreshTrigger::Startup).await;
    assert_eq!(
        summary.outcome(Source::Priority),
        Some(SourceOutcome::Unavailable)
    );
    assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Updated));
    assert!(orchestrator.store().get(Source::Priority).is_none());
}

#[tokio::test]
async fn unrecognized_output_counts_as_a_failure() {
    let runner = FakeRunner::cluster();
    runner.script("scontrol", vec![Reply::Ok("State=IDLE CPUTot=4\n".to_string())]);
    let (orchestrator, _runner, mut rx) = start(runner, no_retries());

    let summary = orchestrator.run_cycle(RefreshTrigger::Startup).await;
    assert_eq!(summary.outcome(Source::Nodes), Some(SourceOutcome::Failed));
    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        RefreshEvent::Failed { source: Source::Nodes, message }
            if message.contains("output not recognized")
    )));
}

#[tokio::test]
async fn aggregates_follow_nodes_and_queue() {
    let (orchestrator, _runner, mut rx) = start(FakeRunner::cluster(), no_retries());
    orchestrator.run_cycle(RefreshTrigger::Startup).await;

    let aggregates = orchestrator.store().aggregates().expect("aggregates");
    assert_eq!(aggregates.cluster.total_nodes, 2);
    assert_eq!(aggregates.cluster.total_cpus, 256);
    assert_eq!(aggregates.cluster.running_jobs, 1);
    assert_eq!(aggregates.cluster.pending_jobs, 4);
    assert_eq!(aggregates.users.len(), 1);
    assert_eq!(aggregates.users[0].username, "ada");
    assert_eq!(aggregates.pending_users[0].username, "bob");

    let events = drain(&mut rx);
    let last_aggregate = events
        .iter()
        .rev()
        .find_map(|event| match event {
            RefreshEvent::AggregatesReady { aggregates, .. } => Some(aggregates.clone()),
            _ => None,
        })
        .expect("aggregate event");
    assert_eq!(last_aggregate.cluster, aggregates.cluster);

    let jobs = orchestrator.store().get(Source::Jobs).expect("user jobs");
    let Snapshot::Jobs(rows) = &jobs.snapshot else {
        panic!("jobs source holds a jobs snapshot");
    };
    assert_eq!(rows.len(), 2);
    assert!(matches!(
        events.last(),
        Some(RefreshEvent::CycleComplete(summary)) if summary.cycle == 1
    ));
}
