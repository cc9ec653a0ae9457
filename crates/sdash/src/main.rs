mod app;
mod logging;
mod settings;
mod ui;

use anyhow::Context;
use app::{ActionOutcome, App, AppAction};
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use sdash_refresh::{
    cancel_job, job_detail, node_detail, ClusterAggregates, CycleSummary, Orchestrator, RefreshControl,
    RefreshEvent, RefreshTrigger, Source, StateStore, SystemRunner, EVENT_QUEUE_CAPACITY,
};
use serde::Serialize;
use settings::{load_config, Args, Config};
use std::{collections::BTreeMap, io, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const ACTION_QUEUE_CAPACITY: usize = 16;
const UI_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("loading configuration")?;
    let log_guard = logging::init_logging(&config);
    for note in &config.notes {
        warn!(event = "config_clamped", note = %note);
    }
    info!(
        event = "startup",
        user = %config.user,
        interval_secs = config.refresh.refresh_interval_secs,
        config = %config.config_path.display(),
        log = ?log_guard.as_ref().and_then(|guard| guard.path.as_ref()),
    );

    let runner = Arc::new(SystemRunner::new());
    let store = Arc::new(StateStore::new());
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let orchestrator = Orchestrator::new(
        Arc::clone(&runner),
        store,
        config.refresh.clone(),
        config.user.clone(),
        events_tx,
    );

    if config.once {
        return run_once(orchestrator, events_rx).await;
    }
    run_dashboard(&config, runner, orchestrator, events_rx).await
}

#[derive(Serialize)]
struct OnceReport {
    summary: CycleSummary,
    aggregates: Option<ClusterAggregates>,
    rows: BTreeMap<&'static str, usize>,
    errors: Vec<String>,
}

/// Runs a single cycle and prints what it gathered as JSON.
async fn run_once(
    orchestrator: Orchestrator<SystemRunner>,
    mut events_rx: mpsc::Receiver<RefreshEvent>,
) -> anyhow::Result<()> {
    let drain = tokio::spawn(async move {
        let mut errors = Vec::new();
        while let Some(event) = events_rx.recv().await {
            match event {
                RefreshEvent::Failed { source, message } => {
                    errors.push(format!("{source}: {message}"));
                }
                RefreshEvent::Unavailable { source, program } => {
                    errors.push(format!("{source}: {program} not found"));
                }
                _ => {}
            }
        }
        errors
    });

    orchestrator.check_programs().await;
    let summary = orchestrator.run_cycle(RefreshTrigger::Startup).await;
    let store = Arc::clone(orchestrator.store());
    drop(orchestrator);
    let errors = drain.await.context("event drain task")?;

    let rows = Source::ALL
        .iter()
        .filter_map(|source| {
            store
                .get(*source)
                .map(|cached| (source.as_str(), cached.snapshot.row_count()))
        })
        .collect();
    let report = OnceReport {
        summary,
        aggregates: store.aggregates().map(|aggregates| (*aggregates).clone()),
        rows,
        errors,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_dashboard(
    config: &Config,
    runner: Arc<SystemRunner>,
    orchestrator: Orchestrator<SystemRunner>,
    events_rx: mpsc::Receiver<RefreshEvent>,
) -> anyhow::Result<()> {
    let (control_tx, control_rx) = mpsc::channel(8);
    let refresh_task = tokio::spawn(orchestrator.clone().run(control_rx));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(
        &mut terminal,
        App::new(config.user.clone()).with_power_model(config.power.clone()),
        runner,
        &orchestrator,
        &control_tx,
        events_rx,
    )
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = control_tx.send(RefreshControl::Shutdown).await {
        warn!(event = "refresh_loop_gone", error = %err);
    }
    if let Err(err) = refresh_task.await {
        warn!(event = "refresh_task_failed", error = %err);
    }
    info!(event = "shutdown");
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut app: App,
    runner: Arc<SystemRunner>,
    orchestrator: &Orchestrator<SystemRunner>,
    control_tx: &mpsc::Sender<RefreshControl>,
    mut events_rx: mpsc::Receiver<RefreshEvent>,
) -> anyhow::Result<()> {
    let (action_tx, mut action_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
    let mut input = EventStream::new();
    let mut ticker = tokio::time::interval(UI_TICK);

    loop {
        terminal.draw(|frame| ui::render(frame, &app))?;
        let action = tokio::select! {
            _ = ticker.tick() => None,
            Some(event) = events_rx.recv() => {
                app.apply_event(event);
                None
            }
            Some(outcome) = action_rx.recv() => {
                let cancelled = matches!(outcome, ActionOutcome::Cancelled(_));
                app.apply_action_outcome(outcome);
                cancelled.then_some(AppAction::Refresh)
            }
            maybe_event = input.next() => match maybe_event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => app.handle_key(key),
                Some(Err(err)) => {
                    error!(event = "terminal_input_error", error = %err);
                    Some(AppAction::Quit)
                }
                None => Some(AppAction::Quit),
                _ => None,
            }
        };

        match action {
            None => {}
            Some(AppAction::Quit) => break,
            Some(AppAction::Refresh) => {
                if control_tx.send(RefreshControl::Manual).await.is_err() {
                    warn!(event = "refresh_loop_gone");
                }
            }
            Some(AppAction::ViewChanged { table, reordered }) => {
                orchestrator.set_view_reordered(table, reordered);
            }
            Some(AppAction::CancelJob(job_id)) => {
                spawn_action(&runner, &action_tx, job_id, SchedulerAction::Cancel);
            }
            Some(AppAction::ShowDetail(job_id)) => {
                spawn_action(&runner, &action_tx, job_id, SchedulerAction::Detail);
            }
            Some(AppAction::ShowNode(name)) => {
                spawn_action(&runner, &action_tx, name, SchedulerAction::Node);
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
enum SchedulerAction {
    Cancel,
    Detail,
    Node,
}

/// Runs a scheduler action off the event loop and reports back on `tx`.
///
/// `target` is a job id, or a node name for [`SchedulerAction::Node`].
fn spawn_action(
    runner: &Arc<SystemRunner>,
    tx: &mpsc::Sender<ActionOutcome>,
    target: String,
    action: SchedulerAction,
) {
    let runner = Arc::clone(runner);
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = match action {
            SchedulerAction::Cancel => cancel_job(runner.as_ref(), &target)
                .await
                .map(|()| ActionOutcome::Cancelled(target.clone())),
            SchedulerAction::Detail => job_detail(runner.as_ref(), &target)
                .await
                .map(ActionOutcome::Detail),
            SchedulerAction::Node => node_detail(runner.as_ref(), &target)
                .await
                .map(ActionOutcome::NodeDetail),
        };
        let outcome = result.unwrap_or_else(|err| {
            warn!(event = "scheduler_action_failed", action = ?action, target = %target, error = %err);
            let label = match action {
                SchedulerAction::Node => format!("node {target}"),
                SchedulerAction::Cancel | SchedulerAction::Detail => format!("job {target}"),
            };
            ActionOutcome::Failed {
                target: label,
                message: err.to_string(),
            }
        });
        deliver(&tx, outcome).await;
    });
}

/// Hands an action result to the event loop; false once the loop is gone.
async fn deliver(tx: &mpsc::Sender<ActionOutcome>, outcome: ActionOutcome) -> bool {
    match tx.send(outcome).await {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "action_outcome_dropped", outcome = ?err.0);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outcomes_after_the_loop_exits_are_dropped() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(deliver(&tx, ActionOutcome::Cancelled("7".to_string())).await);
        assert!(matches!(rx.recv().await, Some(ActionOutcome::Cancelled(id)) if id == "7"));

        drop(rx);
        assert!(!deliver(&tx, ActionOutcome::Cancelled("8".to_string())).await);
    }
}
