//! Periodic refresh of every source on its own worker task.
//!
//! A cycle spawns one worker per idle source and joins them. Workers fetch
//! with retry, parse, store the snapshot, diff it against the previous one
//! and publish the result as a [`RefreshEvent`]. A source that is still
//! fetching when the next cycle starts is skipped for that cycle.
//!
//! Cycles started since the last manual refresh share one cancellation
//! token, so a manual refresh or shutdown stops all of them at once.

use crate::commands::{self, CommandSpec};
use crate::config::{next_backoff, RefreshConfig};
use crate::runner::{CommandError, CommandRunner};
use crate::snapshot::{
    diff_snapshots, ClusterAggregates, DiffContext, Snapshot, SnapshotDelta, Source, Table,
};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use sdash_core::aggregate::{
    aggregate_pending_user_stats, aggregate_user_stats, cluster_stats, running_jobs,
};
use sdash_core::priority::build_priority_tables;
use sdash_core::{diff, Job, JobPriority, NodeInfo, RowDelta, UserPendingStats, UserStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPhase {
    #[default]
    Idle,
    Fetching,
    Succeeded,
    Failed,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Startup,
    Periodic,
    Manual,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::Startup => "startup",
            RefreshTrigger::Periodic => "periodic",
            RefreshTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    Updated,
    Failed,
    /// A previous fetch of the source was still running.
    Skipped,
    Unavailable,
}

/// Messages from the consumer to a running [`Orchestrator::run`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshControl {
    Manual,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub trigger: RefreshTrigger,
    pub cancelled: bool,
    pub outcomes: BTreeMap<Source, SourceOutcome>,
}

impl CycleSummary {
    pub fn outcome(&self, source: Source) -> Option<SourceOutcome> {
        self.outcomes.get(&source).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RefreshEvent {
    DataReady {
        source: Source,
        snapshot: Snapshot,
        delta: SnapshotDelta,
        fetched_at: DateTime<Utc>,
    },
    AggregatesReady {
        aggregates: ClusterAggregates,
        users_delta: RowDelta<UserStats>,
        pending_delta: RowDelta<UserPendingStats>,
    },
    /// Sent once when a source enters the error state.
    Failed { source: Source, message: String },
    Unavailable { source: Source, program: String },
    CycleComplete(CycleSummary),
}

pub struct Orchestrator<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<R> {
    runner: Arc<R>,
    store: Arc<StateStore>,
    config: RefreshConfig,
    user: String,
    events: mpsc::Sender<RefreshEvent>,
    phases: Mutex<HashMap<Source, FetchPhase>>,
    reordered: Mutex<HashSet<Table>>,
    // Held from aggregate recomputation until its event is queued, so
    // aggregate deltas reach the consumer in the order they were diffed.
    aggregate_lock: AsyncMutex<()>,
    cycles: AtomicU64,
    // Cancellation is checked between retries and during backoff; a command
    // already running is not killed.
    current_cancel: Mutex<CancellationToken>,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(
        runner: Arc<R>,
        store: Arc<StateStore>,
        config: RefreshConfig,
        user: impl Into<String>,
        events: mpsc::Sender<RefreshEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                store,
                config,
                user: user.into(),
                events,
                phases: Mutex::new(HashMap::new()),
                reordered: Mutex::new(HashSet::new()),
                aggregate_lock: AsyncMutex::new(()),
                cycles: AtomicU64::new(0),
                current_cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.shared.store
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.shared.config
    }

    pub fn phase(&self, source: Source) -> FetchPhase {
        lock(&self.shared.phases)
            .get(&source)
            .copied()
            .unwrap_or_default()
    }

    /// Tells the diff step whether the consumer shows `table` in an order
    /// other than the source order.
    pub fn set_view_reordered(&self, table: Table, reordered: bool) {
        let mut tables = lock(&self.shared.reordered);
        if reordered {
            tables.insert(table);
        } else {
            tables.remove(&table);
        }
    }

    /// Resolves every program each source needs. Sources with a missing
    /// program are marked unavailable for the rest of the process.
    pub async fn check_programs(&self) -> Vec<Source> {
        let mut unavailable = Vec::new();
        for source in Source::ALL {
            let missing = source
                .programs()
                .iter()
                .find(|program| self.shared.runner.resolve(program).is_none());
            if let Some(program) = missing {
                warn!(event = "source_unavailable", source = %source, program = *program);
                self.set_phase(source, FetchPhase::Unavailable);
                self.publish(RefreshEvent::Unavailable {
                    source,
                    program: program.to_string(),
                })
                .await;
                unavailable.push(source);
            }
        }
        unavailable
    }

    /// Cancels the cycle in flight and clears error flags so the next
    /// failure of any source notifies again.
    pub fn prepare_manual_refresh(&self) {
        self.cancel_current();
        self.shared.store.clear_errors();
        info!(event = "manual_refresh_requested");
    }

    /// Cancels every cycle started since the last cancellation. Later
    /// cycles get a fresh token.
    pub fn cancel_current(&self) {
        let previous = std::mem::replace(
            &mut *lock(&self.shared.current_cancel),
            CancellationToken::new(),
        );
        previous.cancel();
    }

    /// Runs one refresh cycle to completion and publishes its summary.
    pub async fn run_cycle(&self, trigger: RefreshTrigger) -> CycleSummary {
        let cycle = self.shared.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = lock(&self.shared.current_cancel).clone();
        debug!(event = "refresh_cycle_start", cycle, trigger = trigger.as_str());

        let mut outcomes = BTreeMap::new();
        let mut handles = Vec::new();
        for source in Source::ALL {
            if let Err(phase) = self.try_begin(source) {
                let outcome = if phase == FetchPhase::Unavailable {
                    SourceOutcome::Unavailable
                } else {
                    debug!("source_skipped: {source} still fetching");
                    SourceOutcome::Skipped
                };
                outcomes.insert(source, outcome);
                continue;
            }
            let worker = self.clone();
            let token = cancel.clone();
            handles.push((
                source,
                tokio::spawn(async move { worker.refresh_source(source, &token).await }),
            ));
        }

        for (source, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(event = "source_worker_panicked", source = %source, error = %err);
                    self.set_phase(source, FetchPhase::Failed);
                    if self.shared.store.mark_error(source) {
                        self.publish(RefreshEvent::Failed {
                            source,
                            message: format!("worker aborted: {err}"),
                        })
                        .await;
                    }
                    SourceOutcome::Failed
                }
            };
            outcomes.insert(source, outcome);
        }

        let summary = CycleSummary {
            cycle,
            trigger,
            cancelled: cancel.is_cancelled(),
            outcomes,
        };
        info!(
            event = "refresh_cycle_complete",
            cycle,
            trigger = trigger.as_str(),
            cancelled = summary.cancelled,
            errors = self.shared.store.error_sources().len()
        );
        self.publish(RefreshEvent::CycleComplete(summary.clone()))
            .await;
        summary
    }

    /// Checks programs, then refreshes on every tick of the configured
    /// interval until told to shut down or the control channel closes.
    pub async fn run(self, mut control: mpsc::Receiver<RefreshControl>) {
        self.check_programs().await;
        let mut ticker = tokio::time::interval(self.shared.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut trigger = RefreshTrigger::Startup;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_cycle(trigger);
                    trigger = RefreshTrigger::Periodic;
                }
                message = control.recv() => match message {
                    Some(RefreshControl::Manual) => {
                        self.prepare_manual_refresh();
                        self.spawn_cycle(RefreshTrigger::Manual);
                        ticker.reset();
                    }
                    Some(RefreshControl::Shutdown) | None => {
                        self.cancel_current();
                        info!(event = "refresh_shutdown");
                        break;
                    }
                }
            }
        }
    }

    fn spawn_cycle(&self, trigger: RefreshTrigger) {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_cycle(trigger).await;
        });
    }

    fn try_begin(&self, source: Source) -> Result<(), FetchPhase> {
        let mut phases = lock(&self.shared.phases);
        let phase = phases.entry(source).or_default();
        match *phase {
            FetchPhase::Fetching | FetchPhase::Unavailable => Err(*phase),
            _ => {
                *phase = FetchPhase::Fetching;
                Ok(())
            }
        }
    }

    fn set_phase(&self, source: Source, phase: FetchPhase) {
        lock(&self.shared.phases).insert(source, phase);
    }

    async fn refresh_source(&self, source: Source, cancel: &CancellationToken) -> SourceOutcome {
        match self.fetch(source, cancel).await {
            Ok(snapshot) => {
                self.publish_snapshot(snapshot).await;
                self.shared.store.mark_ok(source);
                self.set_phase(source, FetchPhase::Succeeded);
                SourceOutcome::Updated
            }
            Err(err) if err.is_fatal() => {
                warn!(event = "source_unavailable", source = %source, error = %err);
                self.set_phase(source, FetchPhase::Unavailable);
                self.publish(RefreshEvent::Unavailable {
                    source,
                    program: err.program().to_string(),
                })
                .await;
                SourceOutcome::Unavailable
            }
            Err(err) => {
                warn!(event = "source_refresh_failed", source = %source, error = %err);
                self.set_phase(source, FetchPhase::Failed);
                if self.shared.store.mark_error(source) {
                    self.publish(RefreshEvent::Failed {
                        source,
                        message: err.to_string(),
                    })
                    .await;
                }
                SourceOutcome::Failed
            }
        }
    }

    async fn fetch(&self, source: Source, cancel: &CancellationToken) -> Result<Snapshot, CommandError> {
        let shared = &self.shared;
        match source {
            Source::Jobs => {
                let raw = self
                    .run_with_retry(source, commands::user_jobs_command(&shared.user), cancel)
                    .await?;
                Ok(Snapshot::Jobs(commands::parse_job_output(&raw)?))
            }
            Source::History => {
                let raw = self
                    .run_with_retry(source, commands::history_command(&shared.user), cancel)
                    .await?;
                Ok(Snapshot::History(commands::parse_history_output(&raw)?))
            }
            Source::Nodes => {
                let raw = self
                    .run_with_retry(source, commands::nodes_command(), cancel)
                    .await?;
                Ok(Snapshot::Nodes(commands::parse_node_output(&raw)?))
            }
            Source::AllJobs => {
                let raw = self
                    .run_with_retry(source, commands::all_jobs_command(), cancel)
                    .await?;
                Ok(Snapshot::AllJobs(commands::parse_job_output(&raw)?))
            }
            Source::WaitTime => {
                let command = commands::wait_time_command(shared.config.wait_time_days);
                let raw = self.run_with_retry(source, command, cancel).await?;
                Ok(Snapshot::WaitTime(commands::parse_wait_time_output(&raw)?))
            }
            Source::Priority => {
                let raw = self
                    .run_with_retry(source, commands::fair_share_command(), cancel)
                    .await?;
                let entries = commands::parse_fair_share_output(&raw)?;
                let jobs = match self
                    .run_with_retry(source, commands::job_priority_command(), cancel)
                    .await
                    .and_then(|raw| commands::parse_job_priority_output(&raw))
                {
                    Ok(jobs) => jobs,
                    Err(err) => {
                        warn!("sprio_failed: keeping previous job priorities: {err}");
                        self.previous_job_priorities()
                    }
                };
                Ok(Snapshot::Priority(build_priority_tables(&entries, jobs)))
            }
        }
    }

    fn previous_job_priorities(&self) -> Vec<JobPriority> {
        match self.shared.store.get(Source::Priority).as_deref() {
            Some(entry) => match &entry.snapshot {
                Snapshot::Priority(tables) => tables.jobs.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    async fn run_with_retry(
        &self,
        source: Source,
        command: CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<String, CommandError> {
        let config = &self.shared.config;
        let timeout = config.timeout_for(source);
        let mut delay = config.initial_retry_delay();
        let mut attempt = 0;
        loop {
            let err = match self
                .shared
                .runner
                .run(command.program, &command.args, timeout)
                .await
            {
                Ok(raw) => return Ok(raw),
                Err(err) => err,
            };
            if err.is_fatal() || attempt >= config.max_retries {
                return Err(err);
            }
            if cancel.is_cancelled() {
                debug!("retry_abandoned: {source} cycle cancelled");
                return Err(err);
            }
            attempt += 1;
            debug!(
                event = "command_retry",
                source = %source,
                command = %command.display(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("retry_abandoned: {source} cancelled during backoff");
                    return Err(err);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_backoff(delay, config.retry_factor);
        }
    }

    async fn publish_snapshot(&self, snapshot: Snapshot) {
        let source = snapshot.source();
        let context = self.diff_context();
        let previous = self.shared.store.update(snapshot.clone());
        let delta = diff_snapshots(
            previous.as_deref().map(|entry| &entry.snapshot),
            &snapshot,
            &context,
        );
        let fetched_at = self
            .shared
            .store
            .get(source)
            .map(|entry| entry.fetched_at)
            .unwrap_or_else(Utc::now);
        debug!(
            event = "source_updated",
            source = %source,
            rows = snapshot.row_count(),
            rebuild = delta.rebuild().map(|reason| reason.as_str()).unwrap_or("none")
        );
        self.publish(RefreshEvent::DataReady {
            source,
            snapshot,
            delta,
            fetched_at,
        })
        .await;

        if source.feeds_aggregates() {
            let _order = self.shared.aggregate_lock.lock().await;
            let event = self.recompute_aggregates(&context);
            self.publish(event).await;
        }
    }

    /// Callers hold `aggregate_lock` until the returned event is published.
    fn recompute_aggregates(&self, context: &DiffContext) -> RefreshEvent {
        let store = &self.shared.store;
        let nodes = store.get(Source::Nodes);
        let all_jobs = store.get(Source::AllJobs);
        let node_rows: &[NodeInfo] = match nodes.as_deref().map(|entry| &entry.snapshot) {
            Some(Snapshot::Nodes(rows)) => rows.as_slice(),
            _ => &[],
        };
        let job_rows: Option<&[Job]> = match all_jobs.as_deref().map(|entry| &entry.snapshot) {
            Some(Snapshot::AllJobs(rows)) => Some(rows.as_slice()),
            _ => None,
        };

        let aggregates = ClusterAggregates {
            cluster: cluster_stats(node_rows, job_rows),
            users: aggregate_user_stats(&job_rows.map(running_jobs).unwrap_or_default()),
            pending_users: job_rows
                .map(aggregate_pending_user_stats)
                .unwrap_or_default(),
            computed_at: Utc::now(),
        };
        let previous = store.update_aggregates(aggregates.clone());
        let old_users: &[UserStats] = previous
            .as_deref()
            .map_or(&[][..], |prior| prior.users.as_slice());
        let old_pending: &[UserPendingStats] = previous
            .as_deref()
            .map_or(&[][..], |prior| prior.pending_users.as_slice());
        let users_delta = diff(old_users, &aggregates.users, &context.policy(Table::Users));
        let pending_delta = diff(
            old_pending,
            &aggregates.pending_users,
            &context.policy(Table::PendingUsers),
        );
        RefreshEvent::AggregatesReady {
            aggregates,
            users_delta,
            pending_delta,
        }
    }

    fn diff_context(&self) -> DiffContext {
        DiffContext {
            churn_threshold: self.shared.config.churn_threshold,
            reordered: lock(&self.shared.reordered).clone(),
        }
    }

    async fn publish(&self, event: RefreshEvent) {
        if self.shared.events.send(event).await.is_err() {
            debug!("refresh_event_dropped: receiver closed");
        }
    }
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
