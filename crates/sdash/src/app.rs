//! Dashboard state, fed by refresh events and key presses.

use chrono::{DateTime, Utc};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use sdash_core::aggregate::{count_by_category, gpu_demand, merge_job_views};
use sdash_core::energy::{aggregate_energy, PowerModel, UserEnergyStats};
use sdash_core::{
    ClusterStats, GpuBreakdown, Job, JobCategory, JobHistory, NodeInfo, PartitionWaitStats,
    PriorityTables, RowDelta, TableRow, UserPendingStats, UserStats,
};
use sdash_refresh::{
    CycleSummary, JobDetail, NodeDetail, RefreshEvent, Snapshot, SnapshotDelta, Source, Table,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

pub const MAX_NOTIFICATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tab {
    Jobs,
    History,
    Nodes,
    Users,
    Priority,
    WaitTime,
}

impl Tab {
    pub const ALL: [Tab; 6] = [
        Tab::Jobs,
        Tab::History,
        Tab::Nodes,
        Tab::Users,
        Tab::Priority,
        Tab::WaitTime,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Tab::Jobs => "My Jobs",
            Tab::History => "History",
            Tab::Nodes => "Nodes",
            Tab::Users => "Users",
            Tab::Priority => "Priority",
            Tab::WaitTime => "Wait Times",
        }
    }

    fn index(self) -> usize {
        Tab::ALL.iter().position(|tab| *tab == self).unwrap_or(0)
    }

    pub fn next(self) -> Self {
        Tab::ALL[(self.index() + 1) % Tab::ALL.len()]
    }

    pub fn previous(self) -> Self {
        Tab::ALL[(self.index() + Tab::ALL.len() - 1) % Tab::ALL.len()]
    }
}

/// Work the event loop has to carry out for a key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    Quit,
    Refresh,
    ViewChanged { table: Table, reordered: bool },
    CancelJob(String),
    ShowDetail(String),
    ShowNode(String),
}

/// Result of a job or node action run off the event loop.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Cancelled(String),
    Detail(JobDetail),
    NodeDetail(NodeDetail),
    /// `target` names the job or node the action was for.
    Failed { target: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub at: DateTime<Utc>,
    pub level: NoteLevel,
    pub text: String,
}

pub struct App {
    pub user: String,
    pub tab: Tab,
    pub jobs: Vec<Job>,
    pub history: JobHistory,
    pub nodes: Vec<NodeInfo>,
    pub all_jobs: Vec<Job>,
    pub wait_times: Vec<PartitionWaitStats>,
    pub priority: PriorityTables,
    pub users: Vec<UserStats>,
    pub pending_users: Vec<UserPendingStats>,
    pub cluster: Option<ClusterStats>,
    pub updated_at: BTreeMap<Source, DateTime<Utc>>,
    pub failing: BTreeSet<Source>,
    pub unavailable: BTreeMap<Source, String>,
    pub last_cycle: Option<CycleSummary>,
    pub notifications: VecDeque<Notification>,
    pub selected: usize,
    selected_key: Option<String>,
    pub sort_jobs_by_cpus: bool,
    pub pending_cancel: Option<String>,
    pub detail: Option<JobDetail>,
    pub node_detail: Option<NodeDetail>,
    pub power: PowerModel,
    pub help_open: bool,
    pub rebuilds: u64,
}

impl App {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            tab: Tab::Jobs,
            jobs: Vec::new(),
            history: JobHistory::default(),
            nodes: Vec::new(),
            all_jobs: Vec::new(),
            wait_times: Vec::new(),
            priority: PriorityTables::default(),
            users: Vec::new(),
            pending_users: Vec::new(),
            cluster: None,
            updated_at: BTreeMap::new(),
            failing: BTreeSet::new(),
            unavailable: BTreeMap::new(),
            last_cycle: None,
            notifications: VecDeque::new(),
            selected: 0,
            selected_key: None,
            sort_jobs_by_cpus: false,
            pending_cancel: None,
            detail: None,
            node_detail: None,
            power: PowerModel::default(),
            help_open: false,
            rebuilds: 0,
        }
    }

    pub fn with_power_model(mut self, power: PowerModel) -> Self {
        self.power = power;
        self
    }

    /// My live jobs followed by finished ones from the last day.
    pub fn history_view(&self) -> Vec<Job> {
        merge_job_views(&self.jobs, &self.history.jobs)
    }

    /// `2 running, 1 pending` style summary of my live jobs.
    pub fn job_badges(&self) -> String {
        count_by_category(&self.jobs)
            .iter()
            .map(|(category, count)| format!("{count} {category}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// GPUs requested by every pending job on the cluster, arrays expanded.
    pub fn pending_gpu_demand(&self) -> GpuBreakdown {
        let pending: Vec<Job> = self
            .all_jobs
            .iter()
            .filter(|job| job.state.category() == JobCategory::Pending)
            .cloned()
            .collect();
        gpu_demand(&pending)
    }

    /// Estimated energy of my jobs in the history window.
    pub fn history_energy(&self) -> Option<UserEnergyStats> {
        aggregate_energy(&self.history.jobs, &self.power)
            .into_iter()
            .find(|stats| stats.username == self.user)
    }

    pub fn apply_event(&mut self, event: RefreshEvent) {
        match event {
            RefreshEvent::DataReady {
                source,
                snapshot,
                delta,
                fetched_at,
            } => {
                self.updated_at.insert(source, fetched_at);
                self.failing.remove(&source);
                self.apply_snapshot(snapshot, delta);
                self.restore_selection();
            }
            RefreshEvent::AggregatesReady {
                aggregates,
                users_delta,
                pending_delta,
            } => {
                self.cluster = Some(aggregates.cluster);
                self.rebuilds += u64::from(sync_rows(&mut self.users, &users_delta, aggregates.users));
                self.rebuilds += u64::from(sync_rows(
                    &mut self.pending_users,
                    &pending_delta,
                    aggregates.pending_users,
                ));
                self.restore_selection();
            }
            RefreshEvent::Failed { source, message } => {
                self.failing.insert(source);
                self.notify(NoteLevel::Error, format!("{source}: {message}"));
            }
            RefreshEvent::Unavailable { source, program } => {
                self.notify(
                    NoteLevel::Warn,
                    format!("{source} unavailable: {program} not found"),
                );
                self.unavailable.insert(source, program);
            }
            RefreshEvent::CycleComplete(summary) => {
                debug!(
                    "cycle_applied: {} ({} rebuilds so far)",
                    summary.cycle, self.rebuilds
                );
                self.last_cycle = Some(summary);
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot, delta: SnapshotDelta) {
        let rebuilt = match (snapshot, delta) {
            (Snapshot::Jobs(rows), SnapshotDelta::Jobs(delta)) => {
                let rebuilt = sync_rows(&mut self.jobs, &delta, rows);
                if self.sort_jobs_by_cpus {
                    sort_by_cpus(&mut self.jobs);
                }
                rebuilt
            }
            (Snapshot::History(history), SnapshotDelta::History(delta)) => {
                let JobHistory {
                    jobs,
                    total_jobs,
                    total_requeues,
                    max_requeues,
                } = history;
                self.history.total_jobs = total_jobs;
                self.history.total_requeues = total_requeues;
                self.history.max_requeues = max_requeues;
                sync_rows(&mut self.history.jobs, &delta, jobs)
            }
            (Snapshot::Nodes(rows), SnapshotDelta::Nodes(delta)) => {
                sync_rows(&mut self.nodes, &delta, rows)
            }
            (Snapshot::AllJobs(rows), SnapshotDelta::AllJobs(delta)) => {
                sync_rows(&mut self.all_jobs, &delta, rows)
            }
            (Snapshot::WaitTime(rows), SnapshotDelta::WaitTime(delta)) => {
                sync_rows(&mut self.wait_times, &delta, rows)
            }
            (
                Snapshot::Priority(tables),
                SnapshotDelta::Priority {
                    users,
                    accounts,
                    jobs,
                },
            ) => {
                let a = sync_rows(&mut self.priority.users, &users, tables.users);
                let b = sync_rows(&mut self.priority.accounts, &accounts, tables.accounts);
                let c = sync_rows(&mut self.priority.jobs, &jobs, tables.jobs);
                a || b || c
            }
            (snapshot, _) => {
                warn!("delta_mismatch: {} replaced whole", snapshot.source());
                self.replace_snapshot(snapshot);
                true
            }
        };
        self.rebuilds += u64::from(rebuilt);
    }

    fn replace_snapshot(&mut self, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Jobs(rows) => self.jobs = rows,
            Snapshot::History(history) => self.history = history,
            Snapshot::Nodes(rows) => self.nodes = rows,
            Snapshot::AllJobs(rows) => self.all_jobs = rows,
            Snapshot::WaitTime(rows) => self.wait_times = rows,
            Snapshot::Priority(tables) => self.priority = tables,
        }
    }

    pub fn apply_action_outcome(&mut self, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Cancelled(job_id) => {
                self.notify(NoteLevel::Info, format!("job {job_id} cancelled"));
            }
            ActionOutcome::Detail(detail) => self.detail = Some(detail),
            ActionOutcome::NodeDetail(detail) => self.node_detail = Some(detail),
            ActionOutcome::Failed { target, message } => {
                self.notify(NoteLevel::Error, format!("{target}: {message}"));
            }
        }
    }

    pub fn notify(&mut self, level: NoteLevel, text: String) {
        self.notifications.push_back(Notification {
            at: Utc::now(),
            level,
            text,
        });
        while self.notifications.len() > MAX_NOTIFICATIONS {
            self.notifications.pop_front();
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Option<AppAction> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Some(AppAction::Quit);
        }
        if self.detail.is_some() || self.node_detail.is_some() {
            if matches!(key.code, KeyCode::Esc | KeyCode::Enter | KeyCode::Char('q')) {
                self.detail = None;
                self.node_detail = None;
            }
            return None;
        }
        if let Some(job_id) = self.pending_cancel.take() {
            if key.code == KeyCode::Char('y') {
                return Some(AppAction::CancelJob(job_id));
            }
            self.notify(NoteLevel::Info, format!("cancel of {job_id} aborted"));
            return None;
        }
        if matches!(key.code, KeyCode::Char('?') | KeyCode::F(1)) {
            self.help_open = !self.help_open;
            return None;
        }
        if self.help_open {
            if key.code == KeyCode::Esc {
                self.help_open = false;
            }
            return None;
        }

        match key.code {
            KeyCode::Char('q') => Some(AppAction::Quit),
            KeyCode::Char('r') => Some(AppAction::Refresh),
            KeyCode::Tab => {
                self.switch_tab(self.tab.next());
                None
            }
            KeyCode::BackTab => {
                self.switch_tab(self.tab.previous());
                None
            }
            KeyCode::Char(digit @ '1'..='6') => {
                let index = digit as usize - '1' as usize;
                self.switch_tab(Tab::ALL[index]);
                None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.move_selection(1);
                None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.move_selection(-1);
                None
            }
            KeyCode::Char('g') | KeyCode::Home => {
                self.select_index(0);
                None
            }
            KeyCode::Char('G') | KeyCode::End => {
                let last = self.current_keys().len().saturating_sub(1);
                self.select_index(last);
                None
            }
            KeyCode::Char('s') if self.tab == Tab::Jobs => {
                self.sort_jobs_by_cpus = !self.sort_jobs_by_cpus;
                if self.sort_jobs_by_cpus {
                    sort_by_cpus(&mut self.jobs);
                }
                self.restore_selection();
                Some(AppAction::ViewChanged {
                    table: Table::Jobs,
                    reordered: self.sort_jobs_by_cpus,
                })
            }
            KeyCode::Char('c') if matches!(self.tab, Tab::Jobs | Tab::History) => {
                let job = self.selected_job()?;
                if !job.state.is_active() {
                    self.notify(
                        NoteLevel::Info,
                        format!("job {} is {} and cannot be cancelled", job.job_id, job.state),
                    );
                    return None;
                }
                let job_id = job.job_id;
                self.notify(
                    NoteLevel::Warn,
                    format!("cancel job {job_id}? press y to confirm"),
                );
                self.pending_cancel = Some(job_id);
                None
            }
            KeyCode::Enter if self.tab == Tab::Nodes => self
                .nodes
                .get(self.selected)
                .map(|node| AppAction::ShowNode(node.name.clone())),
            KeyCode::Enter => self.selected_job_id().map(AppAction::ShowDetail),
            _ => None,
        }
    }

    fn switch_tab(&mut self, tab: Tab) {
        if self.tab != tab {
            self.tab = tab;
            self.selected = 0;
            self.selected_key = None;
            self.restore_selection();
        }
    }

    /// Keys of the rows in the table the cursor moves over.
    pub fn current_keys(&self) -> Vec<String> {
        match self.tab {
            Tab::Jobs => keys(&self.jobs),
            Tab::History => keys(&self.history_view()),
            Tab::Nodes => keys(&self.nodes),
            Tab::Users => keys(&self.users),
            Tab::Priority => keys(&self.priority.users),
            Tab::WaitTime => keys(&self.wait_times),
        }
    }

    pub fn selected_job(&self) -> Option<Job> {
        match self.tab {
            Tab::Jobs => self.jobs.get(self.selected).cloned(),
            Tab::History => self.history_view().into_iter().nth(self.selected),
            _ => None,
        }
    }

    pub fn selected_job_id(&self) -> Option<String> {
        self.selected_job().map(|job| job.job_id)
    }

    fn move_selection(&mut self, step: isize) {
        let target = self.selected.saturating_add_signed(step);
        self.select_index(target);
    }

    fn select_index(&mut self, index: usize) {
        let keys = self.current_keys();
        if keys.is_empty() {
            self.selected = 0;
            self.selected_key = None;
            return;
        }
        self.selected = index.min(keys.len() - 1);
        self.selected_key = keys.get(self.selected).cloned();
    }

    /// Keeps the cursor on the same row across updates; when that row is
    /// gone the cursor stays at the same position.
    fn restore_selection(&mut self) {
        let keys = self.current_keys();
        if let Some(position) = self
            .selected_key
            .as_ref()
            .and_then(|key| keys.iter().position(|candidate| candidate == key))
        {
            self.selected = position;
            return;
        }
        self.select_index(self.selected);
    }

    pub fn is_stale(&self, source: Source) -> bool {
        self.failing.contains(&source)
    }
}

/// Brings `rows` up to date: a full swap when the diff asks for a rebuild,
/// otherwise the delta is applied in place. True when rebuilt.
fn sync_rows<R: TableRow>(rows: &mut Vec<R>, delta: &RowDelta<R>, fresh: Vec<R>) -> bool {
    if delta.rebuild.is_some() {
        *rows = fresh;
        return true;
    }
    delta.apply_to(rows);
    false
}

fn sort_by_cpus(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.effective_cpus()
            .cmp(&a.effective_cpus())
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
}

fn keys<R: TableRow>(rows: &[R]) -> Vec<String> {
    rows.iter().map(TableRow::key).collect()
}
