//! Refresh machinery for the Slurm dashboard: subprocess runner, snapshot
//! store, per-source workers and one-shot job actions.

pub mod actions;
pub mod commands;
pub mod config;
pub mod orchestrator;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use actions::{
    cancel_job, job_detail, node_detail, ActionError, DetailSource, JobDetail, NodeDetail,
};
pub use config::RefreshConfig;
pub use orchestrator::{
    CycleSummary, FetchPhase, Orchestrator, RefreshControl, RefreshEvent, RefreshTrigger,
    SourceOutcome, EVENT_QUEUE_CAPACITY,
};
pub use runner::{CommandError, CommandRunner, SystemRunner};
pub use snapshot::{CachedSnapshot, ClusterAggregates, Snapshot, SnapshotDelta, Source, Table};
pub use store::StateStore;
