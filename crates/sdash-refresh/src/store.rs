//! Last-known-good snapshots and per-source error flags.
//!
//! Every entry is an `Arc` swapped under a short write lock. Readers clone
//! the `Arc`, so a reader holds either the old snapshot or the new one.

use crate::snapshot::{CachedSnapshot, ClusterAggregates, Snapshot, Source};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct StateStore {
    snapshots: RwLock<HashMap<Source, Arc<CachedSnapshot>>>,
    errors: Mutex<HashSet<Source>>,
    aggregates: RwLock<Option<Arc<ClusterAggregates>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: Source) -> Option<Arc<CachedSnapshot>> {
        read(&self.snapshots).get(&source).cloned()
    }

    /// Stores `snapshot` under its own source and returns the entry it
    /// replaced.
    pub fn update(&self, snapshot: Snapshot) -> Option<Arc<CachedSnapshot>> {
        let entry = Arc::new(CachedSnapshot {
            fetched_at: Utc::now(),
            snapshot,
        });
        write(&self.snapshots).insert(entry.source(), entry)
    }

    /// Flags `source` as failing. True only on the transition into the
    /// error state.
    pub fn mark_error(&self, source: Source) -> bool {
        lock(&self.errors).insert(source)
    }

    pub fn mark_ok(&self, source: Source) {
        lock(&self.errors).remove(&source);
    }

    pub fn is_error(&self, source: Source) -> bool {
        lock(&self.errors).contains(&source)
    }

    pub fn clear_errors(&self) {
        lock(&self.errors).clear();
    }

    pub fn error_sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = lock(&self.errors).iter().copied().collect();
        sources.sort();
        sources
    }

    pub fn aggregates(&self) -> Option<Arc<ClusterAggregates>> {
        read(&self.aggregates).clone()
    }

    pub fn update_aggregates(&self, aggregates: ClusterAggregates) -> Option<Arc<ClusterAggregates>> {
        write(&self.aggregates).replace(Arc::new(aggregates))
    }
}

// Entries are whole `Arc`s; a poisoned lock still guards consistent data.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
