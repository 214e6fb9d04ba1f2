//! Identity-keyed engine pool with reference counting and idle eviction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::engine::{EngineBuilder, ExecutionEngine};
use crate::errors::{internal, Result, SqlGateError};
use crate::types::SessionConfig;

#[derive(Debug)]
struct PoolEntry {
    identity: String,
    /// Serializes construction per identity; unrelated identities build in
    /// parallel since each entry has its own cell.
    engine: OnceCell<Arc<dyn ExecutionEngine>>,
    refs: AtomicUsize,
    last_release: Mutex<Instant>,
}

impl PoolEntry {
    fn new(identity: &str) -> PoolEntry {
        PoolEntry {
            identity: identity.to_string(),
            engine: OnceCell::new(),
            refs: AtomicUsize::new(0),
            last_release: Mutex::new(Instant::now()),
        }
    }
}

/// A checked-out reference to a pooled engine.
///
/// Must be handed back through [`EngineCache::release`]; the pool entry is
/// never evicted while references are outstanding.
#[derive(Debug, Clone)]
pub struct EngineRef {
    entry: Arc<PoolEntry>,
}

impl EngineRef {
    pub fn identity(&self) -> &str {
        &self.entry.identity
    }

    pub fn engine(&self) -> Arc<dyn ExecutionEngine> {
        self.entry
            .engine
            .get()
            .expect("engine ref only handed out after construction")
            .clone()
    }
}

/// Pools one engine instance per client identity.
pub struct EngineCache {
    entries: DashMap<String, Arc<PoolEntry>>,
    builder: Arc<dyn EngineBuilder>,
}

impl EngineCache {
    pub fn new(builder: Arc<dyn EngineBuilder>) -> EngineCache {
        EngineCache {
            entries: DashMap::new(),
            builder,
        }
    }

    /// Get an engine for `identity`, constructing one if the pool has none.
    ///
    /// Concurrent acquisitions for the same identity collapse to a single
    /// construction. A failed construction leaves the entry empty so a later
    /// acquire can retry.
    pub async fn acquire(&self, identity: &str, config: &SessionConfig) -> Result<EngineRef> {
        loop {
            let entry = self
                .entries
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(PoolEntry::new(identity)))
                .value()
                .clone();

            entry
                .engine
                .get_or_try_init(|| async {
                    info!(%identity, "constructing engine");
                    self.builder.build(identity, config).await
                })
                .await
                .map_err(|source| SqlGateError::EngineInitializationFailed {
                    identity: identity.to_string(),
                    source,
                })?;

            entry.refs.fetch_add(1, Ordering::SeqCst);

            // The sweep may have evicted this entry between the map lookup
            // and the ref bump. Undo and retry against a fresh entry.
            match self.entries.get(identity) {
                Some(current) if Arc::ptr_eq(current.value(), &entry) => {
                    return Ok(EngineRef { entry });
                }
                _ => {
                    entry.refs.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            }
        }
    }

    /// Hand back a reference obtained from [`EngineCache::acquire`].
    ///
    /// At zero references the entry becomes eligible for idle eviction but
    /// is kept around so a new session for the same identity doesn't repay
    /// construction cost.
    pub fn release(&self, engine_ref: EngineRef) -> Result<()> {
        let entry = engine_ref.entry;
        let prev = entry
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| internal!("engine reference for '{}' released twice", entry.identity))?;
        if prev == 1 {
            *entry.last_release.lock() = Instant::now();
            debug!(identity = %entry.identity, "engine idle, eligible for eviction");
        }
        Ok(())
    }

    /// Evict zero-reference entries idle past `idle_timeout`.
    ///
    /// Entries with outstanding references are never touched.
    pub fn sweep(&self, idle_timeout: Duration) {
        self.entries.retain(|identity, entry| {
            if entry.refs.load(Ordering::SeqCst) > 0 {
                return true;
            }
            let keep = entry.last_release.lock().elapsed() <= idle_timeout;
            if !keep {
                info!(%identity, "evicting idle engine");
            }
            keep
        });
    }

    /// Outstanding reference count for an identity, if pooled.
    pub fn reference_count(&self, identity: &str) -> Option<usize> {
        self.entries
            .get(identity)
            .map(|e| e.refs.load(Ordering::SeqCst))
    }

    pub fn pooled_identities(&self) -> usize {
        self.entries.len()
    }
}
