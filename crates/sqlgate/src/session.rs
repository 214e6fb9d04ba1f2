//! Per-client logical connections.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine_cache::{EngineCache, EngineRef};
use crate::errors::{internal, Result, SqlGateError};
use crate::handle::{OperationHandle, SessionHandle};
use crate::operation::{OperationState, OperationStatus};
use crate::operations::OperationManager;
use crate::types::{DispatchMode, FetchOrientation, InfoKind, RowSet, Schema, SessionConfig};

/// Name reported for `InfoKind::ServerName`.
const SERVER_NAME: &str = "sqlgate";

/// Serializes state-mutating session calls and tracks the two activity
/// clocks.
///
/// Plain acquisitions stamp last-access (ordinary query activity, feeds the
/// reaper's idleness check); admin acquisitions stamp last-idle so
/// housekeeping doesn't keep a session artificially alive. Guards are RAII
/// so release happens on every exit path, and they are never held across a
/// statement execution.
#[derive(Debug)]
struct SessionGate {
    lock: tokio::sync::Mutex<()>,
    last_access: Mutex<Instant>,
    last_idle: Mutex<Instant>,
}

impl SessionGate {
    fn new() -> SessionGate {
        let now = Instant::now();
        SessionGate {
            lock: tokio::sync::Mutex::new(()),
            last_access: Mutex::new(now),
            last_idle: Mutex::new(now),
        }
    }

    async fn acquire(&self, admin: bool) -> tokio::sync::MutexGuard<'_, ()> {
        let guard = self.lock.lock().await;
        if admin {
            *self.last_idle.lock() = Instant::now();
        } else {
            *self.last_access.lock() = Instant::now();
        }
        guard
    }
}

/// A logical, authenticated connection through which a client issues
/// operations.
pub struct Session {
    handle: SessionHandle,
    identity: String,
    client_addr: String,
    created_at: Instant,
    gate: SessionGate,
    operations: Mutex<HashSet<OperationHandle>>,
    engine: Mutex<Option<EngineRef>>,
    cache: Arc<EngineCache>,
    ops: Arc<OperationManager>,
    scratch_dir: Mutex<Option<PathBuf>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("identity", &self.identity)
            .field("client_addr", &self.client_addr)
            .field("created_at", &self.created_at)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        handle: SessionHandle,
        identity: impl Into<String>,
        client_addr: impl Into<String>,
        cache: Arc<EngineCache>,
        ops: Arc<OperationManager>,
    ) -> Session {
        Session {
            handle,
            identity: identity.into(),
            client_addr: client_addr.into(),
            created_at: Instant::now(),
            gate: SessionGate::new(),
            operations: Mutex::new(HashSet::new()),
            engine: Mutex::new(None),
            cache,
            ops,
            scratch_dir: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_access(&self) -> Instant {
        *self.gate.last_access.lock()
    }

    pub fn last_idle(&self) -> Instant {
        *self.gate.last_idle.lock()
    }

    pub fn operation_handles(&self) -> Vec<OperationHandle> {
        self.operations.lock().iter().copied().collect()
    }

    /// Whether any operation owned by this session is currently running.
    ///
    /// Used by the reaper; never kills in-flight work.
    pub fn has_running_operations(&self) -> bool {
        self.operations.lock().iter().any(|handle| {
            self.ops
                .get_operation(*handle)
                .map(|op| op.state() == OperationState::Running)
                .unwrap_or(false)
        })
    }

    /// Bind and prepare the pooled engine for this session's identity.
    pub async fn open(&self, config: &SessionConfig) -> Result<()> {
        let _guard = self.gate.acquire(false).await;

        let engine_ref = self.cache.acquire(&self.identity, config).await?;
        if let Err(source) = engine_ref.engine().prepare(&self.identity).await {
            // Hand the reference straight back; the entry stays pooled for
            // the next attempt.
            let _ = self.cache.release(engine_ref);
            return Err(SqlGateError::EngineInitializationFailed {
                identity: self.identity.clone(),
                source,
            });
        }
        *self.engine.lock() = Some(engine_ref);

        let base = config
            .get("scratch_path")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let dir = base.join(format!("sqlgate-session-{}", self.handle.id()));
        match std::fs::create_dir_all(&dir) {
            Ok(()) => *self.scratch_dir.lock() = Some(dir),
            Err(e) => warn!(%e, path = %dir.display(), "failed to create session scratch directory"),
        }

        info!(session_id = %self.handle, identity = %self.identity, "session opened");
        Ok(())
    }

    /// Create an operation for `statement` and dispatch it.
    ///
    /// Sync mode blocks until the operation reaches a terminal state;
    /// deferred mode returns immediately and the caller polls. Either way
    /// the gate is dropped before execution starts so status polls and
    /// cancels on this session aren't starved by a long-running statement.
    pub async fn execute_statement(
        &self,
        statement: impl Into<String>,
        mode: DispatchMode,
    ) -> Result<OperationHandle> {
        let (op, engine) = {
            let _guard = self.gate.acquire(false).await;
            self.check_open()?;
            let engine = self.bound_engine()?;
            let op = self
                .ops
                .new_execute_statement_operation(self.handle, statement);
            self.operations.lock().insert(op.handle());
            (op, engine)
        };

        match mode {
            DispatchMode::Sync => op.execute(engine).await?,
            DispatchMode::Deferred => {
                let deferred = op.clone();
                tokio::spawn(async move {
                    if let Err(e) = deferred.execute(engine).await {
                        debug!(operation_id = %deferred.handle(), %e, "deferred execution not started");
                    }
                });
            }
        }
        Ok(op.handle())
    }

    pub async fn operation_status(&self, handle: OperationHandle) -> Result<OperationStatus> {
        let _guard = self.gate.acquire(false).await;
        self.ops.get_operation_status(handle)
    }

    pub async fn cancel_operation(&self, handle: OperationHandle) -> Result<()> {
        let _guard = self.gate.acquire(false).await;
        self.ops.cancel_operation(handle)
    }

    /// Close one operation and forget its handle.
    pub async fn close_operation(&self, handle: OperationHandle) -> Result<()> {
        let _guard = self.gate.acquire(false).await;
        self.operations.lock().remove(&handle);
        self.ops.close_operation(handle)
    }

    pub async fn fetch_results(
        &self,
        handle: OperationHandle,
        orientation: FetchOrientation,
        max_rows: usize,
    ) -> Result<RowSet> {
        let _guard = self.gate.acquire(false).await;
        self.ops
            .get_operation_next_row_set(handle, orientation, max_rows)
    }

    pub async fn fetch_log(
        &self,
        handle: OperationHandle,
        orientation: FetchOrientation,
        max_rows: usize,
    ) -> Result<RowSet> {
        let _guard = self.gate.acquire(false).await;
        self.ops
            .get_operation_log_row_set(handle, orientation, max_rows)
    }

    pub async fn result_schema(&self, handle: OperationHandle) -> Result<Schema> {
        let _guard = self.gate.acquire(false).await;
        self.ops.get_result_set_schema(handle)
    }

    /// Static or engine-derived session metadata.
    pub async fn get_info(&self, kind: InfoKind) -> Result<String> {
        let _guard = self.gate.acquire(false).await;
        self.check_open()?;
        match kind {
            InfoKind::ServerName => Ok(SERVER_NAME.to_string()),
            InfoKind::EngineName => Ok(self.bound_engine()?.name().to_string()),
            InfoKind::EngineVersion => Ok(self.bound_engine()?.version().to_string()),
            InfoKind::Other(kind) => Err(SqlGateError::UnrecognizedInfoKind(kind)),
        }
    }

    /// Close the session: every owned operation is closed, session scratch
    /// state is removed best-effort, and the engine reference is released
    /// last. Idempotent; racing closes (client vs. reaper) collapse to one.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.gate.acquire(true).await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session_id = %self.handle, identity = %self.identity, "closing session");

        let handles: Vec<_> = {
            let mut operations = self.operations.lock();
            operations.drain().collect()
        };
        for handle in handles {
            if let Err(e) = self.ops.close_operation(handle) {
                debug!(operation_id = %handle, %e, "operation already gone during session close");
            }
        }

        if let Some(dir) = self.scratch_dir.lock().take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(%e, path = %dir.display(), "failed to remove session scratch directory");
            }
        }

        // Final release step; unlike the cleanup above, a failure here
        // propagates.
        let engine_ref = self.engine.lock().take();
        if let Some(engine_ref) = engine_ref {
            self.cache
                .release(engine_ref)
                .map_err(|e| SqlGateError::ResourceCleanupFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SqlGateError::NoSuchSession(self.handle));
        }
        Ok(())
    }

    fn bound_engine(&self) -> Result<Arc<dyn crate::engine::ExecutionEngine>> {
        let engine = self.engine.lock();
        match engine.as_ref() {
            Some(engine_ref) => Ok(engine_ref.engine()),
            None => Err(internal!("session {} has no bound engine", self.handle)),
        }
    }
}
