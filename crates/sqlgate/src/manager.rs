//! Registry of active sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::EngineBuilder;
use crate::engine_cache::EngineCache;
use crate::errors::{Result, SqlGateError};
use crate::handle::{OperationHandle, ProtocolVersion, SessionHandle};
use crate::operations::OperationManager;
use crate::reaper::Reaper;
use crate::session::Session;
use crate::types::SessionConfig;

#[derive(Debug, Clone)]
pub struct SessionManagerOpts {
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// Idle time after which a session with no running operations is
    /// force-closed.
    pub session_idle_timeout: Duration,
    /// Grace period before a zero-reference engine is evicted.
    pub engine_idle_timeout: Duration,
    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
    /// Maximum operation lifetime for `operation_timed_out` checks.
    pub operation_timeout: Duration,
}

impl Default for SessionManagerOpts {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_idle_timeout: Duration::from_secs(30 * 60),
            engine_idle_timeout: Duration::from_secs(10 * 60),
            reaper_interval: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Owns every active session and the engine pool behind them.
///
/// All registries live on the manager instance; lifecycle is tied to its
/// construction and [`SessionManager::shutdown`], with no ambient globals.
pub struct SessionManager {
    opts: SessionManagerOpts,
    sessions: DashMap<Uuid, Arc<Session>>,
    /// Open-slot reservation; bumped before a session is constructed so the
    /// cap can't be raced past.
    session_count: AtomicUsize,
    engines: Arc<EngineCache>,
    ops: Arc<OperationManager>,
    reaper: OnceCell<Reaper>,
}

impl SessionManager {
    pub fn new(builder: Arc<dyn EngineBuilder>, opts: SessionManagerOpts) -> Arc<SessionManager> {
        Arc::new(SessionManager {
            opts,
            sessions: DashMap::new(),
            session_count: AtomicUsize::new(0),
            engines: Arc::new(EngineCache::new(builder)),
            ops: Arc::new(OperationManager::new()),
            reaper: OnceCell::new(),
        })
    }

    /// Open a new session bound to a pooled engine for `identity`.
    ///
    /// Fails with `TooManySessions` at the configured cap. The first
    /// successful open starts the background reaper for the manager's
    /// lifetime.
    pub async fn open_session(
        self: &Arc<Self>,
        protocol: ProtocolVersion,
        identity: impl Into<String>,
        client_addr: impl Into<String>,
        config: &SessionConfig,
    ) -> Result<SessionHandle> {
        self.session_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.opts.max_sessions).then_some(n + 1)
            })
            .map_err(|_| SqlGateError::TooManySessions(self.opts.max_sessions))?;

        let handle = SessionHandle::new(protocol);
        let session = Arc::new(Session::new(
            handle,
            identity,
            client_addr,
            self.engines.clone(),
            self.ops.clone(),
        ));
        if let Err(e) = session.open(config).await {
            self.session_count.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        self.sessions.insert(handle.id(), session);
        self.ensure_reaper();
        Ok(handle)
    }

    pub fn get_session(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        self.sessions
            .get(&handle.id())
            .map(|s| s.value().clone())
            .ok_or(SqlGateError::NoSuchSession(handle))
    }

    /// Close a session and remove it from the registry.
    ///
    /// Racing the reaper is safe: whichever removes the entry first performs
    /// the close, the other sees `NoSuchSession` / a no-op.
    pub async fn close_session(&self, handle: SessionHandle) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(&handle.id())
            .ok_or(SqlGateError::NoSuchSession(handle))?;
        self.session_count.fetch_sub(1, Ordering::SeqCst);
        session.close().await
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> &Arc<OperationManager> {
        &self.ops
    }

    pub fn engines(&self) -> &Arc<EngineCache> {
        &self.engines
    }

    /// Whether an operation has outlived the configured maximum lifetime.
    ///
    /// Detection only; a caller acting on it issues the cancel itself.
    pub fn operation_timed_out(&self, handle: OperationHandle) -> Result<bool> {
        Ok(self
            .ops
            .get_operation(handle)?
            .is_timed_out(self.opts.operation_timeout))
    }

    fn ensure_reaper(self: &Arc<Self>) {
        self.reaper
            .get_or_init(|| Reaper::start(Arc::downgrade(self), self.opts.reaper_interval));
    }

    /// One reaper pass over sessions and the engine pool.
    ///
    /// Sessions holding running operations are skipped regardless of idle
    /// time and re-checked on the next sweep.
    pub(crate) async fn sweep(&self) {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.last_access().elapsed() <= self.opts.session_idle_timeout {
                continue;
            }
            if session.has_running_operations() {
                debug!(session_id = %session.handle(), "idle session has running operations, skipping");
                continue;
            }
            expired.push(session.handle());
        }

        for handle in expired {
            if let Some((_, session)) = self.sessions.remove(&handle.id()) {
                self.session_count.fetch_sub(1, Ordering::SeqCst);
                info!(session_id = %handle, identity = %session.identity(), "evicting idle session");
                if let Err(e) = session.close().await {
                    warn!(session_id = %handle, %e, "failed to close idle session");
                }
            }
        }

        self.engines.sweep(self.opts.engine_idle_timeout);
    }

    /// Stop the reaper and close every remaining session.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.get() {
            reaper.close().await;
        }

        let handles: Vec<_> = self.sessions.iter().map(|e| e.value().handle()).collect();
        let mut closing = Vec::new();
        for handle in handles {
            if let Some((_, session)) = self.sessions.remove(&handle.id()) {
                self.session_count.fetch_sub(1, Ordering::SeqCst);
                closing.push(session);
            }
        }
        let results = future::join_all(closing.iter().map(|s| s.close())).await;
        for (session, result) in closing.iter().zip(results) {
            if let Err(e) = result {
                warn!(session_id = %session.handle(), %e, "failed to close session during shutdown");
            }
        }

        self.engines.sweep(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::engine::testutil::StubEngineBuilder;
    use crate::operation::OperationState;
    use crate::types::DispatchMode;

    fn quick_opts() -> SessionManagerOpts {
        SessionManagerOpts {
            max_sessions: 2,
            session_idle_timeout: Duration::from_millis(30),
            engine_idle_timeout: Duration::from_millis(10),
            reaper_interval: Duration::from_millis(10),
            operation_timeout: Duration::from_secs(60),
        }
    }

    fn proto() -> ProtocolVersion {
        ProtocolVersion(11)
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let manager = SessionManager::new(
            Arc::new(StubEngineBuilder::default()),
            SessionManagerOpts {
                max_sessions: 2,
                ..Default::default()
            },
        );
        let config = SessionConfig::new();

        let first = manager
            .open_session(proto(), "alice", "1.1.1.1:1", &config)
            .await
            .unwrap();
        manager
            .open_session(proto(), "bob", "1.1.1.1:2", &config)
            .await
            .unwrap();

        let err = manager
            .open_session(proto(), "carol", "1.1.1.1:3", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, SqlGateError::TooManySessions(2)));

        // Closing frees a slot.
        manager.close_session(first).await.unwrap();
        manager
            .open_session(proto(), "carol", "1.1.1.1:3", &config)
            .await
            .unwrap();
        assert_eq!(2, manager.session_count());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_open_releases_its_slot() {
        let builder = StubEngineBuilder::default();
        builder.fail_first.store(1, Ordering::SeqCst);
        let manager = SessionManager::new(
            Arc::new(builder),
            SessionManagerOpts {
                max_sessions: 1,
                ..Default::default()
            },
        );
        let config = SessionConfig::new();

        let err = manager
            .open_session(proto(), "alice", "1.1.1.1:1", &config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SqlGateError::EngineInitializationFailed { .. }
        ));
        assert_eq!(0, manager.session_count());

        manager
            .open_session(proto(), "alice", "1.1.1.1:1", &config)
            .await
            .unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn lookup_and_close_of_unknown_session_fail() {
        let manager =
            SessionManager::new(Arc::new(StubEngineBuilder::default()), Default::default());
        let unknown = SessionHandle::new(proto());

        assert!(matches!(
            manager.get_session(unknown).unwrap_err(),
            SqlGateError::NoSuchSession(_)
        ));
        assert!(matches!(
            manager.close_session(unknown).await.unwrap_err(),
            SqlGateError::NoSuchSession(_)
        ));
    }

    #[tokio::test]
    async fn reaper_evicts_idle_sessions_but_never_running_work() {
        logutil::init_for_tests();
        let release = Arc::new(Notify::new());
        let manager = SessionManager::new(
            Arc::new(StubEngineBuilder {
                engine_block: Some(release.clone()),
                ..Default::default()
            }),
            quick_opts(),
        );
        let config = SessionConfig::new();

        let handle = manager
            .open_session(proto(), "alice", "1.1.1.1:1", &config)
            .await
            .unwrap();
        let session = manager.get_session(handle).unwrap();

        let op = session
            .execute_statement("SELECT slow()", DispatchMode::Deferred)
            .await
            .unwrap();
        while session.operation_status(op).await.unwrap().state != OperationState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Far past the idle timeout, but in-flight work pins the session.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.get_session(handle).is_ok());

        release.notify_one();
        loop {
            let status = session.operation_status(op).await.unwrap();
            if status.state != OperationState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // With the operation finished the next sweeps may reclaim it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            manager.get_session(handle).unwrap_err(),
            SqlGateError::NoSuchSession(_)
        ));
        assert_eq!(0, manager.session_count());

        // The engine went idle and was evicted as well.
        assert_eq!(None, manager.engines().reference_count("alice"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let manager =
            SessionManager::new(Arc::new(StubEngineBuilder::default()), Default::default());
        let config = SessionConfig::new();
        for i in 0..3 {
            manager
                .open_session(proto(), format!("user-{i}"), "1.1.1.1:1", &config)
                .await
                .unwrap();
        }
        assert_eq!(3, manager.session_count());

        manager.shutdown().await;
        assert_eq!(0, manager.session_count());
        assert_eq!(0, manager.engines().pooled_identities());
    }
}
