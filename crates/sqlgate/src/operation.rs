//! Single-statement operation state machine.
//!
//! States move `Initialized -> Running -> {Finished, Canceled, Error}` with
//! `Closed` reachable from everywhere. Every transition is one atomic
//! compare-and-set; when cancellation races natural completion the loser's
//! transition simply doesn't commit.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{EngineError, EngineOutput, ExecutionEngine, Interrupt};
use crate::errors::{Result, SqlGateError};
use crate::handle::{OperationHandle, OperationType, SessionHandle};
use crate::statement::{self, StatementPlan};
use crate::types::{FetchOrientation, Row, RowSet, Schema};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Initialized = 0,
    Running = 1,
    Finished = 2,
    Canceled = 3,
    Error = 4,
    Closed = 5,
}

impl OperationState {
    fn from_u8(v: u8) -> OperationState {
        match v {
            0 => OperationState::Initialized,
            1 => OperationState::Running,
            2 => OperationState::Finished,
            3 => OperationState::Canceled,
            4 => OperationState::Error,
            _ => OperationState::Closed,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Initialized => "INITIALIZED",
            OperationState::Running => "RUNNING",
            OperationState::Finished => "FINISHED",
            OperationState::Canceled => "CANCELED",
            OperationState::Error => "ERROR",
            OperationState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Snapshot of an operation's progress for status polls.
#[derive(Debug, Clone)]
pub struct OperationStatus {
    pub state: OperationState,
    pub error: Option<EngineError>,
    pub has_result_set: bool,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct OperationInner {
    error: Option<EngineError>,
    schema: Option<Schema>,
    rows: Vec<Row>,
    row_cursor: usize,
    logs: Vec<String>,
    log_cursor: usize,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

/// One statement's execution lifecycle.
#[derive(Debug)]
pub struct Operation {
    handle: OperationHandle,
    session: SessionHandle,
    statement: String,
    state: AtomicU8,
    has_result_set: AtomicBool,
    interrupt: Interrupt,
    inner: Mutex<OperationInner>,
}

impl Operation {
    pub(crate) fn new_execute_statement(
        session: SessionHandle,
        statement: impl Into<String>,
    ) -> Operation {
        Operation {
            handle: OperationHandle::new(OperationType::ExecuteStatement),
            session,
            statement: statement.into(),
            state: AtomicU8::new(OperationState::Initialized as u8),
            has_result_set: AtomicBool::new(false),
            interrupt: Interrupt::new(),
            inner: Mutex::new(OperationInner::default()),
        }
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.session
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed_or_canceled(&self) -> bool {
        matches!(
            self.state(),
            OperationState::Closed | OperationState::Canceled
        )
    }

    /// Whether the configured maximum lifetime has elapsed since start
    /// without the operation completing.
    ///
    /// Detection only; enforcement (a forced cancel) is up to the caller.
    pub fn is_timed_out(&self, max_lifetime: Duration) -> bool {
        let inner = self.inner.lock();
        match (inner.started_at, inner.completed_at) {
            (Some(started), None) => started.elapsed() > max_lifetime,
            _ => false,
        }
    }

    pub fn status(&self) -> OperationStatus {
        let inner = self.inner.lock();
        OperationStatus {
            state: self.state(),
            error: inner.error.clone(),
            has_result_set: self.has_result_set.load(Ordering::SeqCst),
            started_at: inner.started_at,
            completed_at: inner.completed_at,
        }
    }

    /// Single atomic state transition; fails without side effects when the
    /// current state isn't `from`.
    fn try_transition(&self, from: OperationState, to: OperationState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn append_log(&self, line: impl Into<String>) {
        self.inner.lock().logs.push(line.into());
    }

    /// Run the statement against the engine.
    ///
    /// An engine fault never surfaces here; it's captured into status so
    /// polling stays uniform. The returned error covers misuse only (e.g.
    /// executing an operation that already ran).
    pub async fn execute(&self, engine: Arc<dyn ExecutionEngine>) -> Result<()> {
        if !self.try_transition(OperationState::Initialized, OperationState::Running) {
            let current = self.state();
            if self.is_closed_or_canceled() {
                // Canceled before it ever ran; nothing to do.
                return Ok(());
            }
            return Err(SqlGateError::InvalidOperationState {
                current,
                expected: "INITIALIZED",
            });
        }

        {
            let mut inner = self.inner.lock();
            inner.started_at = Some(Instant::now());
            inner.logs.push(format!(
                "operation {} started: {}",
                self.handle, self.statement
            ));
        }

        let plan = StatementPlan::parse(&self.statement);
        if plan.is_empty() {
            // Empty statements are valid and complete trivially without
            // reaching the engine.
            self.complete(EngineOutput::default());
            return Ok(());
        }
        let plan = statement::rewrite_resources(&plan);

        match engine.execute(&plan, self.interrupt.clone()).await {
            Ok(output) => self.complete(output),
            Err(fault) => self.fail(fault),
        }
        Ok(())
    }

    fn complete(&self, output: EngineOutput) {
        if self.try_transition(OperationState::Running, OperationState::Finished) {
            self.has_result_set.store(true, Ordering::SeqCst);
            let mut inner = self.inner.lock();
            inner.schema = Some(output.schema);
            inner.rows = output.rows;
            inner.logs.extend(output.logs);
            inner.logs.push(format!("operation {} finished", self.handle));
            inner.completed_at = Some(Instant::now());
        } else {
            // Lost the race against cancel/close; results are dropped but
            // the engine already released its resources.
            debug!(operation_id = %self.handle, "discarding results for {} operation", self.state());
        }
    }

    fn fail(&self, fault: EngineError) {
        if self.try_transition(OperationState::Running, OperationState::Error) {
            let mut inner = self.inner.lock();
            inner
                .logs
                .push(format!("operation {} failed: {fault}", self.handle));
            inner.error = Some(fault);
            inner.completed_at = Some(Instant::now());
        } else {
            debug!(operation_id = %self.handle, %fault, "engine fault after terminal state");
        }
    }

    /// Request cancellation.
    ///
    /// From `Initialized` the operation goes straight to `Canceled` without
    /// ever running. From `Running` the interrupt flag is flipped for the
    /// engine and `Canceled` commits immediately; in-flight work may take
    /// longer to actually stop. Anywhere else this is a no-op.
    pub fn cancel(&self) {
        loop {
            match self.state() {
                OperationState::Initialized => {
                    if self.try_transition(OperationState::Initialized, OperationState::Canceled) {
                        self.mark_canceled();
                        return;
                    }
                    // State moved underneath us; re-evaluate.
                }
                OperationState::Running => {
                    self.interrupt.set();
                    if self.try_transition(OperationState::Running, OperationState::Canceled) {
                        self.mark_canceled();
                    }
                    // If completion won the race the op is already terminal.
                    return;
                }
                _ => return,
            }
        }
    }

    fn mark_canceled(&self) {
        let mut inner = self.inner.lock();
        inner
            .logs
            .push(format!("operation {} canceled", self.handle));
        inner.completed_at = Some(Instant::now());
    }

    /// Close the operation, releasing any materialized results.
    ///
    /// Terminal from every state and idempotent.
    pub fn close(&self) {
        let prev = self.state.swap(OperationState::Closed as u8, Ordering::SeqCst);
        if prev == OperationState::Closed as u8 {
            return;
        }
        if prev == OperationState::Running as u8 {
            // Advise the engine to stop; background work may continue but
            // its completion transition won't commit.
            self.interrupt.set();
        }
        let mut inner = self.inner.lock();
        inner.rows = Vec::new();
        inner.logs = Vec::new();
        inner.row_cursor = 0;
        inner.log_cursor = 0;
        if inner.completed_at.is_none() {
            inner.completed_at = Some(Instant::now());
        }
        debug!(operation_id = %self.handle, "operation closed");
    }

    /// Fetch the next page of result rows.
    ///
    /// Only valid once the operation is `Finished`; the cursor advances
    /// monotonically and fetching past the end yields an empty set.
    pub fn fetch_rows(&self, orientation: FetchOrientation, max_rows: usize) -> Result<RowSet> {
        let current = self.state();
        if current != OperationState::Finished {
            return Err(SqlGateError::InvalidOperationState {
                current,
                expected: "FINISHED",
            });
        }
        let mut inner = self.inner.lock();
        if orientation == FetchOrientation::First {
            inner.row_cursor = 0;
        }
        let start = inner.row_cursor;
        let end = (start + max_rows).min(inner.rows.len());
        inner.row_cursor = end;
        Ok(RowSet {
            rows: inner.rows[start..end].to_vec(),
        })
    }

    /// Fetch the next page of captured diagnostic log lines.
    ///
    /// Same pagination contract as row fetches with an independent cursor;
    /// available in every state except `Closed`.
    pub fn fetch_logs(&self, orientation: FetchOrientation, max_rows: usize) -> Result<Vec<String>> {
        let current = self.state();
        if current == OperationState::Closed {
            return Err(SqlGateError::InvalidOperationState {
                current,
                expected: "any state before CLOSED",
            });
        }
        let mut inner = self.inner.lock();
        if orientation == FetchOrientation::First {
            inner.log_cursor = 0;
        }
        let start = inner.log_cursor;
        let end = (start + max_rows).min(inner.logs.len());
        inner.log_cursor = end;
        Ok(inner.logs[start..end].to_vec())
    }

    /// Result schema, once execution has compiled one.
    pub fn result_schema(&self) -> Result<Schema> {
        let inner = self.inner.lock();
        match &inner.schema {
            Some(schema) => Ok(schema.clone()),
            None => Err(SqlGateError::InvalidOperationState {
                current: self.state(),
                expected: "schema to be compiled",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::engine::testutil::StubEngine;
    use crate::handle::ProtocolVersion;

    fn new_op(statement: &str) -> Arc<Operation> {
        let session = SessionHandle::new(ProtocolVersion(1));
        Arc::new(Operation::new_execute_statement(session, statement))
    }

    #[test]
    fn new_operation_is_initialized() {
        let op = new_op("SELECT 1");
        assert_eq!(OperationState::Initialized, op.state());
        assert!(!op.is_closed_or_canceled());
        assert!(op.status().started_at.is_none());
    }

    #[test]
    fn cancel_before_running_goes_straight_to_canceled() {
        let op = new_op("SELECT 1");
        op.cancel();
        assert_eq!(OperationState::Canceled, op.state());
        assert!(op.is_closed_or_canceled());

        // Idempotent.
        op.cancel();
        assert_eq!(OperationState::Canceled, op.state());
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let op = new_op("SELECT 1");
        op.close();
        assert_eq!(OperationState::Closed, op.state());
        op.close();
        assert_eq!(OperationState::Closed, op.state());

        // Cancel after close is a no-op.
        op.cancel();
        assert_eq!(OperationState::Closed, op.state());
    }

    #[tokio::test]
    async fn execute_finishes_and_records_schema() {
        let op = new_op("SELECT * FROM t");
        op.execute(StubEngine::new()).await.unwrap();

        assert_eq!(OperationState::Finished, op.state());
        let status = op.status();
        assert!(status.has_result_set);
        assert!(status.error.is_none());
        assert!(status.completed_at.is_some());
        assert_eq!(StubEngine::fixed_schema(), op.result_schema().unwrap());
    }

    #[tokio::test]
    async fn execute_after_cancel_never_runs() {
        let engine = StubEngine::new();
        let op = new_op("SELECT 1");
        op.cancel();
        op.execute(engine.clone()).await.unwrap();

        assert_eq!(OperationState::Canceled, op.state());
        assert_eq!(0, engine.executions.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn execute_twice_is_invalid() {
        let op = new_op("SELECT 1");
        op.execute(StubEngine::new()).await.unwrap();
        let err = op.execute(StubEngine::new()).await.unwrap_err();
        assert!(matches!(err, SqlGateError::InvalidOperationState { .. }));
    }

    #[tokio::test]
    async fn engine_fault_is_captured_not_thrown() {
        let op = new_op("SELECT * FROM missing");
        op.execute(StubEngine::failing("table not found: missing"))
            .await
            .unwrap();

        assert_eq!(OperationState::Error, op.state());
        let status = op.status();
        assert_eq!(
            "table not found: missing",
            status.error.unwrap().message
        );

        // Fetch against an errored operation is a typed fault, not empty data.
        let err = op.fetch_rows(FetchOrientation::Next, 10).unwrap_err();
        assert!(matches!(err, SqlGateError::InvalidOperationState { .. }));
    }

    #[tokio::test]
    async fn fetch_before_finished_is_invalid() {
        let op = new_op("SELECT 1");
        let err = op.fetch_rows(FetchOrientation::Next, 10).unwrap_err();
        assert!(matches!(err, SqlGateError::InvalidOperationState { .. }));
        let err = op.result_schema().unwrap_err();
        assert!(matches!(err, SqlGateError::InvalidOperationState { .. }));
    }

    #[tokio::test]
    async fn fetch_pages_exhaust_rows_exactly_once() {
        let op = new_op("SELECT * FROM t");
        op.execute(StubEngine::new()).await.unwrap();

        let mut fetched = Vec::new();
        loop {
            let page = op.fetch_rows(FetchOrientation::Next, 2).unwrap();
            assert!(page.len() <= 2);
            if page.is_empty() {
                break;
            }
            fetched.extend(page.rows);
        }
        assert_eq!(StubEngine::fixed_rows(), fetched);

        // Past end of data stays empty rather than erroring.
        assert!(op.fetch_rows(FetchOrientation::Next, 2).unwrap().is_empty());

        // First restarts the cursor.
        let restart = op.fetch_rows(FetchOrientation::First, 100).unwrap();
        assert_eq!(StubEngine::fixed_rows(), restart.rows);
    }

    #[tokio::test]
    async fn log_cursor_is_independent_of_row_cursor() {
        let op = new_op("SELECT * FROM t");
        op.execute(StubEngine::new()).await.unwrap();

        let _ = op.fetch_rows(FetchOrientation::Next, 100).unwrap();
        let logs = op.fetch_logs(FetchOrientation::Next, 2).unwrap();
        assert_eq!(2, logs.len());
        let rest = op.fetch_logs(FetchOrientation::Next, 100).unwrap();
        assert!(!rest.is_empty());
        assert!(op.fetch_logs(FetchOrientation::Next, 100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_wins_race_against_completion() {
        let release = Arc::new(Notify::new());
        let engine = StubEngine::blocking(release.clone());
        let op = new_op("SELECT slow()");

        let task = {
            let op = op.clone();
            tokio::spawn(async move { op.execute(engine).await })
        };

        // Wait for the operation to actually be running.
        while op.state() != OperationState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        op.cancel();
        assert_eq!(OperationState::Canceled, op.state());

        // Let background work finish; its transition must not commit.
        release.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(OperationState::Canceled, op.state());
    }

    #[tokio::test]
    async fn empty_statement_completes_trivially() {
        let engine = StubEngine::new();
        let op = new_op("");
        op.execute(engine.clone()).await.unwrap();

        assert_eq!(OperationState::Finished, op.state());
        assert_eq!(0, engine.executions.load(Ordering::SeqCst));
        assert!(op.fetch_rows(FetchOrientation::Next, 10).unwrap().is_empty());
        assert_eq!(Schema::empty(), op.result_schema().unwrap());
    }

    #[tokio::test]
    async fn timed_out_is_detection_only() {
        let op = new_op("SELECT 1");
        assert!(!op.is_timed_out(Duration::ZERO));

        let release = Arc::new(Notify::new());
        let engine = StubEngine::blocking(release.clone());
        let task = {
            let op = op.clone();
            tokio::spawn(async move { op.execute(engine).await })
        };
        while op.state() != OperationState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(op.is_timed_out(Duration::ZERO));
        // Nothing in this component forces a cancel.
        assert_eq!(OperationState::Running, op.state());

        release.notify_one();
        task.await.unwrap().unwrap();
        assert!(!op.is_timed_out(Duration::ZERO));
    }
}
