//! Registry mapping operation handles to live operations.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Result, SqlGateError};
use crate::handle::{OperationHandle, SessionHandle};
use crate::operation::{Operation, OperationStatus};
use crate::types::{FetchOrientation, Row, RowSet, Schema, Value};

/// Shared registry of in-flight and completed operations.
///
/// Registration happens at creation; the entry lives until the operation is
/// explicitly closed (directly or through its owning session's close).
pub struct OperationManager {
    operations: DashMap<Uuid, Arc<Operation>>,
}

impl Default for OperationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationManager {
    pub fn new() -> OperationManager {
        OperationManager {
            operations: DashMap::new(),
        }
    }

    /// Create and register a statement operation in the `Initialized` state.
    ///
    /// Execution is started separately, either synchronously or deferred.
    pub fn new_execute_statement_operation(
        &self,
        session: SessionHandle,
        statement: impl Into<String>,
    ) -> Arc<Operation> {
        let op = Arc::new(Operation::new_execute_statement(session, statement));
        debug!(operation_id = %op.handle(), session_id = %session, "created operation");
        self.operations.insert(op.handle().id(), op.clone());
        op
    }

    pub fn get_operation(&self, handle: OperationHandle) -> Result<Arc<Operation>> {
        self.operations
            .get(&handle.id())
            .map(|op| op.value().clone())
            .ok_or(SqlGateError::NoSuchOperation(handle))
    }

    pub fn get_operation_status(&self, handle: OperationHandle) -> Result<OperationStatus> {
        Ok(self.get_operation(handle)?.status())
    }

    pub fn cancel_operation(&self, handle: OperationHandle) -> Result<()> {
        self.get_operation(handle)?.cancel();
        Ok(())
    }

    /// Close the operation and drop it from the registry.
    pub fn close_operation(&self, handle: OperationHandle) -> Result<()> {
        let (_, op) = self
            .operations
            .remove(&handle.id())
            .ok_or(SqlGateError::NoSuchOperation(handle))?;
        op.close();
        Ok(())
    }

    pub fn get_operation_next_row_set(
        &self,
        handle: OperationHandle,
        orientation: FetchOrientation,
        max_rows: usize,
    ) -> Result<RowSet> {
        self.get_operation(handle)?.fetch_rows(orientation, max_rows)
    }

    /// Captured diagnostic log lines as single-column rows, paginated on a
    /// cursor independent from the result-row cursor.
    pub fn get_operation_log_row_set(
        &self,
        handle: OperationHandle,
        orientation: FetchOrientation,
        max_rows: usize,
    ) -> Result<RowSet> {
        let lines = self.get_operation(handle)?.fetch_logs(orientation, max_rows)?;
        Ok(RowSet {
            rows: lines
                .into_iter()
                .map(|line| Row(vec![Value::Utf8(line)]))
                .collect(),
        })
    }

    pub fn get_result_set_schema(&self, handle: OperationHandle) -> Result<Schema> {
        self.get_operation(handle)?.result_schema()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }
}
