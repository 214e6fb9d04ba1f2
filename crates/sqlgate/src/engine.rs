//! Execution engine collaborator traits.
//!
//! The gateway never parses, plans, or runs statements itself. It hands a
//! [`StatementPlan`] to an [`ExecutionEngine`] scoped to a client identity
//! and collects the produced schema, rows, and diagnostic log lines.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::statement::StatementPlan;
use crate::types::{Row, Schema, SessionConfig};

/// Fault raised by the engine collaborator.
///
/// Kept cheap to clone since execution faults are captured into operation
/// status and handed out on every status poll.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> EngineError {
        EngineError {
            message: message.into(),
        }
    }
}

/// Advisory cancellation flag handed to the engine on every execute call.
///
/// The engine checks it at its own internal checkpoints; flipping the flag
/// never guarantees an immediate halt.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Interrupt {
        Interrupt::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a completed execution produced.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub schema: Schema,
    pub rows: Vec<Row>,
    pub logs: Vec<String>,
}

/// Identity-scoped statement executor.
///
/// One instance is shared by every session opened for the same identity, so
/// implementations must be safe for concurrent execute calls.
#[async_trait]
pub trait ExecutionEngine: Debug + Send + Sync {
    /// Engine name reported through session metadata.
    fn name(&self) -> &str;

    /// Engine version reported through session metadata.
    fn version(&self) -> &str;

    /// Identity-scoped initialization performed when a session binds to this
    /// engine, e.g. upstream authorization checks.
    async fn prepare(&self, identity: &str) -> Result<(), EngineError>;

    /// Run one statement to completion, checking `interrupt` at internal
    /// checkpoints. Implementations must release engine-side resources even
    /// when the caller has already given up on the result.
    async fn execute(
        &self,
        plan: &StatementPlan,
        interrupt: Interrupt,
    ) -> Result<EngineOutput, EngineError>;
}

/// Constructs engines on first acquisition for an identity.
///
/// Construction may be expensive; the cache guarantees at most one build per
/// identity is in flight at a time.
#[async_trait]
pub trait EngineBuilder: Debug + Send + Sync {
    async fn build(
        &self,
        identity: &str,
        config: &SessionConfig,
    ) -> Result<Arc<dyn ExecutionEngine>, EngineError>;
}
