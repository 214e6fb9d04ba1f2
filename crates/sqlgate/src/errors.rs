use crate::engine::EngineError;
use crate::handle::{OperationHandle, SessionHandle};
use crate::operation::OperationState;

#[derive(Debug, thiserror::Error)]
pub enum SqlGateError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("no session for handle: {0}")]
    NoSuchSession(SessionHandle),

    #[error("no operation for handle: {0}")]
    NoSuchOperation(OperationHandle),

    #[error("session limit reached: {0}")]
    TooManySessions(usize),

    #[error("invalid operation state: {current}, expected {expected}")]
    InvalidOperationState {
        current: OperationState,
        expected: &'static str,
    },

    #[error("unrecognized info kind: {0}")]
    UnrecognizedInfoKind(u16),

    #[error("engine initialization failed for '{identity}'")]
    EngineInitializationFailed {
        identity: String,
        #[source]
        source: EngineError,
    },

    #[error("execution failed: {0}")]
    ExecutionFailed(#[from] EngineError),

    #[error("resource cleanup failed: {0}")]
    ResourceCleanupFailed(String),
}

pub type Result<T, E = SqlGateError> = std::result::Result<T, E>;

macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::SqlGateError::Internal(std::format!($($arg)*))
    };
}
pub(crate) use internal;
