//! error types.

use std::sync::Arc;

use rill_buffer::BufferError;
use rill_network::{NetworkError, QueryId};

use crate::plan::ExecutionStatus;

/// Failure code surfaced by a compiled pipeline stage.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage error {code}: {message}")]
pub struct StageError {
    pub code: u32,
    pub message: Arc<str>,
}

impl StageError {
    pub fn new(code: u32, message: impl Into<Arc<str>>) -> Self {
        StageError {
            code,
            message: message.into(),
        }
    }
}

impl From<BufferError> for StageError {
    fn from(err: BufferError) -> Self {
        StageError::new(1, err.to_string())
    }
}

/// Error surfaced by plan lifecycle operations and the engine.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("query {0} is not registered in this engine")]
    UnknownQuery(QueryId),
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("query {query_id} failed: {error}")]
    QueryFailed { query_id: QueryId, error: StageError },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("source failed: {0}")]
    Source(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
