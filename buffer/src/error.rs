//! error types.

use core::time::Duration;

use crate::schema::DataType;

/// Error surfaced by buffer acquisition and layout access.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    /// No buffer became available within the given timeout.
    #[error("buffer pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),
    /// A layout was bound against a buffer too small for a single row.
    #[error("schema of {schema_bytes} bytes does not fit buffer of {buffer_bytes} bytes")]
    SchemaSizeMismatch { schema_bytes: usize, buffer_bytes: usize },
    /// A record push was attempted on a buffer at capacity.
    #[error("buffer full at capacity {capacity}")]
    BufferFull { capacity: usize },
    /// A tuple index past the current tuple count was accessed.
    #[error("tuple index {index} out of bounds for {count} tuples")]
    IndexOutOfBounds { index: usize, count: usize },
    /// A typed field access did not match the schema field type.
    #[error("field {field} has type {actual:?} but {requested:?} was requested")]
    FieldTypeMismatch {
        field: usize,
        actual: DataType,
        requested: DataType,
    },
    /// A record value count or type did not match the schema.
    #[error("record does not match schema: {0}")]
    RecordMismatch(&'static str),
}
