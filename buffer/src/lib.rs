//! Fixed-capacity tuple buffer pool and schema aware memory layouts.
//!
//! The pool is a single arena allocated once at startup. Buffers are handed
//! out as reference counted handles and recycle into their owning pool when
//! the last handle drops. Layouts give typed row or column access to the
//! raw bytes of a buffer.

mod buffer;
mod error;
mod manager;
mod pool;
mod schema;

pub mod layout;

pub use buffer::TupleBuffer;
pub use error::BufferError;
pub use manager::BufferManager;
pub use pool::{BufferProvider, FixedSizeBufferPool, LocalBufferPool};
pub use schema::{DataType, Field, Schema, SchemaBuilder};
