//! Reference counted handle to one pooled tuple buffer.

use core::fmt;
use core::slice;
use std::sync::Arc;

use crate::manager::Shared;

/// Handle to a fixed-size byte region plus its metadata header.
///
/// Cloning shares the underlying buffer and bumps the atomic refcount;
/// dropping the last handle recycles the buffer into its owning pool. The
/// payload is never reallocated or moved.
pub struct TupleBuffer {
    shared: Arc<Shared>,
    index: u32,
}

impl TupleBuffer {
    pub(crate) fn new(shared: Arc<Shared>, index: u32) -> Self {
        TupleBuffer { shared, index }
    }

    /// Size of the payload region in bytes.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size()
    }

    /// The full payload region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the payload region stays valid for the lifetime of the
        // arena, which this handle keeps alive through `shared`.
        unsafe { slice::from_raw_parts(self.shared.payload_ptr(self.index), self.buffer_size()) }
    }

    /// Mutable access to the payload region.
    ///
    /// Writers must hold the sole handle; readers only observe the payload
    /// after the writer published the tuple count and emitted the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.reference_count(), 1, "writer must hold the sole handle");
        // SAFETY: as in `as_slice`; exclusivity follows from the refcount
        // protocol asserted above.
        unsafe {
            slice::from_raw_parts_mut(self.shared.payload_ptr(self.index), self.buffer_size())
        }
    }

    /// Number of tuples the producer published into this buffer.
    #[inline]
    pub fn number_of_tuples(&self) -> u64 {
        self.shared.block(self.index).tuple_count()
    }

    /// Publish the tuple count. A release store, paired with the acquire
    /// load in [`Self::number_of_tuples`], so downstream readers observe
    /// the complete payload write.
    #[inline]
    pub fn set_number_of_tuples(&self, count: u64) {
        self.shared.block(self.index).set_tuple_count(count);
    }

    /// Watermark carried by this buffer in milliseconds. Defaults to the
    /// checkout wall clock; sources overwrite it with event time.
    #[inline]
    pub fn watermark_ms(&self) -> u64 {
        self.shared.block(self.index).watermark_ms()
    }

    #[inline]
    pub fn set_watermark_ms(&self, watermark: u64) {
        self.shared.block(self.index).set_watermark_ms(watermark);
    }

    /// Monotone per-origin sequence number, assigned by the producer.
    #[inline]
    pub fn sequence_number(&self) -> u64 {
        self.shared.block(self.index).sequence()
    }

    #[inline]
    pub fn set_sequence_number(&self, sequence: u64) {
        self.shared.block(self.index).set_sequence(sequence);
    }

    /// Identifier of the originating partition or source.
    #[inline]
    pub fn origin_id(&self) -> u64 {
        self.shared.block(self.index).origin_id()
    }

    #[inline]
    pub fn set_origin_id(&self, origin: u64) {
        self.shared.block(self.index).set_origin_id(origin);
    }

    /// Wall clock time at checkout in milliseconds.
    #[inline]
    pub fn creation_timestamp_ms(&self) -> u64 {
        self.shared.block(self.index).creation_ts_ms()
    }

    /// Current number of live handles.
    pub fn reference_count(&self) -> u64 {
        self.shared.block(self.index).refcount()
    }
}

impl Clone for TupleBuffer {
    fn clone(&self) -> Self {
        self.shared.block(self.index).retain();
        TupleBuffer {
            shared: self.shared.clone(),
            index: self.index,
        }
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        if self.shared.block(self.index).release() {
            self.shared.recycle(self.index);
        }
    }
}

impl fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("index", &self.index)
            .field("tuples", &self.number_of_tuples())
            .field("watermark_ms", &self.watermark_ms())
            .field("sequence", &self.sequence_number())
            .field("origin", &self.origin_id())
            .field("refcount", &self.reference_count())
            .finish()
    }
}
