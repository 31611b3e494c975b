//! Global buffer manager: one arena allocated at init, a lock-free free
//! list of buffer indices, blocking and non-blocking acquisition.

use core::sync::atomic::{AtomicU64, Ordering, fence};
use core::time::Duration;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::buffer::TupleBuffer;
use crate::error::BufferError;
use crate::pool::{BufferProvider, FixedSizeBufferPool, LocalBufferPool};

/// Payload alignment. A full cache line, so column-wise scans over adjacent
/// fields never false-share.
pub(crate) const BUFFER_ALIGN: usize = 64;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Recycling target of a checked out buffer. The last handle to drop routes
/// the buffer index here. `None` in the control block means the global pool.
pub(crate) trait BufferRecycler: Send + Sync {
    fn recycle(&self, index: u32, shared: &Arc<Shared>);
}

/// Per-buffer metadata. Lives next to, not inside, the payload region.
pub(crate) struct ControlBlock {
    /// Outstanding handle count. 0 means the buffer sits in a free list.
    refcount: AtomicU64,
    tuple_count: AtomicU64,
    watermark_ms: AtomicU64,
    sequence: AtomicU64,
    origin_id: AtomicU64,
    creation_ts_ms: AtomicU64,
    /// Owning pool override. Written only by the pool checking the buffer
    /// out while refcount == 0, taken only by the last dropping handle.
    recycler: UnsafeCell<Option<Arc<dyn BufferRecycler>>>,
}

// SAFETY: `recycler` is only accessed under the checkout protocol described
// on the field, which grants exclusive access; all other fields are atomic.
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    fn empty() -> Self {
        ControlBlock {
            refcount: AtomicU64::new(0),
            tuple_count: AtomicU64::new(0),
            watermark_ms: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            origin_id: AtomicU64::new(0),
            creation_ts_ms: AtomicU64::new(0),
            recycler: UnsafeCell::new(None),
        }
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the caller dropped the last handle. The caller must
    /// issue an acquire fence before touching the payload or the recycler.
    pub(crate) fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::Release) == 1
    }

    pub(crate) fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn tuple_count(&self) -> u64 {
        self.tuple_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_tuple_count(&self, count: u64) {
        self.tuple_count.store(count, Ordering::Release);
    }

    pub(crate) fn watermark_ms(&self) -> u64 {
        self.watermark_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_watermark_ms(&self, watermark: u64) {
        self.watermark_ms.store(watermark, Ordering::Release);
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub(crate) fn origin_id(&self) -> u64 {
        self.origin_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_origin_id(&self, origin: u64) {
        self.origin_id.store(origin, Ordering::Release);
    }

    pub(crate) fn creation_ts_ms(&self) -> u64 {
        self.creation_ts_ms.load(Ordering::Relaxed)
    }
}

/// The backing allocation. One contiguous region, never resized, never
/// relocated.
struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
    buffer_size: usize,
}

// SAFETY: the arena is a plain byte region; access discipline is enforced
// by the buffer refcount protocol.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn allocate(buffer_size: usize, count: usize) -> Self {
        let layout = Layout::from_size_align(buffer_size * count, BUFFER_ALIGN)
            .expect("buffer arena layout must be valid");
        // SAFETY: layout has non-zero size, checked by the caller.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Arena {
            ptr,
            layout,
            buffer_size,
        }
    }

    #[inline]
    fn payload_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize * self.buffer_size) < self.layout.size());
        // SAFETY: index is bounded by the arena size, asserted above.
        unsafe { self.ptr.as_ptr().add(index as usize * self.buffer_size) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: ptr/layout are the pair returned by alloc_zeroed.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// State shared between the manager, its sub-pools and every live handle.
pub(crate) struct Shared {
    arena: Arena,
    blocks: Box<[CachePadded<ControlBlock>]>,
    free: ArrayQueue<u32>,
    gate: Mutex<()>,
    on_return: Condvar,
}

impl Shared {
    #[inline]
    pub(crate) fn buffer_size(&self) -> usize {
        self.arena.buffer_size
    }

    #[inline]
    pub(crate) fn total_buffers(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub(crate) fn block(&self, index: u32) -> &ControlBlock {
        &self.blocks[index as usize]
    }

    #[inline]
    pub(crate) fn payload_ptr(&self, index: u32) -> *mut u8 {
        self.arena.payload_ptr(index)
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn pop_free(&self) -> Option<u32> {
        self.free.pop()
    }

    /// Pop a free index, waiting for a recycle when the pool is drained.
    pub(crate) fn pop_free_blocking(&self, timeout: Option<Duration>) -> Result<u32, BufferError> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.gate.lock();
        loop {
            if let Some(index) = self.free.pop() {
                return Ok(index);
            }
            match deadline {
                Some(deadline) => {
                    if self.on_return.wait_until(&mut guard, deadline).timed_out() {
                        return Err(BufferError::PoolExhausted(timeout.unwrap_or_default()));
                    }
                }
                None => self.on_return.wait(&mut guard),
            }
        }
    }

    /// Return an index to the global free list and wake one blocked waiter.
    pub(crate) fn release_to_global(&self, index: u32) {
        self.free
            .push(index)
            .expect("free list holds at most one entry per buffer");
        // Lock ordering: waiters re-check the free list under the gate, so
        // taking it here makes the notify visible to a waiter about to park.
        drop(self.gate.lock());
        self.on_return.notify_one();
    }

    /// Turn a popped free index into a live handle with refcount 1 and
    /// cleared metadata.
    pub(crate) fn checkout(
        self: &Arc<Self>,
        index: u32,
        recycler: Option<Arc<dyn BufferRecycler>>,
    ) -> TupleBuffer {
        let block = self.block(index);
        debug_assert_eq!(block.refcount.load(Ordering::Relaxed), 0);
        let now = now_millis();
        block.tuple_count.store(0, Ordering::Relaxed);
        block.watermark_ms.store(now, Ordering::Relaxed);
        block.sequence.store(0, Ordering::Relaxed);
        block.origin_id.store(0, Ordering::Relaxed);
        block.creation_ts_ms.store(now, Ordering::Relaxed);
        // SAFETY: the index was popped off a free list and refcount is 0,
        // so this thread holds the slot exclusively.
        unsafe {
            *block.recycler.get() = recycler;
        }
        block.refcount.store(1, Ordering::Release);
        TupleBuffer::new(self.clone(), index)
    }

    /// Runs in the drop path of the last handle.
    pub(crate) fn recycle(self: &Arc<Self>, index: u32) {
        fence(Ordering::Acquire);
        let block = self.block(index);
        // SAFETY: refcount reached zero, making the dropping handle the sole
        // accessor of the slot.
        let recycler = unsafe { (*block.recycler.get()).take() };
        match recycler {
            Some(recycler) => recycler.recycle(index, self),
            None => self.release_to_global(index),
        }
    }
}

/// Fixed-capacity pool of equally sized tuple buffers.
///
/// Cloning yields another handle onto the same pool. All allocation happens
/// in [`BufferManager::new`]; the hot path only moves indices between free
/// lists.
#[derive(Clone)]
pub struct BufferManager {
    shared: Arc<Shared>,
}

impl BufferManager {
    /// Allocate the arena and populate the free list.
    ///
    /// # Panics
    /// When `buffer_size` is zero or not a multiple of 64, or when
    /// `num_buffers` is zero.
    pub fn new(buffer_size: usize, num_buffers: usize) -> Self {
        assert!(num_buffers > 0, "buffer pool must hold at least one buffer");
        assert!(
            buffer_size > 0 && buffer_size % BUFFER_ALIGN == 0,
            "buffer size must be a non-zero multiple of {BUFFER_ALIGN}"
        );
        let free = ArrayQueue::new(num_buffers);
        for index in 0..num_buffers as u32 {
            free.push(index).expect("free list sized to buffer count");
        }
        let blocks = (0..num_buffers)
            .map(|_| CachePadded::new(ControlBlock::empty()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug!(buffer_size, num_buffers, "allocated global buffer pool");
        BufferManager {
            shared: Arc::new(Shared {
                arena: Arena::allocate(buffer_size, num_buffers),
                blocks,
                free,
                gate: Mutex::new(()),
                on_return: Condvar::new(),
            }),
        }
    }

    /// Block until a buffer is available. The returned buffer is writable
    /// and holds zero tuples.
    pub fn get_buffer_blocking(&self) -> TupleBuffer {
        let index = self
            .shared
            .pop_free_blocking(None)
            .expect("untimed wait cannot exhaust");
        self.shared.checkout(index, None)
    }

    /// Block for at most `timeout`, then fail with
    /// [`BufferError::PoolExhausted`].
    pub fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, BufferError> {
        let index = self.shared.pop_free_blocking(Some(timeout))?;
        Ok(self.shared.checkout(index, None))
    }

    /// Non-blocking acquisition; `None` when the pool is empty.
    pub fn get_buffer(&self) -> Option<TupleBuffer> {
        let index = self.shared.pop_free()?;
        Some(self.shared.checkout(index, None))
    }

    /// Reserve a capped sub-pool. With `fallback` the pool draws from the
    /// global free list once its own quota is in use; without it callers
    /// block on the quota.
    pub fn create_local_buffer_pool(&self, num_buffers: usize, fallback: bool) -> LocalBufferPool {
        LocalBufferPool::new(self.shared.clone(), num_buffers, fallback)
    }

    /// Reserve a bounded pool with exclusive ownership of `num_buffers`
    /// buffers and no fallback. Blocks until the buffers could be drawn from
    /// the global free list.
    pub fn create_fixed_size_buffer_pool(&self, num_buffers: usize) -> FixedSizeBufferPool {
        FixedSizeBufferPool::new(self.shared.clone(), num_buffers)
    }

    pub fn available_buffers(&self) -> usize {
        self.shared.available()
    }

    pub fn total_buffers(&self) -> usize {
        self.shared.total_buffers()
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size()
    }
}

impl BufferProvider for BufferManager {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        BufferManager::get_buffer_blocking(self)
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, BufferError> {
        BufferManager::get_buffer_timeout(self, timeout)
    }

    fn try_get_buffer(&self) -> Option<TupleBuffer> {
        BufferManager::get_buffer(self)
    }

    fn available_buffers(&self) -> usize {
        BufferManager::available_buffers(self)
    }

    fn buffer_size(&self) -> usize {
        BufferManager::buffer_size(self)
    }
}
