//! # Pooled receive buffers
//!
//! Receive loops read into fixed-size blocks drawn from a recycling pool
//! instead of allocating per read.
//!
//! ## Ownership
//!
//! - [`MemoryBlock`] is the *owning* handle. It is returned by
//!   [`MemoryBlockPool::get`] and gives its storage back to the pool exactly
//!   once, when it is dropped (or explicitly [`released`](MemoryBlock::release)).
//!   Moving a block into an unpacker moves that responsibility with it.
//! - [`BlockView`] is a *borrowed* slice of a block produced by
//!   [`MemoryBlock::cut`]. It never touches the pool; the borrow checker keeps
//!   it from outliving the block it was cut from.
//!
//! ## Layers
//!
//! [`ByteArrayPool`] recycles the raw arrays and enforces the retain cap.
//! [`MemoryBlockPool`] wraps it, hands out [`MemoryBlock`]s and forwards
//! configuration changes so both layers always agree on block size and cap.
//!
//! ```rust
//! use bytesio::pool::MemoryBlockPool;
//!
//! let pool = MemoryBlockPool::new(1024, 4);
//! let mut block = pool.get();
//! block.buffer_mut()[..3].copy_from_slice(b"abc");
//! block.set_segment(0, 3);
//! assert_eq!(block.as_slice(), b"abc");
//! drop(block);
//! assert_eq!(pool.idle_count(), 1);
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETAINED_BLOCKS};

// ============================================================================
// Byte array pool
// ============================================================================

struct ArrayPoolShared {
    idle: Mutex<Vec<Box<[u8]>>>,
    array_size: AtomicUsize,
    max_retained: AtomicUsize,
    allocated: AtomicUsize,
    on_loan: AtomicUsize,
}

/// Bounded free-list of equally sized byte arrays.
///
/// Renting always succeeds; a fresh array is allocated when no idle one is
/// cached. Returned arrays are kept up to `max_retained`, the rest are dropped.
#[derive(Clone)]
pub struct ByteArrayPool {
    shared: Arc<ArrayPoolShared>,
}

impl ByteArrayPool {
    pub fn new(array_size: usize, max_retained: usize) -> Self {
        Self {
            shared: Arc::new(ArrayPoolShared {
                idle: Mutex::new(Vec::with_capacity(max_retained)),
                array_size: AtomicUsize::new(array_size.max(1)),
                max_retained: AtomicUsize::new(max_retained),
                allocated: AtomicUsize::new(0),
                on_loan: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an array from the idle cache or allocate one.
    pub fn rent(&self) -> Box<[u8]> {
        let cached = self.shared.idle.lock().pop();
        self.shared.on_loan.fetch_add(1, Ordering::Relaxed);

        match cached {
            Some(array) => array,
            None => {
                let size = self.array_size();
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                trace!("Allocating pooled array of {} bytes", size);
                vec![0u8; size].into_boxed_slice()
            }
        }
    }

    /// Return a rented array.
    ///
    /// Arrays of a stale size (the block size changed while they were on loan)
    /// and arrays beyond the retain cap are dropped.
    pub fn give_back(&self, array: Box<[u8]>) {
        self.shared.on_loan.fetch_sub(1, Ordering::Relaxed);

        if array.len() != self.array_size() {
            trace!("Dropping returned array of stale size {}", array.len());
            return;
        }

        let mut idle = self.shared.idle.lock();
        if idle.len() < self.max_retained() {
            idle.push(array);
        }
    }

    pub fn array_size(&self) -> usize {
        self.shared.array_size.load(Ordering::Relaxed)
    }

    /// Change the array size. Idle arrays of the old size are discarded.
    pub fn set_array_size(&self, size: usize) {
        let mut idle = self.shared.idle.lock();
        self.shared.array_size.store(size.max(1), Ordering::Relaxed);
        idle.clear();
    }

    pub fn max_retained(&self) -> usize {
        self.shared.max_retained.load(Ordering::Relaxed)
    }

    /// Change the retain cap, trimming the idle cache if it is now too large.
    pub fn set_max_retained(&self, max_retained: usize) {
        let mut idle = self.shared.idle.lock();
        self.shared
            .max_retained
            .store(max_retained, Ordering::Relaxed);
        idle.truncate(max_retained);
    }

    /// Arrays currently cached and ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Arrays allocated over the lifetime of the pool.
    pub fn allocated_count(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Arrays rented and not yet returned.
    pub fn on_loan_count(&self) -> usize {
        self.shared.on_loan.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ByteArrayPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArrayPool")
            .field("array_size", &self.array_size())
            .field("max_retained", &self.max_retained())
            .field("idle", &self.idle_count())
            .field("on_loan", &self.on_loan_count())
            .finish()
    }
}

// ============================================================================
// Memory block pool
// ============================================================================

/// Pool of receive blocks backed by a [`ByteArrayPool`].
///
/// Cloning is cheap and every clone shares the same cache.
#[derive(Clone, Debug)]
pub struct MemoryBlockPool {
    arrays: ByteArrayPool,
}

impl MemoryBlockPool {
    pub fn new(block_size: usize, max_retained: usize) -> Self {
        Self {
            arrays: ByteArrayPool::new(block_size, max_retained),
        }
    }

    /// Hand out a block whose segment spans its whole capacity.
    pub fn get(&self) -> MemoryBlock {
        let buffer = self.arrays.rent();
        let count = buffer.len();
        MemoryBlock {
            buffer,
            offset: 0,
            count,
            pool: Some(self.arrays.clone()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.arrays.array_size()
    }

    pub fn set_block_size(&self, block_size: usize) {
        self.arrays.set_array_size(block_size);
    }

    pub fn max_retained(&self) -> usize {
        self.arrays.max_retained()
    }

    /// Change the retain cap of the block layer and the array layer together.
    pub fn set_max_retained(&self, max_retained: usize) {
        self.arrays.set_max_retained(max_retained);
    }

    pub fn idle_count(&self) -> usize {
        self.arrays.idle_count()
    }

    pub fn allocated_count(&self) -> usize {
        self.arrays.allocated_count()
    }

    pub fn on_loan_count(&self) -> usize {
        self.arrays.on_loan_count()
    }

    /// The array layer behind this pool.
    pub fn arrays(&self) -> &ByteArrayPool {
        &self.arrays
    }
}

impl Default for MemoryBlockPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETAINED_BLOCKS)
    }
}

// ============================================================================
// Memory block (owning handle)
// ============================================================================

/// Owning handle to a byte buffer plus the valid segment inside it.
///
/// Pooled blocks return their storage to the pool on drop. Blocks built with
/// [`MemoryBlock::from_vec`] are not pooled and simply free their storage.
pub struct MemoryBlock {
    buffer: Box<[u8]>,
    offset: usize,
    count: usize,
    pool: Option<ByteArrayPool>,
}

impl MemoryBlock {
    /// Wrap an owned vector; the segment covers all of it.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let buffer = data.into_boxed_slice();
        let count = buffer.len();
        Self {
            buffer,
            offset: 0,
            count,
            pool: None,
        }
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Start of the segment inside the storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the segment.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// The valid segment.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.count]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.count]
    }

    /// The whole storage, for transports filling the block.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Set the valid segment.
    ///
    /// # Panics
    ///
    /// Panics if the segment does not fit in the storage.
    pub fn set_segment(&mut self, offset: usize, count: usize) {
        assert!(
            offset.checked_add(count).is_some_and(|end| end <= self.buffer.len()),
            "segment {}+{} exceeds block capacity {}",
            offset,
            count,
            self.buffer.len()
        );
        self.offset = offset;
        self.count = count;
    }

    /// Drop `n` bytes from the front of the segment without copying.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the segment length.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.count,
            "cannot advance {} bytes past a {} byte segment",
            n,
            self.count
        );
        self.offset += n;
        self.count -= n;
    }

    /// Borrow `count` bytes of the segment starting at `offset` (relative to
    /// the segment) without copying.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in the segment.
    pub fn cut(&self, offset: usize, count: usize) -> BlockView<'_> {
        assert!(
            offset.checked_add(count).is_some_and(|end| end <= self.count),
            "cut {}+{} exceeds segment length {}",
            offset,
            count,
            self.count
        );
        BlockView {
            block: self,
            offset: self.offset + offset,
            count,
        }
    }

    /// Room left in the storage after the segment.
    pub fn spare_capacity(&self) -> usize {
        self.buffer.len() - (self.offset + self.count)
    }

    /// Copy `data` in after the segment and grow it. Returns `false`, leaving
    /// the block untouched, when the storage has no room.
    pub fn try_extend(&mut self, data: &[u8]) -> bool {
        if data.len() > self.spare_capacity() {
            return false;
        }
        let end = self.offset + self.count;
        self.buffer[end..end + data.len()].copy_from_slice(data);
        self.count += data.len();
        true
    }

    /// Give the storage back to its pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for MemoryBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for MemoryBlock {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for MemoryBlock {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("offset", &self.offset)
            .field("count", &self.count)
            .field("capacity", &self.buffer.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.buffer));
        }
    }
}

// ============================================================================
// Block view (borrowed)
// ============================================================================

/// Borrowed sub-range of a [`MemoryBlock`]. Never releases storage.
#[derive(Clone, Copy)]
pub struct BlockView<'a> {
    block: &'a MemoryBlock,
    offset: usize,
    count: usize,
}

impl<'a> BlockView<'a> {
    /// The block this view was cut from.
    pub fn parent(&self) -> &'a MemoryBlock {
        self.block
    }

    /// Start of the view inside the parent's storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_slice(&self) -> &'a [u8] {
        &self.block.buffer[self.offset..self.offset + self.count]
    }

    /// Narrow the view further, relative to its own start.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in this view.
    pub fn cut(&self, offset: usize, count: usize) -> BlockView<'a> {
        assert!(
            offset.checked_add(count).is_some_and(|end| end <= self.count),
            "cut {}+{} exceeds view length {}",
            offset,
            count,
            self.count
        );
        BlockView {
            block: self.block,
            offset: self.offset + offset,
            count,
        }
    }
}

impl Deref for BlockView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for BlockView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockView")
            .field("offset", &self.offset)
            .field("count", &self.count)
            .finish()
    }
}
