//! Bounded allocator and recycler of fixed-size PCM blocks
//!
//! Every entry's ring buffer is assembled from blocks borrowed here, so the
//! total PCM memory held by the engine never exceeds
//! `max_blocks × block_bytes`.
//!
//! # Ownership
//!
//! A [`BufferBlock`] is not `Clone`. While idle it sits in the pool's free
//! list; while lent it is owned by the borrower; [`BufferPool::release`]
//! takes it back by value. A block on the free list therefore cannot also be
//! referenced by a borrower.
//!
//! # Locking
//!
//! One mutex guards the free list and counters, held only for O(1) list and
//! counter updates. Zeroing on return and allocation of new blocks happen
//! outside the lock.

use crate::error::{EngineError, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Distinguishes pools so a block cannot be returned to the wrong one
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes per sample cell
const CELL_BYTES: usize = std::mem::size_of::<u32>();

/// Fixed-capacity block of sample cells
///
/// Cells are `AtomicU32` so a ring buffer built from blocks can be written by
/// its producer thread and read by its consumer thread without `unsafe` or a
/// lock. Samples are stored as `f32` bit patterns.
#[derive(Debug)]
pub struct BufferBlock {
    id: u64,
    pool_id: u64,
    epoch: u64,
    cells: Box<[AtomicU32]>,
}

impl BufferBlock {
    fn new(id: u64, pool_id: u64, epoch: u64, block_bytes: usize) -> Self {
        let cells = (0..block_bytes / CELL_BYTES)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            id,
            pool_id,
            epoch,
            cells,
        }
    }

    /// Identifier unique within the lending pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Capacity in bytes
    pub fn len_bytes(&self) -> usize {
        self.cells.len() * CELL_BYTES
    }

    /// Capacity in 32-bit cells
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[AtomicU32] {
        &self.cells
    }

    /// True if every cell is zero
    pub fn is_zeroed(&self) -> bool {
        self.cells.iter().all(|c| c.load(Ordering::Relaxed) == 0)
    }

    fn zero(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub block_bytes: usize,
    pub max_blocks: usize,
    /// Blocks currently in existence (idle + lent)
    pub live: usize,
    pub idle: usize,
    pub lent: usize,
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<BufferBlock>,
    live: usize,
    lent: usize,
    epoch: u64,
    next_block_id: u64,
}

/// Bounded block allocator
///
/// Shared between entries as `Arc<BufferPool>`.
#[derive(Debug)]
pub struct BufferPool {
    pool_id: u64,
    block_bytes: usize,
    max_blocks: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create an empty pool
    ///
    /// # Arguments
    /// * `max_blocks` - Upper bound on live blocks
    /// * `block_bytes` - Size of each block; a positive multiple of 4
    pub fn new(max_blocks: usize, block_bytes: usize) -> Result<Self> {
        if max_blocks == 0 {
            return Err(EngineError::InvalidPoolConfig(
                "max_blocks must be positive".to_string(),
            ));
        }
        if block_bytes == 0 || block_bytes % CELL_BYTES != 0 {
            return Err(EngineError::InvalidPoolConfig(format!(
                "block_bytes must be a positive multiple of {}, got {}",
                CELL_BYTES, block_bytes
            )));
        }

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Buffer pool {} created: {} blocks x {} bytes",
            pool_id, max_blocks, block_bytes
        );

        Ok(Self {
            pool_id,
            block_bytes,
            max_blocks,
            inner: Mutex::new(PoolInner {
                free: Vec::with_capacity(max_blocks),
                live: 0,
                lent: 0,
                epoch: 0,
                next_block_id: 0,
            }),
        })
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Counters are updated atomically under the lock, so a poisoned
        // guard still holds consistent data
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow one block
    ///
    /// Reuses an idle block if one exists, otherwise creates a new one while
    /// under `max_blocks`. Never blocks waiting for a release.
    ///
    /// # Returns
    /// A zeroed block, or `PoolExhausted`
    pub fn acquire(&self) -> Result<BufferBlock> {
        let (id, epoch) = {
            let mut inner = self.lock();
            if let Some(block) = inner.free.pop() {
                inner.lent += 1;
                trace!("Pool {}: reuse block {}", self.pool_id, block.id);
                return Ok(block);
            }
            if inner.live >= self.max_blocks {
                return Err(EngineError::PoolExhausted(format!(
                    "all {} blocks lent",
                    self.max_blocks
                )));
            }
            inner.live += 1;
            inner.lent += 1;
            let id = inner.next_block_id;
            inner.next_block_id += 1;
            (id, inner.epoch)
        };

        trace!("Pool {}: new block {}", self.pool_id, id);
        Ok(BufferBlock::new(id, self.pool_id, epoch, self.block_bytes))
    }

    /// Borrow `count` blocks, or none at all
    ///
    /// Checked and reserved under a single lock so two callers assembling
    /// ring buffers cannot each end up holding a partial set.
    pub fn acquire_many(&self, count: usize) -> Result<Vec<BufferBlock>> {
        let (mut blocks, fresh) = {
            let mut inner = self.lock();
            let available = inner.free.len() + (self.max_blocks - inner.live);
            if count > available {
                return Err(EngineError::PoolExhausted(format!(
                    "requested {} blocks, {} available",
                    count, available
                )));
            }
            let reuse = count.min(inner.free.len());
            let split_at = inner.free.len() - reuse;
            let blocks = inner.free.split_off(split_at);
            let fresh_count = count - reuse;
            let fresh = (0..fresh_count)
                .map(|i| (inner.next_block_id + i as u64, inner.epoch))
                .collect::<Vec<_>>();
            inner.next_block_id += fresh_count as u64;
            inner.live += fresh_count;
            inner.lent += count;
            (blocks, fresh)
        };

        blocks.extend(
            fresh
                .into_iter()
                .map(|(id, epoch)| BufferBlock::new(id, self.pool_id, epoch, self.block_bytes)),
        );
        debug!("Pool {}: lent {} blocks", self.pool_id, count);
        Ok(blocks)
    }

    /// Return a block to the pool
    ///
    /// The block is zeroed before it becomes available again. Blocks lent
    /// before the last [`flush`](Self::flush) are destroyed instead of
    /// recycled.
    ///
    /// # Returns
    /// `InvalidRelease` if the block belongs to a different pool (the block
    /// is dropped)
    pub fn release(&self, block: BufferBlock) -> Result<()> {
        if block.pool_id != self.pool_id {
            warn!(
                "Block {} of pool {} released to pool {}",
                block.id, block.pool_id, self.pool_id
            );
            return Err(EngineError::InvalidRelease(format!(
                "block {} belongs to pool {}, not {}",
                block.id, block.pool_id, self.pool_id
            )));
        }

        block.zero();

        let stale = {
            let mut inner = self.lock();
            inner.lent = inner.lent.saturating_sub(1);
            if block.epoch != inner.epoch {
                inner.live = inner.live.saturating_sub(1);
                Some(block)
            } else {
                inner.free.push(block);
                None
            }
        };

        if let Some(block) = stale {
            trace!("Pool {}: dropped pre-flush block {}", self.pool_id, block.id);
        }
        Ok(())
    }

    /// Return several blocks; stops at the first foreign block
    pub fn release_all(&self, blocks: impl IntoIterator<Item = BufferBlock>) -> Result<()> {
        for block in blocks {
            self.release(block)?;
        }
        Ok(())
    }

    /// Destroy all idle blocks
    ///
    /// The live count drops to the number of blocks currently lent. Those
    /// blocks are destroyed rather than recycled when they come back.
    pub fn flush(&self) {
        let idle = {
            let mut inner = self.lock();
            let idle = std::mem::take(&mut inner.free);
            inner.live = inner.lent;
            inner.epoch += 1;
            idle
        };
        debug!("Pool {}: flushed {} idle blocks", self.pool_id, idle.len());
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            block_bytes: self.block_bytes,
            max_blocks: self.max_blocks,
            live: inner.live,
            idle: inner.free.len(),
            lent: inner.lent,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
