//! PCM ring buffer assembled from pool blocks
//!
//! One producer (the entry's decode thread) writes stereo frames and one
//! consumer (the renderer) reads them. Both sides work on `AtomicU32` sample
//! cells borrowed from the [`BufferPool`], so neither takes a lock and the
//! consumer never allocates.
//!
//! ## Counters
//!
//! `written` and `read` count frames since the ring was created and never
//! wrap back to zero. Occupancy is `written - read`; the slot of frame `n` is
//! `n % capacity`. The producer publishes cells before storing `written`
//! (release), the consumer finishes reading cells before storing `read`
//! (release), and each side acquires the other's counter before touching
//! cells.

use crate::error::{EngineError, Result};
use crate::pool::{BufferBlock, BufferPool};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;
use tracing::{debug, warn};

/// Samples per frame (stereo)
pub const CHANNELS: usize = 2;

/// Bytes per stereo `f32` frame
pub const FRAME_BYTES: usize = CHANNELS * std::mem::size_of::<f32>();

/// Occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity_frames: u64,
    pub used_frames: u64,
    pub frames_written: u64,
    pub frames_read: u64,
    pub decode_complete: bool,
}

/// Single-producer single-consumer stereo PCM ring
pub struct PcmRingBuffer {
    pool: Arc<BufferPool>,
    blocks: Vec<BufferBlock>,
    cells_per_block: usize,
    capacity_frames: u64,

    written: AtomicU64,
    read: AtomicU64,
    decode_complete: AtomicBool,

    /// Decode thread, parked while the ring is full
    producer: OnceLock<Thread>,
    producer_waiting: AtomicBool,
}

impl PcmRingBuffer {
    /// Borrow enough blocks for `frames` stereo frames
    ///
    /// # Returns
    /// - `InvalidPoolConfig` if the pool could never supply that many blocks
    /// - `PoolExhausted` if the blocks are lent out right now
    pub fn allocate(pool: &Arc<BufferPool>, frames: u64) -> Result<Self> {
        if frames == 0 {
            return Err(EngineError::InvalidPoolConfig(
                "ring buffer needs at least one frame".to_string(),
            ));
        }
        let block_bytes = pool.block_bytes();
        let bytes = frames as usize * FRAME_BYTES;
        let needed = bytes.div_ceil(block_bytes);
        if needed > pool.max_blocks() {
            return Err(EngineError::InvalidPoolConfig(format!(
                "ring of {} frames needs {} blocks, pool holds at most {}",
                frames,
                needed,
                pool.max_blocks()
            )));
        }

        let blocks = pool.acquire_many(needed)?;
        debug!(
            "PCM ring allocated: {} frames over {} blocks",
            frames, needed
        );
        Ok(Self {
            pool: Arc::clone(pool),
            blocks,
            cells_per_block: block_bytes / std::mem::size_of::<u32>(),
            capacity_frames: frames,
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            decode_complete: AtomicBool::new(false),
            producer: OnceLock::new(),
            producer_waiting: AtomicBool::new(false),
        })
    }

    #[inline]
    fn cell(&self, index: usize) -> &AtomicU32 {
        &self.blocks[index / self.cells_per_block].cells()[index % self.cells_per_block]
    }

    #[inline]
    fn slot(&self, frame: u64) -> usize {
        (frame % self.capacity_frames) as usize * CHANNELS
    }

    pub fn capacity_frames(&self) -> u64 {
        self.capacity_frames
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Frames written but not yet read
    pub fn used_frames(&self) -> u64 {
        let read = self.read.load(Ordering::Acquire);
        self.written.load(Ordering::Acquire).saturating_sub(read)
    }

    pub fn free_frames(&self) -> u64 {
        self.capacity_frames - self.used_frames()
    }

    /// Slot index of the oldest unread frame
    pub fn start_index(&self) -> u64 {
        self.read.load(Ordering::Acquire) % self.capacity_frames
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn frames_read(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------------

    /// Copy as many whole frames of interleaved stereo as fit
    ///
    /// # Returns
    /// Frames written (0 when full)
    pub fn push_frames(&self, samples: &[f32]) -> usize {
        let written = self.written.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let free = self.capacity_frames - (written - read);
        let count = (samples.len() / CHANNELS).min(free as usize);

        for (i, frame) in samples.chunks_exact(CHANNELS).take(count).enumerate() {
            let slot = self.slot(written + i as u64);
            self.cell(slot).store(frame[0].to_bits(), Ordering::Relaxed);
            self.cell(slot + 1).store(frame[1].to_bits(), Ordering::Relaxed);
        }

        self.written.store(written + count as u64, Ordering::Release);
        count
    }

    /// No more frames will be pushed
    pub fn mark_decode_complete(&self) {
        self.decode_complete.store(true, Ordering::Release);
    }

    pub fn is_decode_complete(&self) -> bool {
        self.decode_complete.load(Ordering::Acquire)
    }

    /// Decode complete and every frame consumed
    pub fn is_drained(&self) -> bool {
        self.is_decode_complete() && self.used_frames() == 0
    }

    /// Record the thread to unpark when the consumer frees space
    pub fn register_producer(&self, thread: Thread) {
        if self.producer.set(thread).is_err() {
            warn!("PCM ring already has a producer thread");
        }
    }

    /// Park the calling producer until space frees up or `timeout` passes
    pub fn wait_for_space(&self, timeout: std::time::Duration) {
        self.producer_waiting.store(true, Ordering::SeqCst);
        // Consumer may have freed space between the caller's push and the flag
        if self.free_frames() == 0 {
            std::thread::park_timeout(timeout);
        }
        self.producer_waiting.store(false, Ordering::SeqCst);
    }

    /// Wake the producer regardless of ring occupancy
    pub fn wake_producer(&self) {
        if let Some(thread) = self.producer.get() {
            thread.unpark();
        }
    }

    // ------------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------------

    /// Consume up to `max_frames`, handing each frame to `f`
    ///
    /// `f` receives the frame's offset within this call and its left and
    /// right samples.
    ///
    /// # Returns
    /// Frames consumed
    #[inline]
    pub fn read_with(&self, max_frames: usize, mut f: impl FnMut(usize, f32, f32)) -> usize {
        let read = self.read.load(Ordering::Relaxed);
        let written = self.written.load(Ordering::Acquire);
        let count = ((written - read) as usize).min(max_frames);

        for i in 0..count {
            let slot = self.slot(read + i as u64);
            let left = f32::from_bits(self.cell(slot).load(Ordering::Relaxed));
            let right = f32::from_bits(self.cell(slot + 1).load(Ordering::Relaxed));
            f(i, left, right);
        }

        if count > 0 {
            self.read.store(read + count as u64, Ordering::Release);
            if self.producer_waiting.load(Ordering::SeqCst) {
                self.wake_producer();
            }
        }
        count
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity_frames: self.capacity_frames,
            used_frames: self.used_frames(),
            frames_written: self.frames_written(),
            frames_read: self.frames_read(),
            decode_complete: self.is_decode_complete(),
        }
    }
}

impl Drop for PcmRingBuffer {
    fn drop(&mut self) {
        let count = self.blocks.len();
        if let Err(e) = self.pool.release_all(self.blocks.drain(..)) {
            warn!("Failed to return {} ring blocks: {}", count, e);
        }
    }
}

impl std::fmt::Debug for PcmRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmRingBuffer")
            .field("stats", &self.stats())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_blocks: usize, block_bytes: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(max_blocks, block_bytes).unwrap())
    }

    fn stereo(frames: std::ops::Range<u32>) -> Vec<f32> {
        frames.flat_map(|i| [i as f32, -(i as f32)]).collect()
    }

    fn drain(ring: &PcmRingBuffer, max: usize) -> Vec<f32> {
        let mut out = Vec::new();
        ring.read_with(max, |_, l, r| {
            out.push(l);
            out.push(r);
        });
        out
    }

    #[test]
    fn test_allocate_spans_blocks() {
        let pool = pool(8, 64); // 8 frames per block
        let ring = PcmRingBuffer::allocate(&pool, 20).unwrap();
        assert_eq!(ring.block_count(), 3);
        assert_eq!(pool.stats().lent, 3);
        drop(ring);
        assert_eq!(pool.stats().lent, 0);
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn test_allocate_larger_than_pool_is_config_error() {
        let pool = pool(2, 64);
        let err = PcmRingBuffer::allocate(&pool, 100).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPoolConfig(_)));
    }

    #[test]
    fn test_allocate_exhausted_pool() {
        let pool = pool(3, 64);
        let _held = PcmRingBuffer::allocate(&pool, 16).unwrap();
        let err = PcmRingBuffer::allocate(&pool, 16).unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted(_)));
    }

    #[test]
    fn test_push_pop_fifo_order() {
        let pool = pool(4, 64);
        let ring = PcmRingBuffer::allocate(&pool, 10).unwrap();

        assert_eq!(ring.push_frames(&stereo(0..6)), 6);
        assert_eq!(ring.used_frames(), 6);
        assert_eq!(drain(&ring, 4), stereo(0..4));
        assert_eq!(ring.start_index(), 4);

        // Wraps past the end of the ring
        assert_eq!(ring.push_frames(&stereo(6..14)), 8);
        assert_eq!(ring.used_frames(), 10);
        assert_eq!(ring.free_frames(), 0);
        assert_eq!(drain(&ring, 100), stereo(4..14));
        assert_eq!(ring.start_index(), 4);
    }

    #[test]
    fn test_push_into_full_ring_writes_nothing() {
        let pool = pool(4, 64);
        let ring = PcmRingBuffer::allocate(&pool, 4).unwrap();
        assert_eq!(ring.push_frames(&stereo(0..10)), 4);
        assert_eq!(ring.push_frames(&stereo(10..12)), 0);
        assert_eq!(ring.frames_written(), 4);
    }

    #[test]
    fn test_drained_requires_completion_and_empty() {
        let pool = pool(4, 64);
        let ring = PcmRingBuffer::allocate(&pool, 8).unwrap();
        ring.push_frames(&stereo(0..2));
        ring.mark_decode_complete();
        assert!(!ring.is_drained());
        drain(&ring, 2);
        assert!(ring.is_drained());
    }

    #[test]
    fn test_consumer_wakes_parked_producer() {
        let pool = pool(4, 64);
        let ring = Arc::new(PcmRingBuffer::allocate(&pool, 4).unwrap());
        ring.push_frames(&stereo(0..4));

        let producer_ring = Arc::clone(&ring);
        let producer = std::thread::spawn(move || {
            producer_ring.register_producer(std::thread::current());
            let samples = stereo(4..8);
            let mut offset = 0;
            while offset < 4 {
                offset += producer_ring.push_frames(&samples[offset * 2..]);
                if offset < 4 {
                    producer_ring.wait_for_space(std::time::Duration::from_millis(20));
                }
            }
        });

        let mut out = Vec::new();
        while out.len() < 16 {
            ring.read_with(1, |_, l, r| {
                out.push(l);
                out.push(r);
            });
            std::thread::yield_now();
        }
        producer.join().unwrap();
        assert_eq!(out, stereo(0..8));
    }
}
