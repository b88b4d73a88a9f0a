//! Property tests for the block pool and PCM ring buffer
//!
//! - Pool counters stay consistent under arbitrary acquire/release sequences
//! - The ring is FIFO for any interleaving of push and read sizes, and
//!   across a producer and a consumer thread

use proptest::prelude::*;
use qmix_engine::entry::PcmRingBuffer;
use qmix_engine::{BufferPool, EngineError};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum PoolOp {
    Acquire(usize),
    Release(usize),
    Flush,
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        4 => (1usize..6).prop_map(PoolOp::Acquire),
        4 => (0usize..8).prop_map(PoolOp::Release),
        1 => Just(PoolOp::Flush),
    ]
}

proptest! {
    #[test]
    fn test_pool_counters_consistent(
        max_blocks in 1usize..16,
        ops in prop::collection::vec(pool_op(), 1..60),
    ) {
        let pool = BufferPool::new(max_blocks, 64).unwrap();
        let mut held = Vec::new();

        for op in ops {
            match op {
                PoolOp::Acquire(n) => {
                    let before = pool.stats();
                    match pool.acquire_many(n) {
                        Ok(blocks) => {
                            prop_assert_eq!(blocks.len(), n);
                            prop_assert!(blocks.iter().all(|b| b.is_zeroed()));
                            held.extend(blocks);
                        }
                        Err(EngineError::PoolExhausted(_)) => {
                            // All-or-nothing: nothing was taken
                            prop_assert_eq!(pool.stats(), before);
                            prop_assert!(before.idle + (max_blocks - before.live) < n);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                PoolOp::Release(n) => {
                    let n = n.min(held.len());
                    let blocks: Vec<_> = held.drain(..n).collect();
                    pool.release_all(blocks).unwrap();
                }
                PoolOp::Flush => pool.flush(),
            }

            let stats = pool.stats();
            prop_assert_eq!(stats.lent, held.len());
            prop_assert!(stats.live <= max_blocks);
            prop_assert!(stats.lent <= stats.live);
            prop_assert_eq!(stats.idle + stats.lent, stats.live);
        }
    }

    #[test]
    fn test_ring_is_fifo(
        capacity in 1u64..300,
        steps in prop::collection::vec((0usize..128, 0usize..128), 1..40),
    ) {
        let pool = Arc::new(BufferPool::new(64, 256).unwrap());
        let ring = PcmRingBuffer::allocate(&pool, capacity).unwrap();
        let mut model: VecDeque<(f32, f32)> = VecDeque::new();
        let mut next_value = 0u32;

        for (push, read) in steps {
            let samples: Vec<f32> = (0..push)
                .flat_map(|i| {
                    let v = (next_value + i as u32) as f32;
                    [v, -v]
                })
                .collect();
            let pushed = ring.push_frames(&samples);
            prop_assert_eq!(pushed as u64, (push as u64).min(capacity - model.len() as u64));
            for i in 0..pushed {
                let v = (next_value + i as u32) as f32;
                model.push_back((v, -v));
            }
            next_value += pushed as u32;

            let mut got = Vec::new();
            let n = ring.read_with(read, |_, l, r| got.push((l, r)));
            prop_assert_eq!(n, read.min(model.len()));
            let expected: Vec<_> = model.drain(..n).collect();
            prop_assert_eq!(got, expected);
            prop_assert_eq!(ring.used_frames(), model.len() as u64);
            prop_assert_eq!(ring.free_frames(), capacity - model.len() as u64);
        }
    }
}

#[test]
fn test_ring_returns_blocks_on_drop() {
    let pool = Arc::new(BufferPool::new(8, 256).unwrap());
    {
        // 100 frames x 8 bytes = 800 bytes = 4 blocks
        let ring = PcmRingBuffer::allocate(&pool, 100).unwrap();
        assert_eq!(ring.block_count(), 4);
        assert_eq!(pool.stats().lent, 4);
        let second = PcmRingBuffer::allocate(&pool, 100).unwrap();
        assert_eq!(second.block_count(), 4);
        assert!(matches!(
            PcmRingBuffer::allocate(&pool, 1),
            Err(EngineError::PoolExhausted(_))
        ));
    }
    let stats = pool.stats();
    assert_eq!(stats.lent, 0);
    assert_eq!(stats.idle, 8);
}

#[test]
fn test_ring_order_across_threads() {
    const FRAMES: u32 = 50_000;
    let pool = Arc::new(BufferPool::new(16, 1024).unwrap());
    let ring = Arc::new(PcmRingBuffer::allocate(&pool, 1000).unwrap());

    let producer = {
        let ring = Arc::clone(&ring);
        std::thread::spawn(move || {
            ring.register_producer(std::thread::current());
            let mut next = 0u32;
            while next < FRAMES {
                let end = (next + 333).min(FRAMES);
                let samples: Vec<f32> = (next..end).flat_map(|v| [v as f32, -(v as f32)]).collect();
                let mut offset = 0;
                while offset < samples.len() {
                    let pushed = ring.push_frames(&samples[offset..]);
                    offset += pushed * 2;
                    if pushed == 0 {
                        ring.wait_for_space(std::time::Duration::from_millis(10));
                    }
                }
                next = end;
            }
            ring.mark_decode_complete();
        })
    };

    let mut expected = 0u32;
    while !ring.is_drained() {
        ring.read_with(257, |_, l, r| {
            assert_eq!(l, expected as f32);
            assert_eq!(r, -(expected as f32));
            expected += 1;
        });
        std::thread::yield_now();
    }
    producer.join().unwrap();
    assert_eq!(expected, FRAMES);
    assert_eq!(ring.frames_written(), FRAMES as u64);
}
