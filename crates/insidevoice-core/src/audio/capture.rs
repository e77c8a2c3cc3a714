//! Audio block acquisition
//!
//! The monitor pulls fixed-size blocks through [`BlockSource`], blocking until
//! the next one is ready. Blocks come from a small fixed pool and go back to it
//! when dropped, so the acquisition path does not allocate once running.
//!
//! [`RingCapture`] adapts a push-style microphone callback: the callback owns a
//! [`SampleProducer`] and pushes into a lock-free ring, the monitor thread owns
//! the consumer side and slices it into blocks.

use crossbeam_channel::{Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of pooled block buffers
pub const POOL_BLOCKS: usize = 4;

/// How long a read waits for a full block before giving up
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between ring occupancy checks while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Errors that can occur while acquiring a block
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Timed out after {0:?} waiting for audio block")]
    Timeout(Duration),

    #[error("No free block buffer in pool")]
    PoolExhausted,

    #[error("Audio source closed")]
    Closed,
}

/// Blocking source of audio blocks (signed 16-bit mono)
pub trait BlockSource: Send {
    /// Wait for and return the next block.
    ///
    /// The returned block is released back to its pool when dropped.
    fn read_block(&mut self) -> Result<Block, CaptureError>;
}

/// One block of samples, returned to its pool on drop
#[derive(Debug)]
pub struct Block {
    samples: Vec<i16>,
    pool: Option<Sender<Vec<i16>>>,
}

impl Block {
    /// A block that does not belong to any pool
    pub fn detached(samples: Vec<i16>) -> Self {
        Self {
            samples,
            pool: None,
        }
    }

    /// Samples held by this block
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub(crate) fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }
}

impl Deref for Block {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        &self.samples
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = pool.try_send(std::mem::take(&mut self.samples));
        }
    }
}

/// Fixed pool of reusable block buffers
#[derive(Debug, Clone)]
pub struct BlockPool {
    free_tx: Sender<Vec<i16>>,
    free_rx: Receiver<Vec<i16>>,
    block_samples: usize,
}

impl BlockPool {
    /// Create a pool of `blocks` buffers, each `block_samples` long
    pub fn new(blocks: usize, block_samples: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(blocks);
        for _ in 0..blocks {
            let _ = free_tx.try_send(vec![0i16; block_samples]);
        }
        Self {
            free_tx,
            free_rx,
            block_samples,
        }
    }

    /// Take a free buffer, if any
    pub fn acquire(&self) -> Option<Block> {
        let mut samples = self.free_rx.try_recv().ok()?;
        samples.resize(self.block_samples, 0);
        Some(Block {
            samples,
            pool: Some(self.free_tx.clone()),
        })
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Samples per block
    pub fn block_samples(&self) -> usize {
        self.block_samples
    }
}

/// Producer half handed to the microphone callback
pub struct SampleProducer {
    producer: HeapProd<i16>,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl SampleProducer {
    /// Push samples into the ring; returns how many were accepted.
    ///
    /// Samples that do not fit are counted as dropped (overrun).
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let pushed = self.producer.push_slice(samples);
        if pushed < samples.len() {
            self.dropped
                .fetch_add((samples.len() - pushed) as u64, Ordering::Relaxed);
        }
        pushed
    }

    /// Total samples dropped because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SampleProducer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Ring-backed [`BlockSource`] fed by a [`SampleProducer`]
pub struct RingCapture {
    consumer: HeapCons<i16>,
    pool: BlockPool,
    timeout: Duration,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl RingCapture {
    /// Create a producer/capture pair
    ///
    /// # Arguments
    /// * `ring_samples` - Ring capacity in samples
    /// * `block_samples` - Samples per delivered block
    pub fn new(ring_samples: usize, block_samples: usize) -> (SampleProducer, Self) {
        let (producer, consumer) = HeapRb::<i16>::new(ring_samples).split();
        let dropped = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let producer = SampleProducer {
            producer,
            dropped: Arc::clone(&dropped),
            closed: Arc::clone(&closed),
        };
        let capture = Self {
            consumer,
            pool: BlockPool::new(POOL_BLOCKS, block_samples),
            timeout: DEFAULT_READ_TIMEOUT,
            dropped,
            closed,
        };
        (producer, capture)
    }

    /// Override the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Samples waiting in the ring
    pub fn buffered(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Samples lost to ring overruns
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl BlockSource for RingCapture {
    fn read_block(&mut self) -> Result<Block, CaptureError> {
        let needed = self.pool.block_samples();
        let deadline = Instant::now() + self.timeout;

        loop {
            if self.consumer.occupied_len() >= needed {
                let mut block = self.pool.acquire().ok_or(CaptureError::PoolExhausted)?;
                self.consumer.pop_slice(block.samples_mut());
                return Ok(block);
            }

            if self.closed.load(Ordering::Acquire) {
                return Err(CaptureError::Closed);
            }

            if Instant::now() >= deadline {
                return Err(CaptureError::Timeout(self.timeout));
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
