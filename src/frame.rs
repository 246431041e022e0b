//! Decoded frames and the bounded hand-off channel.
//!
//! - `Frame`: one decoded image unit. Not `Clone`; ownership moves from the
//!   producer into the channel and from the channel to the consumer.
//! - `FrameChannel`: bounded FIFO shared by one producer and one consumer.
//!   A push onto a full channel evicts the oldest frame first, so the producer
//!   never blocks and the consumer always sees the most recent frames.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default frame channel capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 2;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Pixel layout of a decoded frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Rgb24,
    Bgr24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One decoded frame.
///
/// There is intentionally no `Clone` impl: a frame has exactly one owner at a
/// time (decoder, channel, or consumer).
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Per-decoder sequence number, starting at 1.
    pub sequence: u64,

    decoded_at: Instant,
}

impl Frame {
    /// Wrap a decoded pixel buffer. Called by `FrameDecoder` implementations.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            format,
            sequence,
            decoded_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel access for overlay drawing by the consumer.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Time since the decoder produced this frame.
    pub fn age(&self) -> Duration {
        self.decoded_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameChannel: bounded drop-oldest queue
// ----------------------------------------------------------------------------

struct ChannelState {
    frames: VecDeque<Frame>,
    evicted: u64,
}

/// Bounded frame queue with drop-oldest overflow.
///
/// `push` never waits. `pull_timeout` waits at most the given duration.
/// Each operation holds the lock only for the queue mutation itself.
pub struct FrameChannel {
    state: Mutex<ChannelState>,
    ready: Condvar,
    capacity: usize,
}

impl FrameChannel {
    /// Create a channel. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(ChannelState {
                frames: VecDeque::with_capacity(capacity),
                evicted: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a frame, evicting the oldest one when full.
    ///
    /// Returns `true` if a frame was evicted to make room.
    pub fn push(&self, frame: Frame) -> bool {
        let mut evicted = None;
        {
            let mut state = self.lock();
            if state.frames.len() >= self.capacity {
                evicted = state.frames.pop_front();
                state.evicted += 1;
            }
            state.frames.push_back(frame);
        }
        self.ready.notify_one();
        // Evicted pixel buffers are freed outside the lock.
        let was_full = evicted.is_some();
        drop(evicted);
        was_full
    }

    /// Dequeue the oldest frame, waiting up to `timeout` for one to arrive.
    pub fn pull_timeout(&self, timeout: Duration) -> Option<Frame> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| state.frames.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.frames.pop_front()
    }

    /// Dequeue the oldest frame without waiting.
    pub fn try_pull(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    /// Drop all buffered frames. Returns how many were released.
    pub fn clear(&self) -> usize {
        let drained: Vec<Frame> = self.lock().frames.drain(..).collect();
        drained.len()
    }

    // The queue is valid after any panic mid-operation, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
