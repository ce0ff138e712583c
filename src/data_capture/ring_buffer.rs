//! Fixed-capacity circular buffer of sample words for live consumption.
//!
//! One writer (the completion path, through [`RingBufferSink`]) appends words; one
//! reader ([`RingReader`](super::ring_reader::RingReader)) removes fully available
//! blocks in write order. The writer never waits for the reader: when a write does
//! not fit before the end of the array it wraps to index 0 and overwrites the oldest
//! unread words. Overwritten data is dropped from the front of the unread stream,
//! rounded up to a whole tixel so that the reader stays channel-aligned.
//!
//! Unread data is tracked as an explicit [`RingState`]:
//! - `Empty`
//! - `Contiguous { lo, hi }`: words `[lo, hi)`
//! - `Wrapped { lo, boundary, hi }`: words `[lo, boundary)` followed by `[0, hi)`,
//!   where `boundary` is the write cursor recorded at the last wrap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::acquisition::plan::WORD_SIZE;
use crate::error_handling::types::PersistenceError;

use super::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Empty,
    Contiguous { lo: usize, hi: usize },
    Wrapped { lo: usize, boundary: usize, hi: usize },
}

impl RingState {
    fn unread(&self) -> usize {
        match *self {
            RingState::Empty => 0,
            RingState::Contiguous { lo, hi } => hi - lo,
            RingState::Wrapped { lo, boundary, hi } => (boundary - lo) + hi,
        }
    }

    /// Removes `count` words from the front of the unread stream.
    fn discard_front(self, count: usize) -> RingState {
        match self {
            RingState::Empty => RingState::Empty,
            RingState::Contiguous { lo, hi } => {
                let lo = (lo + count).min(hi);
                if lo == hi {
                    RingState::Empty
                } else {
                    RingState::Contiguous { lo, hi }
                }
            }
            RingState::Wrapped { lo, boundary, hi } => {
                if count < boundary - lo {
                    RingState::Wrapped {
                        lo: lo + count,
                        boundary,
                        hi,
                    }
                } else {
                    RingState::Contiguous { lo: 0, hi }.discard_front(count - (boundary - lo))
                }
            }
        }
    }
}

/// Snapshot of the ring counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStats {
    pub capacity: usize,
    pub total_written: u64,
    pub total_read: u64,
    pub unread: usize,
    /// Writes that overwrote unread data.
    pub dropped_blocks: u64,
    /// Whole tixels lost to overwrites.
    pub dropped_samples: u64,
    pub wraps: u64,
    pub wrapped: bool,
}

#[derive(Debug)]
struct RingInner {
    data: Vec<i32>,
    state: RingState,
    write_cursor: usize,
    total_written: u64,
    total_read: u64,
    dropped_words: u64,
    dropped_blocks: u64,
    wraps: u64,
}

impl RingInner {
    // Absolute stream position of the first unread word.
    fn read_position(&self) -> u64 {
        self.total_read + self.dropped_words
    }

    fn drop_front(&mut self, count: usize) {
        let count = count.min(self.state.unread());
        self.state = self.state.discard_front(count);
        self.dropped_words += count as u64;
    }

    fn append(&mut self, words: &[i32], channel_count: usize) -> usize {
        let capacity = self.data.len();
        let n = words.len();
        let w = self.write_cursor;
        let unread_before = self.state.unread();

        let wrap = w + n > capacity;
        let overwritten = if wrap {
            match self.state {
                RingState::Empty => 0,
                RingState::Contiguous { lo, hi } => n.saturating_sub(lo).min(hi - lo),
                RingState::Wrapped { lo, boundary, hi } => (boundary - lo) + n.min(hi),
            }
        } else {
            match self.state {
                RingState::Wrapped { lo, boundary, .. } => (w + n).saturating_sub(lo).min(boundary - lo),
                _ => 0,
            }
        };
        self.drop_front(overwritten);

        let start = if wrap { 0 } else { w };
        self.data[start..start + n].copy_from_slice(words);
        self.state = match (self.state, wrap) {
            (RingState::Empty, true) => RingState::Contiguous { lo: 0, hi: n },
            (RingState::Empty, false) => RingState::Contiguous { lo: w, hi: w + n },
            (RingState::Contiguous { lo, .. }, true) => RingState::Wrapped {
                lo,
                boundary: w,
                hi: n,
            },
            (RingState::Contiguous { lo, .. }, false) => RingState::Contiguous { lo, hi: w + n },
            (RingState::Wrapped { lo, boundary, .. }, false) => RingState::Wrapped {
                lo,
                boundary,
                hi: w + n,
            },
            // not reached: a wrap discards the old tail first
            (RingState::Wrapped { lo, .. }, true) => RingState::Wrapped {
                lo,
                boundary: w,
                hi: n,
            },
        };
        self.write_cursor = start + n;
        self.total_written += n as u64;
        if wrap {
            self.wraps += 1;
        }

        if overwritten > 0 {
            let misaligned = (self.read_position() % channel_count as u64) as usize;
            if misaligned != 0 {
                self.drop_front(channel_count - misaligned);
            }
            self.dropped_blocks += 1;
        }
        unread_before + n - self.state.unread()
    }

    fn take(&mut self, count: usize) -> Vec<i32> {
        let mut out = Vec::with_capacity(count);
        match self.state {
            RingState::Empty => {}
            RingState::Contiguous { lo, .. } => out.extend_from_slice(&self.data[lo..lo + count]),
            RingState::Wrapped { lo, boundary, .. } => {
                let tail = (boundary - lo).min(count);
                out.extend_from_slice(&self.data[lo..lo + tail]);
                out.extend_from_slice(&self.data[..count - tail]);
            }
        }
        self.state = self.state.discard_front(count);
        self.total_read += count as u64;
        out
    }
}

/// Circular word buffer shared by the live sink and its reader.
#[derive(Debug)]
pub struct RingBuffer {
    channel_count: usize,
    inner: Mutex<RingInner>,
    done: AtomicBool,
}

impl RingBuffer {
    /// `capacity` and `channel_count` are in words and must be non-zero.
    pub fn new(capacity: usize, channel_count: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channel_count: channel_count.max(1),
            inner: Mutex::new(RingInner {
                data: vec![0; capacity],
                state: RingState::Empty,
                write_cursor: 0,
                total_written: 0,
                total_read: 0,
                dropped_words: 0,
                dropped_blocks: 0,
                wraps: 0,
            }),
            done: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Appends words, overwriting the oldest unread ones when full. Returns the number
    /// of unread words dropped.
    pub fn write(&self, words: &[i32]) -> usize {
        let mut inner = self.lock();
        let capacity = inner.data.len();
        let mut dropped = 0;
        for chunk in words.chunks(capacity) {
            dropped += inner.append(chunk, self.channel_count);
        }
        dropped
    }

    /// Removes exactly `count` words in write order, or nothing if fewer are unread.
    pub fn read(&self, count: usize) -> Option<Vec<i32>> {
        let mut inner = self.lock();
        if inner.state.unread() < count {
            return None;
        }
        Some(inner.take(count))
    }

    pub fn unread(&self) -> usize {
        self.lock().state.unread()
    }

    pub fn state(&self) -> RingState {
        self.lock().state
    }

    /// No more data will be written.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RingStats {
        let inner = self.lock();
        RingStats {
            capacity: inner.data.len(),
            total_written: inner.total_written,
            total_read: inner.total_read,
            unread: inner.state.unread(),
            dropped_blocks: inner.dropped_blocks,
            dropped_samples: inner.dropped_words / self.channel_count as u64,
            wraps: inner.wraps,
            wrapped: matches!(inner.state, RingState::Wrapped { .. }),
        }
    }
}

/// Sink decoding packets into little-endian `i32` words and appending them to a ring.
///
/// Packet boundaries need not fall on word boundaries; a partial trailing word is
/// carried over to the next packet.
pub struct RingBufferSink {
    ring: Arc<RingBuffer>,
    carry: Vec<u8>,
    words: Vec<i32>,
}

impl RingBufferSink {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self {
            ring,
            carry: Vec::with_capacity(WORD_SIZE),
            words: Vec::new(),
        }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }
}

impl Sink for RingBufferSink {
    fn write(
        &mut self,
        packet: &[u8],
        packet_index: u64,
        _total_packets: u64,
    ) -> Result<(), PersistenceError> {
        self.words.clear();
        let mut rest = packet;
        if !self.carry.is_empty() {
            let missing = (WORD_SIZE - self.carry.len()).min(rest.len());
            self.carry.extend_from_slice(&rest[..missing]);
            rest = &rest[missing..];
            if self.carry.len() == WORD_SIZE {
                self.words.push(i32::from_le_bytes([
                    self.carry[0],
                    self.carry[1],
                    self.carry[2],
                    self.carry[3],
                ]));
                self.carry.clear();
            }
        }
        let chunks = rest.chunks_exact(WORD_SIZE);
        self.carry.extend_from_slice(chunks.remainder());
        self.words
            .extend(chunks.map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]])));

        let dropped = self.ring.write(&self.words);
        if dropped > 0 {
            warn!(
                "Live buffer overrun at packet {}: {} unread words dropped",
                packet_index, dropped
            );
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PersistenceError> {
        if !self.carry.is_empty() {
            warn!("Live stream ended on a partial word ({} bytes)", self.carry.len());
        }
        self.ring.mark_done();
        debug!("Live buffer closed: {:?}", self.ring.stats());
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "ring"
    }
}
