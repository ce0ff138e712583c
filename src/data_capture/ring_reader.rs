use std::sync::Arc;

use log::trace;

use super::ring_buffer::{RingBuffer, RingStats};
use super::types::SampleBlock;

/// Consumer cursor over a live [`RingBuffer`].
///
/// Reads are non-blocking: a window is returned only when all of it is available,
/// otherwise `None` and the caller polls again later. Windows come out in write
/// order without overlap; data overwritten before it was read is skipped, never
/// returned twice.
pub struct RingReader {
    ring: Arc<RingBuffer>,
    sample_frequency: f64,
}

impl RingReader {
    pub fn new(ring: Arc<RingBuffer>, sample_frequency: f64) -> Self {
        Self {
            ring,
            sample_frequency,
        }
    }

    /// Next `floor(duration_secs × frequency)` tixels, if available.
    pub fn get_data(&mut self, duration_secs: f64) -> Option<SampleBlock> {
        let samples = (duration_secs.max(0.0) * self.sample_frequency).floor() as usize;
        self.get_samples(samples)
    }

    /// Next `samples` tixels, if available. A request larger than the address space
    /// is never available.
    pub fn get_samples(&mut self, samples: usize) -> Option<SampleBlock> {
        let channels = self.ring.channel_count();
        let words = self.ring.read(samples.checked_mul(channels)?)?;
        trace!("Live read of {} samples", samples);
        Some(SampleBlock::new(words, channels))
    }

    /// Whole tixels currently readable.
    pub fn available_samples(&self) -> usize {
        self.ring.unread() / self.ring.channel_count()
    }

    /// No more data will be written.
    pub fn is_done(&self) -> bool {
        self.ring.is_done()
    }

    /// The capture is over and not even one more tixel can be read.
    ///
    /// A partial window can still be left when this is false; drain it with
    /// [`RingReader::get_samples`] and [`RingReader::available_samples`] once
    /// [`RingReader::is_done`] holds.
    pub fn is_exhausted(&self) -> bool {
        self.ring.is_done() && self.available_samples() == 0
    }

    pub fn channel_count(&self) -> usize {
        self.ring.channel_count()
    }

    pub fn sample_frequency(&self) -> f64 {
        self.sample_frequency
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}
