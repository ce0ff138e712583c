//! Timing and sizing parameters of one capture.
//!
//! An [`AcquisitionPlan`] is computed once from the capture request (duration,
//! clock-derived sample frequency, active channel count) and the transfer geometry
//! (packet size, requested number of in-flight slots). It never changes afterwards:
//! the transfer pool, the sinks and the live reader all size themselves from it.
//!
//! The device clocks out exactly `total_bytes`, which rarely divides evenly into
//! `packet_size`. The final packet therefore carries `last_packet_size` bytes, except
//! when the division is exact, in which case it is a regular full-size packet.

use serde::{Deserialize, Serialize};

use crate::error_handling::types::ConfigError;

/// Size in bytes of one sample word on the wire.
pub const WORD_SIZE: usize = 4;

/// Bulk transfers must be sized in multiples of this many bytes.
pub const PACKET_ALIGNMENT: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    duration: f64,
    sample_frequency: f64,
    channel_count: usize,
    packet_size: usize,
    requested_slot_count: usize,
    total_samples: u64,
    total_bytes: u64,
    total_packet_count: u64,
    last_packet_size: usize,
    effective_slot_count: usize,
}

impl AcquisitionPlan {
    /// Computes the plan.
    ///
    /// Errors
    /// - [`ConfigError::NoChannels`] when `channel_count` is 0.
    /// - [`ConfigError::BadPacketSize`] unless `packet_size` is a non-zero multiple of 512.
    /// - [`ConfigError::BadFrequency`] when the frequency is not strictly positive.
    /// - [`ConfigError::BadDuration`] / [`ConfigError::EmptyCapture`] when no sample
    ///   would be captured.
    /// - [`ConfigError::NoSlots`] when no transfer slot is requested.
    pub fn new(
        duration: f64,
        sample_frequency: f64,
        channel_count: usize,
        packet_size: usize,
        requested_slot_count: usize,
    ) -> Result<Self, ConfigError> {
        if channel_count == 0 {
            return Err(ConfigError::NoChannels);
        }
        if packet_size == 0 || packet_size % PACKET_ALIGNMENT != 0 {
            return Err(ConfigError::BadPacketSize(packet_size));
        }
        if !(sample_frequency > 0.0) || !sample_frequency.is_finite() {
            return Err(ConfigError::BadFrequency(sample_frequency));
        }
        if !(duration > 0.0) || !duration.is_finite() {
            return Err(ConfigError::BadDuration(duration));
        }
        if requested_slot_count == 0 {
            return Err(ConfigError::NoSlots);
        }

        let total_samples = (duration * sample_frequency).floor() as u64;
        if total_samples == 0 {
            return Err(ConfigError::EmptyCapture);
        }
        let total_bytes = (WORD_SIZE * channel_count) as u64 * total_samples;
        let packet = packet_size as u64;
        let total_packet_count = total_bytes.div_ceil(packet);
        let last_packet_size = (total_bytes % packet) as usize;
        // A very short capture must not allocate more slots than it has packets.
        let effective_slot_count = (requested_slot_count as u64).min(total_packet_count) as usize;

        Ok(Self {
            duration,
            sample_frequency,
            channel_count,
            packet_size,
            requested_slot_count,
            total_samples,
            total_bytes,
            total_packet_count,
            last_packet_size,
            effective_slot_count,
        })
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn sample_frequency(&self) -> f64 {
        self.sample_frequency
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn requested_slot_count(&self) -> usize {
        self.requested_slot_count
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_packet_count(&self) -> u64 {
        self.total_packet_count
    }

    /// `total_bytes mod packet_size`; 0 means the final packet is full-size.
    pub fn last_packet_size(&self) -> usize {
        self.last_packet_size
    }

    pub fn effective_slot_count(&self) -> usize {
        self.effective_slot_count
    }

    /// Byte length of the final packet. Never zero.
    pub fn final_packet_len(&self) -> usize {
        if self.last_packet_size == 0 {
            self.packet_size
        } else {
            self.last_packet_size
        }
    }

    pub fn is_final_packet(&self, index: u64) -> bool {
        index + 1 == self.total_packet_count
    }

    /// Byte length carried by the packet at `index`.
    pub fn packet_len(&self, index: u64) -> usize {
        if self.is_final_packet(index) {
            self.final_packet_len()
        } else {
            self.packet_size
        }
    }

    /// Slot that carries the packet at `index`.
    pub fn slot_for(&self, index: u64) -> usize {
        (index % self.effective_slot_count as u64) as usize
    }

    /// Size of the contiguous transfer arena, `effective_slot_count × packet_size`.
    pub fn arena_size(&self) -> usize {
        self.effective_slot_count * self.packet_size
    }

    pub fn words_per_packet(&self) -> usize {
        self.packet_size / WORD_SIZE
    }
}
