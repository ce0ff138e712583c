//! Common data types used across the data_capture subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acquisition::plan::AcquisitionPlan;
use crate::configuration::types::CaptureMode;
use crate::transfer::types::PoolStats;

use super::ring_buffer::RingStats;

/// Block of tixels, row-major: `samples × channel_count` words in device write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBlock {
    words: Vec<i32>,
    channel_count: usize,
}

impl SampleBlock {
    /// Trailing words that do not form a whole tixel are discarded.
    pub fn new(mut words: Vec<i32>, channel_count: usize) -> Self {
        let channel_count = channel_count.max(1);
        words.truncate(words.len() - words.len() % channel_count);
        Self {
            words,
            channel_count,
        }
    }

    pub fn samples(&self) -> usize {
        self.words.len() / self.channel_count
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// All channels of tixel `t`.
    pub fn row(&self, t: usize) -> Option<&[i32]> {
        let start = t.checked_mul(self.channel_count)?;
        self.words.get(start..start + self.channel_count)
    }

    pub fn get(&self, t: usize, channel: usize) -> Option<i32> {
        if channel >= self.channel_count {
            return None;
        }
        self.row(t).map(|row| row[channel])
    }

    /// One channel across the whole block.
    pub fn channel(&self, channel: usize) -> Option<Vec<i32>> {
        if channel >= self.channel_count {
            return None;
        }
        Some(
            self.words
                .chunks_exact(self.channel_count)
                .map(|row| row[channel])
                .collect(),
        )
    }

    pub fn as_words(&self) -> &[i32] {
        &self.words
    }

    pub fn into_words(self) -> Vec<i32> {
        self.words
    }
}

/// How a capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Every planned packet reached the sink.
    Complete,
    /// Packets are missing although nobody asked to stop: some transfers failed.
    Partial,
    /// Stopped on request before the end.
    Stopped,
    /// Live capture ended as soon as the final packet was requested.
    LiveFinished,
}

/// Summary of one capture, persisted next to the data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub session_id: Uuid,
    pub mode: CaptureMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub plan: AcquisitionPlan,
    pub expected_packets: u64,
    pub received_packets: u64,
    pub expected_bytes: u64,
    pub received_bytes: u64,
    pub stats: PoolStats,
    /// Transfers still in flight when a live capture was closed.
    pub abandoned_slots: usize,
    pub ring: Option<RingStats>,
    pub outcome: CaptureOutcome,
}

impl CaptureReport {
    pub fn missing_packets(&self) -> u64 {
        self.expected_packets.saturating_sub(self.received_packets)
    }

    pub fn missing_bytes(&self) -> u64 {
        self.expected_bytes.saturating_sub(self.received_bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == CaptureOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_block_layout() {
        let block = SampleBlock::new((0..12).collect(), 3);
        assert_eq!(block.samples(), 4);
        assert_eq!(block.channel_count(), 3);
        assert_eq!(block.row(1), Some(&[3, 4, 5][..]));
        assert_eq!(block.row(4), None);
        assert_eq!(block.get(2, 1), Some(7));
        assert_eq!(block.get(0, 3), None);
        assert_eq!(block.channel(2), Some(vec![2, 5, 8, 11]));
        assert_eq!(block.channel(5), None);
    }

    #[test]
    fn test_partial_tixel_is_dropped() {
        let block = SampleBlock::new((0..7).collect(), 3);
        assert_eq!(block.samples(), 2);
        assert_eq!(block.as_words(), &[0, 1, 2, 3, 4, 5]);

        let empty = SampleBlock::new(Vec::new(), 4);
        assert!(empty.is_empty());
        assert_eq!(empty.samples(), 0);
    }

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(
            serde_json::to_string(&CaptureOutcome::LiveFinished).unwrap(),
            "\"live_finished\""
        );
        let back: CaptureOutcome = serde_json::from_str("\"partial\"").unwrap();
        assert_eq!(back, CaptureOutcome::Partial);
    }
}
