use super::types::*;
use crate::acquisition::device::{sample_frequency, ChannelSelection};
use crate::acquisition::plan::{AcquisitionPlan, WORD_SIZE};
use crate::error_handling::types::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Capture configuration.
///
/// Holds everything needed to plan and run one capture: the capture request (duration,
/// clock divisor, active channels), the transfer geometry, the consumption mode and the
/// timing margins used by the event loop. It is read from a TOML file; every field is
/// optional and falls back to the acquisition box defaults.
///
/// # Examples
///
/// ```
/// use tixel_capture::configuration::config::Config;
///
/// let config = Config::from_toml_str("duration_secs = 2.0\nslot_count = 4").unwrap();
/// assert_eq!(config.slot_count, 4);
/// assert_eq!(config.sample_frequency(), 50_000.0);
/// ```
///
/// # Fields Overview
///
/// - `duration_secs`: capture length in seconds
/// - `clock_divisor`: sample clock is `500 kHz / (clock_divisor + 1)`
/// - `packet_size`: bytes per bulk transfer, defaults to 1 KiB per active microphone
/// - `slot_count`: number of transfers kept in flight
/// - `transfer_timeout_ms`: timeout of a regular transfer, the final one gets ten times more
/// - `endpoint`: bulk IN endpoint address
/// - `mode`: `file` or `live`
/// - `sample_format`: `int32` or `float32`
/// - `output_path`: capture file (file mode)
/// - `live_buffer_secs`: depth of the live circular buffer
/// - `packet_end_delay_ms`: wait before asking the device to flush its last packet
/// - `settle_delay_ms`: wait after init so the MEMS produce valid data
/// - `stall_timeout_ms`: watchdog window without packet progress
/// - `channels`: active microphones, analog inputs and counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub duration_secs: f64,
    pub clock_divisor: u8,
    pub packet_size: Option<usize>,
    pub slot_count: usize,
    pub transfer_timeout_ms: u64,
    pub endpoint: u8,
    pub mode: CaptureMode,
    pub sample_format: SampleFormat,
    pub output_path: PathBuf,
    pub live_buffer_secs: f64,
    pub packet_end_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub stall_timeout_ms: Option<u64>,
    pub channels: ChannelSelection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duration_secs: 1.0,
            clock_divisor: 9,
            packet_size: None,
            slot_count: 8,
            transfer_timeout_ms: 1000,
            endpoint: 0x82,
            mode: CaptureMode::File,
            sample_format: SampleFormat::Int32,
            output_path: PathBuf::from("capture.dat"),
            live_buffer_secs: 5.0,
            packet_end_delay_ms: 1000,
            settle_delay_ms: 1000,
            stall_timeout_ms: None,
            channels: ChannelSelection::default(),
        }
    }
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every parameter that can be checked without a device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_timeout_ms == 0 {
            return Err(ConfigError::NotInRange(
                "transfer_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.endpoint & 0x80 == 0 {
            return Err(ConfigError::NotInRange(format!(
                "endpoint 0x{:02X} is not an IN endpoint",
                self.endpoint
            )));
        }
        let plan = self.plan()?;
        if self.mode == CaptureMode::Live {
            let capacity = self.live_buffer_words(&plan);
            if capacity < plan.words_per_packet() {
                return Err(ConfigError::LiveBufferTooSmall {
                    capacity,
                    packet_words: plan.words_per_packet(),
                });
            }
        }
        Ok(())
    }

    pub fn sample_frequency(&self) -> f64 {
        sample_frequency(self.clock_divisor)
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
            .unwrap_or_else(|| self.channels.default_packet_size())
    }

    pub fn plan(&self) -> Result<AcquisitionPlan, ConfigError> {
        AcquisitionPlan::new(
            self.duration_secs,
            self.sample_frequency(),
            self.channels.channel_count(),
            self.packet_size(),
            self.slot_count,
        )
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn packet_end_delay(&self) -> Duration {
        Duration::from_millis(self.packet_end_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Watchdog window; by default long enough for the final transfer's extended timeout.
    pub fn stall_timeout(&self) -> Duration {
        match self.stall_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.transfer_timeout() * 11 + self.packet_end_delay(),
        }
    }

    /// Live buffer capacity in words: `live_buffer_secs` worth of tixels, rounded down
    /// to whole packets.
    pub fn live_buffer_words(&self, plan: &AcquisitionPlan) -> usize {
        let ideal = (self.live_buffer_secs.max(0.0) * plan.sample_frequency()).floor() as usize
            * plan.channel_count();
        let per_packet = plan.packet_size() / WORD_SIZE;
        (ideal / per_packet) * per_packet
    }
}
