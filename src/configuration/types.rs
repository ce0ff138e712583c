use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Where completed packets go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Append every packet to the output file.
    #[default]
    File,
    /// Keep the most recent samples in a circular buffer for a live reader.
    Live,
}

/// Encoding of the 32-bit words produced by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    #[default]
    Int32,
    Float32,
}

impl SampleFormat {
    /// Value of the data-width selection command.
    pub fn code(self) -> u8 {
        match self {
            SampleFormat::Int32 => 0x00,
            SampleFormat::Float32 => 0x01,
        }
    }
}
