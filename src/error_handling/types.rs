use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    NoChannels,
    BadPacketSize(usize),
    BadFrequency(f64),
    BadDuration(f64),
    EmptyCapture,
    NoSlots,
    LiveBufferTooSmall { capacity: usize, packet_words: usize },
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::NoChannels => write!(f, "No acquisition channel is active"),
            ConfigError::BadPacketSize(s) => {
                write!(f, "Packet size {} is not a non-zero multiple of 512 bytes", s)
            }
            ConfigError::BadFrequency(v) => write!(f, "Sample frequency {} Hz must be > 0", v),
            ConfigError::BadDuration(v) => write!(f, "Capture duration {} s must be > 0", v),
            ConfigError::EmptyCapture => write!(f, "Capture would contain no sample"),
            ConfigError::NoSlots => write!(f, "At least one transfer slot is required"),
            ConfigError::LiveBufferTooSmall {
                capacity,
                packet_words,
            } => write!(
                f,
                "Live buffer of {} words cannot hold one packet of {} words",
                capacity, packet_words
            ),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Per-slot transfer failure. Logged and the slot is retired; never fatal on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    SubmitFailed { slot: usize, reason: String },
    TimedOut { slot: usize, sequence: u64 },
    Cancelled { slot: usize, sequence: u64 },
    Failed { slot: usize, sequence: u64, reason: String },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::SubmitFailed { slot, reason } => {
                write!(f, "Submit failed on slot {}: {}", slot, reason)
            }
            TransferError::TimedOut { slot, sequence } => {
                write!(f, "Transfer of packet {} timed out on slot {}", sequence, slot)
            }
            TransferError::Cancelled { slot, sequence } => {
                write!(f, "Transfer of packet {} cancelled on slot {}", sequence, slot)
            }
            TransferError::Failed {
                slot,
                sequence,
                reason,
            } => write!(
                f,
                "Transfer of packet {} failed on slot {}: {}",
                sequence, slot, reason
            ),
        }
    }
}

impl std::error::Error for TransferError {}

#[derive(Debug)]
pub enum PersistenceError {
    CreateFailed(PathBuf, std::io::Error),
    WriteFailed(std::io::Error),
    FlushFailed(std::io::Error),
    ReadFailed(PathBuf, std::io::Error),
    MetadataFailed(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::CreateFailed(p, e) => {
                write!(f, "Unable to create {}: {}", p.display(), e)
            }
            PersistenceError::WriteFailed(e) => write!(f, "Capture write failed: {}", e),
            PersistenceError::FlushFailed(e) => write!(f, "Capture flush failed: {}", e),
            PersistenceError::ReadFailed(p, e) => write!(f, "Unable to read {}: {}", p.display(), e),
            PersistenceError::MetadataFailed(e) => write!(f, "Capture metadata error: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    CommandRejected { request: u8, reason: String },
    Disconnected,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::CommandRejected { request, reason } => {
                write!(f, "Device rejected command 0x{:02X}: {}", request, reason)
            }
            DeviceError::Disconnected => write!(f, "Device disconnected"),
        }
    }
}

impl std::error::Error for DeviceError {}

#[derive(Debug)]
pub enum AcquisitionError {
    Configuration(ConfigError),
    Persistence(PersistenceError),
    Device(DeviceError),
    Submit(TransferError),
    Stalled { num_pkt: u64, window: Duration },
    TransportClosed,
    InvalidState(String),
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AcquisitionError::Persistence(e) => write!(f, "Persistence error: {}", e),
            AcquisitionError::Device(e) => write!(f, "Device error: {}", e),
            AcquisitionError::Submit(e) => write!(f, "Transfer error: {}", e),
            AcquisitionError::Stalled { num_pkt, window } => write!(
                f,
                "Acquisition stalled at packet {} (no progress for {:?})",
                num_pkt, window
            ),
            AcquisitionError::TransportClosed => write!(f, "Transport completion queue closed"),
            AcquisitionError::InvalidState(e) => write!(f, "Invalid capture state: {}", e),
        }
    }
}

impl std::error::Error for AcquisitionError {}

impl From<ConfigError> for AcquisitionError {
    fn from(err: ConfigError) -> Self {
        AcquisitionError::Configuration(err)
    }
}

impl From<PersistenceError> for AcquisitionError {
    fn from(err: PersistenceError) -> Self {
        AcquisitionError::Persistence(err)
    }
}

impl From<DeviceError> for AcquisitionError {
    fn from(err: DeviceError) -> Self {
        AcquisitionError::Device(err)
    }
}

impl From<TransferError> for AcquisitionError {
    fn from(err: TransferError) -> Self {
        AcquisitionError::Submit(err)
    }
}
