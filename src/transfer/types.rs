//! Common data types used across the transfer subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Final status of one asynchronous transfer, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    Error(String),
}

/// Lifecycle of a transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// Not armed yet, or terminal after its last packet.
    Idle,
    /// A transfer is in flight.
    Submitted,
    /// Its last transfer completed and it is waiting to be re-armed.
    Completed,
    /// Retired after a failure, or left un-armed because the capture is draining.
    Cancelled,
}

/// Read request handed to the transport for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub slot: usize,
    /// Index of the packet this transfer is expected to carry.
    pub sequence: u64,
    /// Byte offset of the slot's region inside the transfer arena.
    pub offset: usize,
    pub len: usize,
    pub endpoint: u8,
    pub timeout: Duration,
}

/// Completion event posted by the transport once a transfer finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub slot: usize,
    pub sequence: u64,
    pub status: TransferStatus,
    /// Bytes actually transferred; may be shorter than requested.
    pub payload: Vec<u8>,
}

impl TransferCompletion {
    pub fn bytes_transferred(&self) -> usize {
        self.payload.len()
    }
}

pub type CompletionSender = UnboundedSender<TransferCompletion>;
pub type CompletionReceiver = UnboundedReceiver<TransferCompletion>;

/// Counters maintained by the transfer pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub submissions: u64,
    pub packets_sunk: u64,
    pub bytes_sunk: u64,
    pub failed_transfers: u64,
    pub retired_slots: u64,
    pub short_packets: u64,
}
