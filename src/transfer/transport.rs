use crate::error_handling::types::TransferError;

use super::types::{CompletionReceiver, TransferRequest};

/// Asynchronous bulk transport.
///
/// `submit` only queues the read; the outcome is posted later, in submission order,
/// on the completion queue obtained once through `take_completions`. The capture
/// session drains that queue from a single task, so completions are never handled
/// concurrently.
pub trait Transport: Send {
    fn submit(&mut self, request: TransferRequest) -> Result<(), TransferError>;

    /// Hands over the completion queue. Returns `None` once it has been taken.
    fn take_completions(&mut self) -> Option<CompletionReceiver>;
}
