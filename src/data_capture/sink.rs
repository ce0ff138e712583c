use crate::error_handling::types::PersistenceError;

/// Consumer of completed packets.
///
/// `write` is called exactly once per completed packet, in strictly increasing
/// `packet_index` order, from the completion path. Implementations must not block
/// for longer than a transfer timeout or the pipeline stalls.
pub trait Sink: Send {
    fn write(
        &mut self,
        packet: &[u8],
        packet_index: u64,
        total_packets: u64,
    ) -> Result<(), PersistenceError>;

    /// Called once after the last packet.
    fn finish(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Stable name used in logs.
    fn kind(&self) -> &'static str;
}
