//! Fixed set of in-flight bulk transfers.
//!
//! The [`TransferPool`] owns one contiguous arena of `effective_slot_count × packet_size`
//! bytes split into fixed-offset slots. Every slot is armed once by
//! [`TransferPool::submit_all`]; afterwards each completion is handled by
//! [`TransferPool::on_complete`], which hands the packet to the sink and decides whether
//! the slot is re-armed for the packet `effective_slot_count` positions further.
//!
//! Packet indices come from the running count of sunk packets (`num_pkt`), not from the
//! slot that produced them: bulk transfers complete in submission order, so the n-th
//! completion always carries packet n.
//!
//! Re-arm rule, for `next = num_pkt + effective_slot_count`:
//! - `next == total_packet_count - 1`: final packet, sized to its real length with ten
//!   times the timeout (the device flushes it only after the packet-end command).
//! - `next < total_packet_count - 1`: regular packet.
//! - otherwise, or while draining: the slot becomes terminal.

use std::time::Duration;

use log::{debug, trace, warn};
use uuid::Uuid;

use crate::acquisition::plan::AcquisitionPlan;
use crate::data_capture::sink::Sink;
use crate::error_handling::types::{PersistenceError, TransferError};

use super::transport::Transport;
use super::types::{PoolStats, SlotState, TransferCompletion, TransferRequest, TransferStatus};

/// Timeout multiplier of the transfer carrying the final packet.
pub const FINAL_TIMEOUT_FACTOR: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSlot {
    pub index: usize,
    /// Offset of the slot's region inside the arena.
    pub offset: usize,
    /// Packet index of the current or last transfer.
    pub sequence: u64,
    /// Requested length of the current or last transfer.
    pub len: usize,
    pub state: SlotState,
}

/// Position of the completion path in the packet stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCursor {
    /// Packets successfully handed to the sink.
    pub num_pkt: u64,
    /// Only the final packet is still outstanding.
    pub last_pkt: bool,
}

/// What `on_complete` did with a completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Sunk {
        packet_index: u64,
        len: usize,
        rearmed: bool,
    },
    Retired(TransferError),
    Ignored,
}

pub struct TransferPool {
    session_id: Uuid,
    plan: AcquisitionPlan,
    arena: Vec<u8>,
    slots: Vec<TransferSlot>,
    endpoint: u8,
    timeout: Duration,
    cursor: PacketCursor,
    draining: bool,
    sequence_skew: i64,
    stats: PoolStats,
}

impl TransferPool {
    pub fn new(session_id: Uuid, plan: &AcquisitionPlan, endpoint: u8, timeout: Duration) -> Self {
        let packet_size = plan.packet_size();
        let slots = (0..plan.effective_slot_count())
            .map(|index| TransferSlot {
                index,
                offset: index * packet_size,
                sequence: index as u64,
                len: packet_size,
                state: SlotState::Idle,
            })
            .collect();
        debug!(
            "[{}] Transfer pool: {} slot(s) × {} bytes, {} packet(s) planned",
            session_id,
            plan.effective_slot_count(),
            packet_size,
            plan.total_packet_count()
        );
        Self {
            session_id,
            plan: plan.clone(),
            arena: vec![0u8; plan.arena_size()],
            slots,
            endpoint,
            timeout,
            cursor: PacketCursor {
                num_pkt: 0,
                last_pkt: plan.total_packet_count() <= 1,
            },
            draining: false,
            sequence_skew: 0,
            stats: PoolStats::default(),
        }
    }

    /// Arms every slot for a `packet_size` read.
    ///
    /// A slot whose submission fails is retired. Returns the number of armed slots,
    /// or the first submission error when none could be armed.
    pub fn submit_all<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<usize, TransferError> {
        let mut armed = 0;
        let mut first_error = None;
        for slot in 0..self.slots.len() {
            match self.submit(transport, slot, slot as u64, self.plan.packet_size(), self.timeout) {
                Ok(()) => armed += 1,
                Err(e) => {
                    warn!("[{}] {}; slot retired", self.session_id, e);
                    self.retire(slot);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if armed == 0 => Err(e),
            _ => {
                debug!("[{}] {} slot(s) armed", self.session_id, armed);
                Ok(armed)
            }
        }
    }

    /// Handles one finished transfer: sinks its packet, then re-arms or retires the slot.
    ///
    /// Errors
    /// - Returns the sink's [`PersistenceError`]; the capture cannot recover from it.
    pub fn on_complete<T: Transport + ?Sized>(
        &mut self,
        completion: TransferCompletion,
        transport: &mut T,
        sink: &mut dyn Sink,
    ) -> Result<CompletionOutcome, PersistenceError> {
        let slot = completion.slot;
        match self.slots.get(slot) {
            Some(s) if s.state == SlotState::Submitted => {}
            _ => {
                warn!(
                    "[{}] Ignoring completion for slot {} which has no transfer in flight",
                    self.session_id, slot
                );
                return Ok(CompletionOutcome::Ignored);
            }
        }

        let failure = match completion.status {
            TransferStatus::Completed if completion.payload.is_empty() => {
                Some(TransferError::Failed {
                    slot,
                    sequence: completion.sequence,
                    reason: "empty transfer".to_string(),
                })
            }
            TransferStatus::Completed => None,
            TransferStatus::TimedOut => Some(TransferError::TimedOut {
                slot,
                sequence: completion.sequence,
            }),
            TransferStatus::Cancelled => Some(TransferError::Cancelled {
                slot,
                sequence: completion.sequence,
            }),
            TransferStatus::Error(reason) => Some(TransferError::Failed {
                slot,
                sequence: completion.sequence,
                reason,
            }),
        };
        if let Some(err) = failure {
            warn!(
                "[{}] {}; slot retired, {} slot(s) still in flight",
                self.session_id,
                err,
                self.in_flight() - 1
            );
            self.stats.failed_transfers += 1;
            self.retire(slot);
            return Ok(CompletionOutcome::Retired(err));
        }

        let packet_index = self.cursor.num_pkt;
        if packet_index >= self.plan.total_packet_count() {
            warn!(
                "[{}] Completion on slot {} past the final packet; dropped",
                self.session_id, slot
            );
            self.slots[slot].state = SlotState::Idle;
            return Ok(CompletionOutcome::Ignored);
        }
        let skew = completion.sequence as i64 - packet_index as i64;
        if skew != self.sequence_skew {
            warn!(
                "[{}] Slot {} carried request {} as packet {}; tail packets will be missing",
                self.session_id, slot, completion.sequence, packet_index
            );
            self.sequence_skew = skew;
        }

        let expected = self.plan.packet_len(packet_index);
        let len = completion.payload.len().min(expected);
        if len < expected {
            self.stats.short_packets += 1;
            warn!(
                "[{}] Packet {} is short: {} of {} bytes",
                self.session_id, packet_index, len, expected
            );
        }

        let offset = self.slots[slot].offset;
        let region = &mut self.arena[offset..offset + len];
        region.copy_from_slice(&completion.payload[..len]);
        sink.write(region, packet_index, self.plan.total_packet_count())?;
        trace!(
            "[{}] Packet {}/{} ({} bytes) from slot {} sunk to {}",
            self.session_id,
            packet_index + 1,
            self.plan.total_packet_count(),
            len,
            slot,
            sink.kind()
        );
        self.stats.packets_sunk += 1;
        self.stats.bytes_sunk += len as u64;
        self.slots[slot].state = SlotState::Completed;

        let rearmed = self.rearm(transport, slot, packet_index);

        self.cursor.num_pkt += 1;
        if self.cursor.num_pkt + 1 >= self.plan.total_packet_count() {
            self.cursor.last_pkt = true;
        }

        Ok(CompletionOutcome::Sunk {
            packet_index,
            len,
            rearmed,
        })
    }

    /// Stops all further re-arming. In-flight transfers are left to complete or time out.
    pub fn cancel_all(&mut self) {
        if !self.draining {
            debug!(
                "[{}] Pool draining, {} transfer(s) in flight",
                self.session_id,
                self.in_flight()
            );
        }
        self.draining = true;
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Submitted)
            .count()
    }

    pub fn num_pkt(&self) -> u64 {
        self.cursor.num_pkt
    }

    pub fn last_pkt(&self) -> bool {
        self.cursor.last_pkt
    }

    pub fn cursor(&self) -> PacketCursor {
        self.cursor
    }

    pub fn is_complete(&self) -> bool {
        self.cursor.num_pkt >= self.plan.total_packet_count()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn slots(&self) -> &[TransferSlot] {
        &self.slots
    }

    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    fn rearm<T: Transport + ?Sized>(&mut self, transport: &mut T, slot: usize, completed: u64) -> bool {
        if self.draining {
            self.slots[slot].state = SlotState::Cancelled;
            return false;
        }

        let next = completed + self.plan.effective_slot_count() as u64;
        let last = self.plan.total_packet_count() - 1;
        let (len, timeout) = if next == last {
            (
                self.plan.final_packet_len(),
                self.timeout * FINAL_TIMEOUT_FACTOR,
            )
        } else if next < last {
            (self.plan.packet_size(), self.timeout)
        } else {
            debug!("[{}] Slot {} done after packet {}", self.session_id, slot, completed);
            self.slots[slot].state = SlotState::Idle;
            return false;
        };

        match self.submit(transport, slot, next, len, timeout) {
            Ok(()) => {
                debug!(
                    "[{}] Slot {} re-armed for packet {} ({} bytes, {:?})",
                    self.session_id, slot, next, len, timeout
                );
                true
            }
            Err(e) => {
                warn!("[{}] {}; slot retired", self.session_id, e);
                self.retire(slot);
                false
            }
        }
    }

    fn submit<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        slot: usize,
        sequence: u64,
        len: usize,
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let request = TransferRequest {
            slot,
            sequence,
            offset: self.slots[slot].offset,
            len,
            endpoint: self.endpoint,
            timeout,
        };
        transport.submit(request)?;
        let s = &mut self.slots[slot];
        s.sequence = sequence;
        s.len = len;
        s.state = SlotState::Submitted;
        self.stats.submissions += 1;
        Ok(())
    }

    fn retire(&mut self, slot: usize) {
        self.slots[slot].state = SlotState::Cancelled;
        self.stats.retired_slots += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::CompletionReceiver;

    struct MockTransport {
        requests: Vec<TransferRequest>,
        reject: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                requests: Vec::new(),
                reject: false,
            }
        }
    }

    impl Transport for MockTransport {
        fn submit(&mut self, request: TransferRequest) -> Result<(), TransferError> {
            if self.reject {
                return Err(TransferError::SubmitFailed {
                    slot: request.slot,
                    reason: "endpoint stalled".to_string(),
                });
            }
            self.requests.push(request);
            Ok(())
        }

        fn take_completions(&mut self) -> Option<CompletionReceiver> {
            None
        }
    }

    #[derive(Default)]
    struct MemorySink {
        packets: Vec<(u64, Vec<u8>)>,
    }

    impl Sink for MemorySink {
        fn write(&mut self, packet: &[u8], packet_index: u64, _total: u64) -> Result<(), PersistenceError> {
            self.packets.push((packet_index, packet.to_vec()));
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "memory"
        }
    }

    fn done(slot: usize, sequence: u64, len: usize) -> TransferCompletion {
        TransferCompletion {
            slot,
            sequence,
            status: TransferStatus::Completed,
            payload: vec![sequence as u8; len],
        }
    }

    // 1 channel × 600 samples = 2400 bytes = 4 × 512 + 352
    fn five_packet_plan(slots: usize) -> AcquisitionPlan {
        AcquisitionPlan::new(1.0, 600.0, 1, 512, slots).unwrap()
    }

    fn pool(plan: &AcquisitionPlan) -> TransferPool {
        TransferPool::new(Uuid::new_v4(), plan, 0x82, Duration::from_millis(100))
    }

    #[test]
    fn test_submit_all_arms_every_slot() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();

        assert_eq!(pool.submit_all(&mut transport).unwrap(), 2);
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(transport.requests.len(), 2);
        assert_eq!(transport.requests[1].offset, 512);
        assert!(transport
            .requests
            .iter()
            .all(|r| r.len == 512 && r.timeout == Duration::from_millis(100) && r.endpoint == 0x82));
    }

    #[test]
    fn test_rearm_protocol_over_full_capture() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        let completions = [done(0, 0, 512), done(1, 1, 512), done(0, 2, 512), done(1, 3, 512), done(0, 4, 352)];
        let mut rearms = Vec::new();
        for c in completions {
            assert!(!pool.is_complete());
            match pool.on_complete(c, &mut transport, &mut sink).unwrap() {
                CompletionOutcome::Sunk { rearmed, .. } => rearms.push(rearmed),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(rearms, vec![true, true, true, false, false]);
        assert!(pool.is_complete());
        assert_eq!(pool.in_flight(), 0);

        let resubmitted: Vec<(u64, usize, Duration)> = transport.requests[2..]
            .iter()
            .map(|r| (r.sequence, r.len, r.timeout))
            .collect();
        assert_eq!(
            resubmitted,
            vec![
                (2, 512, Duration::from_millis(100)),
                (3, 512, Duration::from_millis(100)),
                (4, 352, Duration::from_millis(1000)),
            ]
        );

        let indices: Vec<u64> = sink.packets.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        let total: usize = sink.packets.iter().map(|(_, p)| p.len()).sum();
        assert_eq!(total as u64, plan.total_bytes());
        assert_eq!(pool.stats().bytes_sunk, 2400);
        assert_eq!(pool.stats().submissions, 5);
    }

    #[test]
    fn test_last_pkt_raised_when_only_final_packet_remains() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        for (i, slot) in [0usize, 1, 0].into_iter().enumerate() {
            pool.on_complete(done(slot, i as u64, 512), &mut transport, &mut sink).unwrap();
            assert!(!pool.last_pkt());
        }
        pool.on_complete(done(1, 3, 512), &mut transport, &mut sink).unwrap();
        assert!(pool.last_pkt());
        assert_eq!(pool.num_pkt(), 4);
    }

    #[test]
    fn test_single_packet_capture_starts_with_last_pkt() {
        let plan = AcquisitionPlan::new(1.0, 10.0, 1, 512, 8).unwrap();
        let pool = pool(&plan);
        assert_eq!(plan.effective_slot_count(), 1);
        assert!(pool.last_pkt());
    }

    #[test]
    fn test_final_packet_is_truncated_to_its_length() {
        // 1 channel × 300 samples = 1200 bytes = 512 + 512 + 176, 3 slots for 3 packets
        let plan = AcquisitionPlan::new(1.0, 300.0, 1, 512, 8).unwrap();
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        assert_eq!(pool.submit_all(&mut transport).unwrap(), 3);

        for i in 0..3u64 {
            pool.on_complete(done(i as usize, i, 512), &mut transport, &mut sink).unwrap();
        }
        assert_eq!(transport.requests.len(), 3);
        assert_eq!(sink.packets[2].1.len(), 176);
        assert_eq!(pool.stats().short_packets, 0);
        assert!(pool.is_complete());
    }

    #[test]
    fn test_exact_division_never_writes_empty_packet() {
        // 2 channels × 256 samples = 2048 bytes = 4 × 512
        let plan = AcquisitionPlan::new(1.0, 256.0, 2, 512, 2).unwrap();
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        for i in 0..4u64 {
            pool.on_complete(done((i % 2) as usize, i, 512), &mut transport, &mut sink).unwrap();
        }
        let last = transport.requests.last().unwrap();
        assert_eq!((last.sequence, last.len), (3, 512));
        assert_eq!(last.timeout, Duration::from_millis(1000));
        assert!(sink.packets.iter().all(|(_, p)| p.len() == 512));
        assert!(pool.is_complete());
    }

    #[test]
    fn test_failed_transfer_retires_slot() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        let timed_out = TransferCompletion {
            slot: 0,
            sequence: 0,
            status: TransferStatus::TimedOut,
            payload: Vec::new(),
        };
        let outcome = pool.on_complete(timed_out, &mut transport, &mut sink).unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Retired(TransferError::TimedOut { slot: 0, sequence: 0 })
        );
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.slots()[0].state, SlotState::Cancelled);
        assert_eq!(pool.num_pkt(), 0);
        assert_eq!(transport.requests.len(), 2);

        let errored = TransferCompletion {
            slot: 1,
            sequence: 1,
            status: TransferStatus::Error("pipe".to_string()),
            payload: Vec::new(),
        };
        pool.on_complete(errored, &mut transport, &mut sink).unwrap();
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.stats().failed_transfers, 2);
        assert_eq!(pool.stats().retired_slots, 2);
        assert!(sink.packets.is_empty());
    }

    #[test]
    fn test_empty_completion_is_a_failure() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        let outcome = pool.on_complete(done(0, 0, 0), &mut transport, &mut sink).unwrap();
        assert!(matches!(outcome, CompletionOutcome::Retired(TransferError::Failed { .. })));
        assert!(sink.packets.is_empty());
    }

    #[test]
    fn test_cancel_all_stops_rearming() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        pool.on_complete(done(0, 0, 512), &mut transport, &mut sink).unwrap();
        pool.cancel_all();
        assert!(pool.is_draining());
        let outcome = pool.on_complete(done(1, 1, 512), &mut transport, &mut sink).unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Sunk { packet_index: 1, len: 512, rearmed: false }
        );
        pool.on_complete(done(0, 2, 512), &mut transport, &mut sink).unwrap();

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.num_pkt(), 3);
        assert_eq!(transport.requests.len(), 3);
        assert!(!pool.is_complete());
    }

    #[test]
    fn test_spurious_completion_is_ignored() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();

        let outcome = pool.on_complete(done(0, 0, 512), &mut transport, &mut sink).unwrap();
        assert_eq!(outcome, CompletionOutcome::Ignored);
        let outcome = pool.on_complete(done(7, 0, 512), &mut transport, &mut sink).unwrap();
        assert_eq!(outcome, CompletionOutcome::Ignored);
        assert!(sink.packets.is_empty());
    }

    #[test]
    fn test_rejected_submissions() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        transport.reject = true;
        assert!(matches!(
            pool.submit_all(&mut transport),
            Err(TransferError::SubmitFailed { slot: 0, .. })
        ));
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.stats().retired_slots, 2);
    }

    #[test]
    fn test_rearm_failure_retires_slot() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        transport.reject = true;
        let outcome = pool.on_complete(done(0, 0, 512), &mut transport, &mut sink).unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Sunk { packet_index: 0, len: 512, rearmed: false }
        );
        assert_eq!(pool.slots()[0].state, SlotState::Cancelled);
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_short_packet_is_counted() {
        let plan = five_packet_plan(2);
        let mut pool = pool(&plan);
        let mut transport = MockTransport::new();
        let mut sink = MemorySink::default();
        pool.submit_all(&mut transport).unwrap();

        pool.on_complete(done(0, 0, 100), &mut transport, &mut sink).unwrap();
        assert_eq!(pool.stats().short_packets, 1);
        assert_eq!(sink.packets[0].1.len(), 100);
    }
}
