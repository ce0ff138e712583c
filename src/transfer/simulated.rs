//! In-process acquisition box.
//!
//! [`simulated_device`] returns the two halves of a fake device: a [`SimulatedTransport`]
//! serving bulk reads and a [`SimulatedControl`] decoding vendor commands. Once started,
//! the device clocks out `count_target × channel_count` words where word `k` is `k` as a
//! little-endian `i32`, optionally throttled to a byte rate. Reads are served in
//! submission order; the trailing partial packet is only released after the packet-end
//! command, like the real bridge. Reads that cannot be filled before their deadline time
//! out, and selected packet sequences can be made to fail.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::acquisition::device::{ChannelSelection, DeviceControl, VendorCommand};
use crate::acquisition::plan::{AcquisitionPlan, WORD_SIZE};
use crate::error_handling::types::{DeviceError, TransferError};

use super::transport::Transport;
use super::types::{
    CompletionReceiver, CompletionSender, TransferCompletion, TransferRequest, TransferStatus,
};

#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    /// Production rate once started; `None` produces the whole capture at once.
    pub bytes_per_second: Option<f64>,
    /// Packet sequences whose transfer completes with an error (once each).
    pub failing_sequences: Vec<u64>,
    /// Request codes the control side rejects.
    pub rejected_requests: Vec<u8>,
    /// Whether the trailing partial packet waits for the packet-end command.
    pub needs_packet_end: bool,
    pub poll_interval: Duration,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: None,
            failing_sequences: Vec::new(),
            rejected_requests: Vec::new(),
            needs_packet_end: true,
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl SimulatedDeviceConfig {
    /// Produces data at the real rate of `plan`.
    pub fn real_time(plan: &AcquisitionPlan) -> Self {
        Self {
            bytes_per_second: Some(
                plan.sample_frequency() * (plan.channel_count() * WORD_SIZE) as f64,
            ),
            ..Self::default()
        }
    }
}

/// `len` bytes of the counter stream, starting at byte `start`.
pub fn counter_bytes(start: u64, len: usize) -> Vec<u8> {
    (start..start + len as u64)
        .map(|pos| ((pos / WORD_SIZE as u64) as i32).to_le_bytes()[(pos % WORD_SIZE as u64) as usize])
        .collect()
}

#[derive(Debug)]
struct PendingRead {
    request: TransferRequest,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct DeviceState {
    count_target: u64,
    pages: BTreeMap<u8, u8>,
    total_bytes: u64,
    started_at: Option<Instant>,
    packet_end: bool,
    delivered: u64,
    queue: VecDeque<PendingRead>,
    failing: HashSet<u64>,
    commands: Vec<VendorCommand>,
    disconnected: bool,
}

impl DeviceState {
    fn produced(&self, now: Instant, rate: Option<f64>) -> u64 {
        match (self.started_at, rate) {
            (None, _) => 0,
            (Some(_), None) => self.total_bytes,
            (Some(t0), Some(rate)) => {
                let bytes = (now.duration_since(t0).as_secs_f64() * rate) as u64;
                bytes.min(self.total_bytes)
            }
        }
    }

    /// Completes every read at the head of the queue that can be completed now.
    fn serve(&mut self, now: Instant, config: &SimulatedDeviceConfig) -> Vec<TransferCompletion> {
        let mut done = Vec::new();
        let produced = self.produced(now, config.bytes_per_second);
        while let Some(head) = self.queue.front() {
            let request = &head.request;
            let available = produced.saturating_sub(self.delivered);
            let flushed = self.started_at.is_some()
                && produced == self.total_bytes
                && (self.packet_end || !config.needs_packet_end);

            let (status, len) = if self.failing.remove(&request.sequence) {
                (TransferStatus::Error("injected failure".to_string()), 0)
            } else if available >= request.len as u64 {
                (TransferStatus::Completed, request.len)
            } else if flushed && available > 0 {
                (TransferStatus::Completed, available as usize)
            } else if now >= head.deadline {
                (TransferStatus::TimedOut, 0)
            } else {
                break;
            };

            let payload = counter_bytes(self.delivered, len);
            self.delivered += len as u64;
            trace!(
                "Simulated read slot {} seq {}: {:?}, {} bytes",
                request.slot,
                request.sequence,
                status,
                len
            );
            done.push(TransferCompletion {
                slot: request.slot,
                sequence: request.sequence,
                status,
                payload,
            });
            self.queue.pop_front();
        }
        done
    }
}

struct Shared {
    config: SimulatedDeviceConfig,
    state: Mutex<DeviceState>,
    wakeup: Notify,
}

/// Bulk side of the simulated device.
pub struct SimulatedTransport {
    shared: Arc<Shared>,
    completions: Option<CompletionReceiver>,
}

/// Control side of the simulated device.
pub struct SimulatedControl {
    shared: Arc<Shared>,
}

/// Read-only view on the simulated device, usable after both halves were handed out.
#[derive(Clone)]
pub struct SimulatedProbe {
    shared: Arc<Shared>,
}

/// Builds a simulated device and spawns its worker on the current tokio runtime.
pub fn simulated_device(config: SimulatedDeviceConfig) -> (SimulatedTransport, SimulatedControl) {
    let failing = config.failing_sequences.iter().copied().collect();
    let shared = Arc::new(Shared {
        config,
        state: Mutex::new(DeviceState {
            failing,
            ..DeviceState::default()
        }),
        wakeup: Notify::new(),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(Arc::clone(&shared), tx));
    (
        SimulatedTransport {
            shared: Arc::clone(&shared),
            completions: Some(rx),
        },
        SimulatedControl { shared },
    )
}

async fn run_worker(shared: Arc<Shared>, completions: CompletionSender) {
    let poll = shared.config.poll_interval;
    loop {
        let ready = match shared.state.lock() {
            Ok(mut state) if !state.disconnected => state.serve(Instant::now(), &shared.config),
            _ => break,
        };
        for completion in ready {
            if completions.send(completion).is_err() {
                debug!("Completion queue closed; simulated device stops");
                return;
            }
        }
        tokio::select! {
            _ = shared.wakeup.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    debug!("Simulated device disconnected");
}

impl Transport for SimulatedTransport {
    fn submit(&mut self, request: TransferRequest) -> Result<(), TransferError> {
        let mut state = self.shared.state.lock().map_err(|_| TransferError::SubmitFailed {
            slot: request.slot,
            reason: "device state poisoned".to_string(),
        })?;
        if state.disconnected {
            return Err(TransferError::SubmitFailed {
                slot: request.slot,
                reason: "device disconnected".to_string(),
            });
        }
        let deadline = Instant::now() + request.timeout;
        state.queue.push_back(PendingRead { request, deadline });
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn take_completions(&mut self) -> Option<CompletionReceiver> {
        self.completions.take()
    }
}

impl SimulatedTransport {
    pub fn probe(&self) -> SimulatedProbe {
        SimulatedProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl DeviceControl for SimulatedControl {
    fn send(&mut self, command: &VendorCommand) -> Result<(), DeviceError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| DeviceError::Disconnected)?;
        if state.disconnected {
            return Err(DeviceError::Disconnected);
        }
        if self.shared.config.rejected_requests.contains(&command.request) {
            warn!("Simulated device rejects request 0x{:02X}", command.request);
            return Err(DeviceError::CommandRejected {
                request: command.request,
                reason: "stalled control pipe".to_string(),
            });
        }
        state.commands.push(command.clone());

        if command.is_reset() {
            state.started_at = None;
            state.pages.clear();
        } else if let Some(target) = command.count_target() {
            state.count_target = target as u64;
        } else if let Some((page, mask)) = command.activation() {
            state.pages.insert(page, mask);
        } else if command.is_start() {
            let pages: Vec<(u8, u8)> = state.pages.iter().map(|(p, m)| (*p, *m)).collect();
            let channels = ChannelSelection::channel_count_from_pages(&pages);
            state.total_bytes = state.count_target * (channels * WORD_SIZE) as u64;
            state.delivered = 0;
            state.packet_end = false;
            state.started_at = Some(Instant::now());
            debug!(
                "Simulated device started: {} samples × {} channels",
                state.count_target, channels
            );
        } else if command.is_packet_end() {
            // the device stops clocking and flushes what it has
            let produced = state.produced(Instant::now(), self.shared.config.bytes_per_second);
            state.total_bytes = produced;
            state.packet_end = true;
        }
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn needs_packet_end(&self) -> bool {
        self.shared.config.needs_packet_end
    }
}

impl SimulatedControl {
    pub fn probe(&self) -> SimulatedProbe {
        SimulatedProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl SimulatedProbe {
    /// Commands accepted so far, in order.
    pub fn commands(&self) -> Vec<VendorCommand> {
        self.shared
            .state
            .lock()
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.shared.state.lock().map(|s| s.delivered).unwrap_or(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.state.lock().map(|s| s.total_bytes).unwrap_or(0)
    }

    pub fn pending_reads(&self) -> usize {
        self.shared.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Unplugs the device: the worker stops and its completion queue closes.
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.disconnected = true;
        }
        self.shared.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(slot: usize, sequence: u64, len: usize) -> TransferRequest {
        TransferRequest {
            slot,
            sequence,
            offset: slot * 512,
            len,
            endpoint: 0x82,
            timeout: Duration::from_millis(100),
        }
    }

    fn configure(control: &mut SimulatedControl, samples: u32) {
        control.send(&VendorCommand::reset()).unwrap();
        control.send(&VendorCommand::sample_count(samples)).unwrap();
        for (page, mask) in ChannelSelection::beams(0).pages() {
            control.send(&VendorCommand::activate(page, mask)).unwrap();
        }
    }

    #[test]
    fn test_counter_bytes() {
        assert_eq!(counter_bytes(0, 8), vec![0, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(counter_bytes(6, 4), vec![0, 0, 2, 0]);
        assert_eq!(counter_bytes(4 * 256, 4), vec![0, 1, 0, 0]);
    }

    #[tokio::test]
    async fn test_reads_complete_in_order_and_tail_waits_for_packet_end() {
        let (mut transport, mut control) = simulated_device(SimulatedDeviceConfig::default());
        let mut rx = transport.take_completions().unwrap();
        assert!(transport.take_completions().is_none());

        // counter only: 300 words = 1200 bytes
        configure(&mut control, 300);
        transport.submit(read(0, 0, 512)).unwrap();
        transport.submit(read(1, 1, 512)).unwrap();
        transport.submit(read(2, 2, 512)).unwrap();
        control.send(&VendorCommand::start()).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.slot, first.status.clone()), (0, TransferStatus::Completed));
        assert_eq!(first.payload, counter_bytes(0, 512));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload, counter_bytes(512, 512));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        control.send(&VendorCommand::packet_end()).unwrap();
        let tail = rx.recv().await.unwrap();
        assert_eq!(tail.status, TransferStatus::Completed);
        assert_eq!(tail.payload, counter_bytes(1024, 176));
        assert_eq!(control.probe().delivered_bytes(), 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_read_times_out() {
        let (mut transport, _control) = simulated_device(SimulatedDeviceConfig::default());
        let mut rx = transport.take_completions().unwrap();

        transport.submit(read(0, 0, 512)).unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.status, TransferStatus::TimedOut);
        assert!(completion.payload.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_consumes_no_data() {
        let (mut transport, mut control) = simulated_device(SimulatedDeviceConfig {
            failing_sequences: vec![0],
            ..SimulatedDeviceConfig::default()
        });
        let mut rx = transport.take_completions().unwrap();
        configure(&mut control, 256);
        control.send(&VendorCommand::start()).unwrap();

        transport.submit(read(0, 0, 512)).unwrap();
        transport.submit(read(1, 1, 512)).unwrap();
        let failed = rx.recv().await.unwrap();
        assert!(matches!(failed.status, TransferStatus::Error(_)));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.payload, counter_bytes(0, 512));
    }

    #[tokio::test]
    async fn test_rejected_command_and_disconnect() {
        let (mut transport, mut control) = simulated_device(SimulatedDeviceConfig {
            rejected_requests: vec![0xC1],
            ..SimulatedDeviceConfig::default()
        });
        let mut rx = transport.take_completions().unwrap();
        assert!(matches!(
            control.send(&VendorCommand::packet_end()),
            Err(DeviceError::CommandRejected { request: 0xC1, .. })
        ));
        assert!(control.send(&VendorCommand::reset()).is_ok());
        assert_eq!(control.probe().commands(), vec![VendorCommand::reset()]);

        control.probe().disconnect();
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            transport.submit(read(0, 0, 512)),
            Err(TransferError::SubmitFailed { .. })
        ));
        assert_eq!(control.send(&VendorCommand::start()), Err(DeviceError::Disconnected));
    }
}
