//! Capture lifecycle.
//!
//! A [`CaptureSession`] owns everything one capture needs (plan, transfer pool,
//! transport, device control, sink) and drives it through
//! `Idle → Armed → Running → Draining → Stopped`:
//!
//! - [`CaptureSession::arm`] sends the setup commands and submits every slot.
//! - [`CaptureSession::run`] starts the device and drains the completion queue from
//!   a single loop. Every completion goes through [`TransferPool::on_complete`].
//! - Once only the final packet is outstanding, the packet-end command is sent after
//!   a delay so the device flushes its trailing partial packet. A live capture ends
//!   right there; a file capture keeps going until the last packet is written.
//! - A stop request (see [`StopHandle`]) switches to `Draining`: nothing is re-armed
//!   and the loop exits once no transfer is in flight.
//! - A watchdog fails the capture when no packet is sunk for `stall_timeout`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::acquisition::device::{
    setup_sequence, teardown_sequence, DeviceControl, SetupStep, VendorCommand,
};
use crate::acquisition::plan::AcquisitionPlan;
use crate::configuration::config::Config;
use crate::configuration::types::CaptureMode;
use crate::data_capture::ring_buffer::{RingBuffer, RingBufferSink};
use crate::data_capture::ring_reader::RingReader;
use crate::data_capture::sink::Sink;
use crate::data_capture::types::{CaptureOutcome, CaptureReport};
use crate::error_handling::types::AcquisitionError;
use crate::storage::file_storage::CaptureStorage;
use crate::transfer::pool::TransferPool;
use crate::transfer::transport::Transport;
use crate::transfer::types::PoolStats;

use super::stop_handle::StopHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    Armed,
    Running,
    Draining,
    Stopped,
}

pub struct CaptureSession<T: Transport, D: DeviceControl> {
    id: Uuid,
    plan: AcquisitionPlan,
    mode: CaptureMode,
    state: CaptureState,
    setup: Vec<SetupStep>,
    pool: TransferPool,
    transport: T,
    device: D,
    sink: Box<dyn Sink>,
    ring: Option<Arc<RingBuffer>>,
    stop: StopHandle,
    packet_end_delay: Duration,
    stall_timeout: Duration,
    packet_end_sent: bool,
}

impl<T: Transport, D: DeviceControl> CaptureSession<T, D> {
    /// File capture into `config.output_path`.
    pub fn file(config: &Config, transport: T, device: D) -> Result<Self, AcquisitionError> {
        Config {
            mode: CaptureMode::File,
            ..config.clone()
        }
        .validate()?;
        let sink = CaptureStorage::new(&config.output_path).create_sink()?;
        Self::build(config, CaptureMode::File, transport, device, Box::new(sink), None)
    }

    /// Live capture into a circular buffer; the returned reader consumes it.
    pub fn live(
        config: &Config,
        transport: T,
        device: D,
    ) -> Result<(Self, RingReader), AcquisitionError> {
        let plan = config.plan()?;
        let ring = Arc::new(RingBuffer::new(
            config.live_buffer_words(&plan),
            plan.channel_count(),
        ));
        let reader = RingReader::new(Arc::clone(&ring), plan.sample_frequency());
        let sink = Box::new(RingBufferSink::new(Arc::clone(&ring)));
        let session = Self::build(config, CaptureMode::Live, transport, device, sink, Some(ring))?;
        Ok((session, reader))
    }

    /// Capture into a caller-provided sink.
    pub fn with_sink(
        config: &Config,
        transport: T,
        device: D,
        sink: Box<dyn Sink>,
    ) -> Result<Self, AcquisitionError> {
        Self::build(config, config.mode, transport, device, sink, None)
    }

    fn build(
        config: &Config,
        mode: CaptureMode,
        transport: T,
        device: D,
        sink: Box<dyn Sink>,
        ring: Option<Arc<RingBuffer>>,
    ) -> Result<Self, AcquisitionError> {
        let config = Config {
            mode,
            ..config.clone()
        };
        config.validate()?;
        let plan = config.plan()?;
        let setup = setup_sequence(
            &plan,
            config.clock_divisor,
            config.sample_format,
            &config.channels,
            config.settle_delay(),
        )?;
        let id = Uuid::new_v4();
        let pool = TransferPool::new(id, &plan, config.endpoint, config.transfer_timeout());
        info!(
            "[{}] {:?} capture planned: {:.3} s at {} Hz × {} channels = {} bytes in {} packet(s) of {} bytes (last {}), {} slot(s)",
            id,
            mode,
            plan.duration(),
            plan.sample_frequency(),
            plan.channel_count(),
            plan.total_bytes(),
            plan.total_packet_count(),
            plan.packet_size(),
            plan.final_packet_len(),
            plan.effective_slot_count()
        );
        Ok(Self {
            id,
            plan,
            mode,
            state: CaptureState::Idle,
            setup,
            pool,
            transport,
            device,
            sink,
            ring,
            stop: StopHandle::new(),
            packet_end_delay: config.packet_end_delay(),
            stall_timeout: config.stall_timeout(),
            packet_end_sent: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn stats(&self) -> &PoolStats {
        self.pool.stats()
    }

    /// Handle through which any task can stop the capture.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.request_stop();
    }

    fn set_state(&mut self, state: CaptureState) {
        if self.state != state {
            info!("[{}] {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    /// Configures the device and submits every transfer slot.
    pub async fn arm(&mut self) -> Result<(), AcquisitionError> {
        if self.state != CaptureState::Idle {
            return Err(AcquisitionError::InvalidState(format!(
                "cannot arm a capture in state {:?}",
                self.state
            )));
        }
        if let Err(e) = self.configure_device().await {
            error!("[{}] Device setup failed: {}", self.id, e);
            self.teardown();
            return Err(e);
        }
        let armed = match self.pool.submit_all(&mut self.transport) {
            Ok(armed) => armed,
            Err(e) => {
                error!("[{}] No transfer could be submitted: {}", self.id, e);
                self.teardown();
                return Err(e.into());
            }
        };
        debug!("[{}] {} transfer(s) submitted", self.id, armed);
        self.set_state(CaptureState::Armed);
        Ok(())
    }

    async fn configure_device(&mut self) -> Result<(), AcquisitionError> {
        for step in &self.setup {
            match step {
                SetupStep::Command(command) => self.device.send(command)?,
                SetupStep::Settle(delay) => {
                    debug!("[{}] Waiting {:?} for the sensors to settle", self.id, delay);
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        Ok(())
    }

    /// Runs the capture to its end and returns its report. Arms first if needed.
    ///
    /// Errors
    /// - [`AcquisitionError::Stalled`] when the watchdog fires.
    /// - [`AcquisitionError::TransportClosed`] when the completion queue closes.
    /// - [`AcquisitionError::Persistence`] when the sink fails.
    ///
    /// The sink is finished and the teardown commands are sent in every case.
    pub async fn run(&mut self) -> Result<CaptureReport, AcquisitionError> {
        if self.state == CaptureState::Idle {
            self.arm().await?;
        }
        if self.state != CaptureState::Armed {
            return Err(AcquisitionError::InvalidState(format!(
                "cannot run a capture in state {:?}",
                self.state
            )));
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let driven = self.drive().await;
        self.set_state(CaptureState::Stopped);

        let finished = self.sink.finish();
        if let Some(ring) = &self.ring {
            ring.mark_done();
        }
        self.teardown();

        let abandoned = driven.map_err(|e| {
            error!("[{}] Capture failed: {}", self.id, e);
            e
        })?;
        finished?;
        Ok(self.report(started_at, clock.elapsed(), abandoned))
    }

    /// The completion-event loop. Returns the number of transfers left in flight.
    async fn drive(&mut self) -> Result<usize, AcquisitionError> {
        let mut completions = self.transport.take_completions().ok_or_else(|| {
            AcquisitionError::InvalidState("completion queue already taken".to_string())
        })?;
        let stop = self.stop.clone();
        let needs_packet_end = self.device.needs_packet_end();

        self.device.send(&VendorCommand::start())?;
        self.set_state(CaptureState::Running);

        let mut packet_end_at: Option<Instant> = None;
        let mut progress = self.pool.num_pkt();
        let mut last_progress = Instant::now();

        loop {
            if self.pool.is_complete() {
                break;
            }
            if self.mode == CaptureMode::Live && self.packet_end_sent {
                // trailing bytes are not waited for
                break;
            }
            if self.pool.in_flight() == 0 {
                if self.state != CaptureState::Draining {
                    warn!(
                        "[{}] No transfer left in flight at packet {}/{}",
                        self.id,
                        self.pool.num_pkt(),
                        self.plan.total_packet_count()
                    );
                }
                break;
            }
            if needs_packet_end && self.pool.last_pkt() && packet_end_at.is_none() {
                packet_end_at = Some(Instant::now() + self.packet_end_delay);
            }

            let stall_at = last_progress + self.stall_timeout;
            let draining = self.state == CaptureState::Draining;
            let end_pending = packet_end_at.is_some() && !self.packet_end_sent;

            tokio::select! {
                completion = completions.recv() => match completion {
                    Some(completion) => {
                        self.pool.on_complete(completion, &mut self.transport, self.sink.as_mut())?;
                    }
                    None => {
                        error!("[{}] Transport completion queue closed", self.id);
                        return Err(AcquisitionError::TransportClosed);
                    }
                },
                _ = sleep_until(packet_end_at.unwrap_or(stall_at)), if end_pending => {
                    self.send_packet_end()?;
                }
                _ = stop.stopped(), if !draining => {
                    info!("[{}] Stop requested at packet {}", self.id, self.pool.num_pkt());
                    self.set_state(CaptureState::Draining);
                    self.pool.cancel_all();
                    if needs_packet_end && !self.packet_end_sent {
                        self.send_packet_end()?;
                    }
                }
                _ = sleep_until(stall_at) => {
                    error!(
                        "[{}] No packet for {:?}, stuck at {}/{}",
                        self.id,
                        self.stall_timeout,
                        self.pool.num_pkt(),
                        self.plan.total_packet_count()
                    );
                    return Err(AcquisitionError::Stalled {
                        num_pkt: self.pool.num_pkt(),
                        window: self.stall_timeout,
                    });
                }
            }

            if self.pool.num_pkt() != progress {
                progress = self.pool.num_pkt();
                last_progress = Instant::now();
            }
        }

        let abandoned = self.pool.in_flight();
        if abandoned > 0 {
            debug!("[{}] {} transfer(s) abandoned in flight", self.id, abandoned);
        }
        Ok(abandoned)
    }

    fn send_packet_end(&mut self) -> Result<(), AcquisitionError> {
        debug!("[{}] Requesting the final packet", self.id);
        self.device.send(&VendorCommand::packet_end())?;
        self.packet_end_sent = true;
        if let Some(ring) = &self.ring {
            ring.mark_done();
        }
        Ok(())
    }

    fn teardown(&mut self) {
        for command in teardown_sequence() {
            if let Err(e) = self.device.send(&command) {
                warn!("[{}] Teardown command failed: {}", self.id, e);
            }
        }
    }

    fn outcome(&self) -> CaptureOutcome {
        if self.pool.is_complete() {
            CaptureOutcome::Complete
        } else if self.stop.is_requested() {
            CaptureOutcome::Stopped
        } else if self.mode == CaptureMode::Live && self.packet_end_sent {
            CaptureOutcome::LiveFinished
        } else {
            CaptureOutcome::Partial
        }
    }

    fn report(
        &self,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        abandoned_slots: usize,
    ) -> CaptureReport {
        let stats = self.pool.stats().clone();
        let outcome = self.outcome();
        let report = CaptureReport {
            session_id: self.id,
            mode: self.mode,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
            plan: self.plan.clone(),
            expected_packets: self.plan.total_packet_count(),
            received_packets: stats.packets_sunk,
            expected_bytes: self.plan.total_bytes(),
            received_bytes: stats.bytes_sunk,
            stats,
            abandoned_slots,
            ring: self.ring.as_ref().map(|r| r.stats()),
            outcome,
        };
        match outcome {
            CaptureOutcome::Partial => warn!(
                "[{}] Partial capture: {} of {} packets, {} transfer(s) failed",
                self.id,
                report.received_packets,
                report.expected_packets,
                report.stats.failed_transfers
            ),
            _ => info!(
                "[{}] Capture {:?}: {} of {} bytes in {} ms",
                self.id, outcome, report.received_bytes, report.expected_bytes, report.elapsed_ms
            ),
        }
        report
    }
}
