//! Device control boundary.
//!
//! The acquisition box is configured through opaque vendor control commands sent
//! before the bulk transfers are armed (reset, FIFO purge, clock divisor, sample
//! count target, data width, channel activation bitmap) and around the capture
//! (start, packet end). This module only encodes those commands and defines the
//! [`DeviceControl`] seam through which the session issues them; how the bytes
//! reach the hardware is up to the implementor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acquisition::plan::AcquisitionPlan;
use crate::configuration::types::SampleFormat;
use crate::error_handling::types::{ConfigError, DeviceError};

/// Master clock of the acquisition box. The sample clock is `BASE_CLOCK_HZ / (divisor + 1)`.
pub const BASE_CLOCK_HZ: f64 = 500_000.0;
pub const MEMS_BEAMS: usize = 16;
pub const MEMS_PER_BEAM: usize = 8;
pub const ANALOG_INPUTS: usize = 4;
/// Page id carrying the analog and counter activation bits.
pub const AUX_PAGE: u8 = 0xFF;
const COUNTER_BIT: u8 = 1 << 7;

const REQ_CONTROL: u8 = 0xB0;
const REQ_BRIDGE_RESET: u8 = 0xC0;
const REQ_PACKET_END: u8 = 0xC1;
const REQ_BRIDGE_PURGE: u8 = 0xC2;

const CMD_RESET: u8 = 0x00;
const CMD_INIT: u8 = 0x01;
const CMD_START: u8 = 0x02;
const CMD_COUNT: u8 = 0x04;
const CMD_ACTIVE: u8 = 0x05;
const CMD_PURGE_FIFO: u8 = 0x06;
const CMD_DATA_TYPE: u8 = 0x09;

/// Sample clock produced by a given clock divisor.
pub fn sample_frequency(clock_divisor: u8) -> f64 {
    BASE_CLOCK_HZ / (clock_divisor as f64 + 1.0)
}

/// Which acquisition lines are active.
///
/// `mems` holds one 8-bit mask per beam (bit `n` = microphone `n` of that beam);
/// missing beams are inactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSelection {
    pub mems: Vec<u8>,
    pub analog: [bool; ANALOG_INPUTS],
    pub counter: bool,
}

impl Default for ChannelSelection {
    fn default() -> Self {
        Self {
            mems: vec![0xFF; MEMS_BEAMS],
            analog: [true; ANALOG_INPUTS],
            counter: true,
        }
    }
}

impl ChannelSelection {
    /// Selection with the first `beams` beams fully active, no analog input, counter on.
    pub fn beams(beams: usize) -> Self {
        let mut mems = vec![0u8; MEMS_BEAMS];
        for mask in mems.iter_mut().take(beams) {
            *mask = 0xFF;
        }
        Self {
            mems,
            analog: [false; ANALOG_INPUTS],
            counter: true,
        }
    }

    pub fn active_mems(&self) -> usize {
        self.mems
            .iter()
            .take(MEMS_BEAMS)
            .map(|m| m.count_ones() as usize)
            .sum()
    }

    pub fn active_analog(&self) -> usize {
        self.analog.iter().filter(|a| **a).count()
    }

    /// Number of words in one tixel.
    pub fn channel_count(&self) -> usize {
        self.active_mems() + self.active_analog() + usize::from(self.counter)
    }

    /// Default transfer size: 1 KiB per active microphone, at least one aligned block.
    pub fn default_packet_size(&self) -> usize {
        (self.active_mems() * 1024).max(crate::acquisition::plan::PACKET_ALIGNMENT)
    }

    /// The 17 activation pages as `(page id, mask)`.
    pub fn pages(&self) -> Vec<(u8, u8)> {
        let mut pages: Vec<(u8, u8)> = (0..MEMS_BEAMS)
            .map(|beam| (beam as u8, self.mems.get(beam).copied().unwrap_or(0)))
            .collect();
        let mut aux = 0u8;
        for (bit, active) in self.analog.iter().enumerate() {
            if *active {
                aux |= 1 << bit;
            }
        }
        if self.counter {
            aux |= COUNTER_BIT;
        }
        pages.push((AUX_PAGE, aux));
        pages
    }

    /// Channel count implied by a set of activation pages.
    pub fn channel_count_from_pages(pages: &[(u8, u8)]) -> usize {
        pages
            .iter()
            .map(|(page, mask)| {
                if *page == AUX_PAGE {
                    (mask & 0x0F).count_ones() as usize + usize::from(mask & COUNTER_BIT != 0)
                } else {
                    mask.count_ones() as usize
                }
            })
            .sum()
    }
}

/// One vendor control request: request code plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorCommand {
    pub request: u8,
    pub payload: Vec<u8>,
}

impl VendorCommand {
    // The request code encodes the number of argument bytes after the command byte.
    fn control(args: &[u8]) -> Self {
        Self {
            request: REQ_CONTROL + (args.len() as u8 - 1),
            payload: args.to_vec(),
        }
    }

    pub fn reset() -> Self {
        Self::control(&[CMD_RESET])
    }

    pub fn purge_fifo() -> Self {
        Self::control(&[CMD_PURGE_FIFO])
    }

    pub fn bridge_reset() -> Self {
        Self {
            request: REQ_BRIDGE_RESET,
            payload: Vec::new(),
        }
    }

    pub fn bridge_purge() -> Self {
        Self {
            request: REQ_BRIDGE_PURGE,
            payload: Vec::new(),
        }
    }

    pub fn init(clock_divisor: u8) -> Self {
        Self::control(&[CMD_INIT, clock_divisor])
    }

    pub fn sample_count(count: u32) -> Self {
        let b = count.to_le_bytes();
        Self::control(&[CMD_COUNT, b[0], b[1], b[2], b[3]])
    }

    pub fn data_type(format: SampleFormat) -> Self {
        Self::control(&[CMD_DATA_TYPE, format.code()])
    }

    pub fn activate(page: u8, mask: u8) -> Self {
        Self::control(&[CMD_ACTIVE, 0x00, page, mask])
    }

    pub fn start() -> Self {
        // start + software trigger
        Self::control(&[CMD_START, 0x00])
    }

    /// Asks the device to flush the trailing partial packet and stop.
    pub fn packet_end() -> Self {
        Self {
            request: REQ_PACKET_END,
            payload: Vec::new(),
        }
    }

    /// Decodes a control request back into `(command, args)`; `None` for bridge requests.
    pub fn decode(&self) -> Option<(u8, &[u8])> {
        if !(REQ_CONTROL..REQ_CONTROL + 0x10).contains(&self.request) {
            return None;
        }
        self.payload.split_first().map(|(cmd, args)| (*cmd, args))
    }

    pub fn is_start(&self) -> bool {
        matches!(self.decode(), Some((CMD_START, _)))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self.decode(), Some((CMD_RESET, _)))
    }

    pub fn is_packet_end(&self) -> bool {
        self.request == REQ_PACKET_END
    }

    /// Sample count target carried by a COUNT command.
    pub fn count_target(&self) -> Option<u32> {
        match self.decode() {
            Some((CMD_COUNT, [a, b, c, d])) => Some(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }

    /// `(page, mask)` carried by an activation command.
    pub fn activation(&self) -> Option<(u8, u8)> {
        match self.decode() {
            Some((CMD_ACTIVE, [_, page, mask])) => Some((*page, *mask)),
            _ => None,
        }
    }
}

/// A step of the pre-capture configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupStep {
    Command(VendorCommand),
    /// MEMS need time after init before they produce valid data.
    Settle(Duration),
}

/// Commands issued before the transfers are armed.
pub fn setup_sequence(
    plan: &AcquisitionPlan,
    clock_divisor: u8,
    format: SampleFormat,
    channels: &ChannelSelection,
    settle: Duration,
) -> Result<Vec<SetupStep>, ConfigError> {
    let count = u32::try_from(plan.total_samples()).map_err(|_| {
        ConfigError::NotInRange(format!(
            "{} samples exceed the device counter",
            plan.total_samples()
        ))
    })?;

    let mut steps = vec![
        SetupStep::Command(VendorCommand::reset()),
        SetupStep::Command(VendorCommand::purge_fifo()),
        SetupStep::Command(VendorCommand::bridge_reset()),
        SetupStep::Command(VendorCommand::bridge_purge()),
        SetupStep::Command(VendorCommand::init(clock_divisor)),
    ];
    if !settle.is_zero() {
        steps.push(SetupStep::Settle(settle));
    }
    steps.push(SetupStep::Command(VendorCommand::sample_count(count)));
    steps.push(SetupStep::Command(VendorCommand::data_type(format)));
    for (page, mask) in channels.pages() {
        steps.push(SetupStep::Command(VendorCommand::activate(page, mask)));
    }
    Ok(steps)
}

/// Commands issued once the capture is over.
pub fn teardown_sequence() -> Vec<VendorCommand> {
    vec![
        VendorCommand::reset(),
        VendorCommand::purge_fifo(),
        VendorCommand::bridge_reset(),
        VendorCommand::bridge_purge(),
    ]
}

/// Sends vendor commands to the acquisition box.
pub trait DeviceControl: Send {
    fn send(&mut self, command: &VendorCommand) -> Result<(), DeviceError>;

    /// Whether this transport generation only flushes the trailing packet after an
    /// explicit packet-end command.
    fn needs_packet_end(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_frequency_from_divisor() {
        assert_eq!(sample_frequency(9), 50_000.0);
        assert_eq!(sample_frequency(0), 500_000.0);
        assert_eq!(sample_frequency(15), 31_250.0);
    }

    #[test]
    fn test_channel_count() {
        let all = ChannelSelection::default();
        assert_eq!(all.active_mems(), 128);
        assert_eq!(all.channel_count(), 133);
        assert_eq!(all.default_packet_size(), 128 * 1024);

        let two_beams = ChannelSelection::beams(2);
        assert_eq!(two_beams.channel_count(), 17);
        assert_eq!(two_beams.default_packet_size(), 16 * 1024);

        let none = ChannelSelection {
            mems: vec![],
            analog: [false; 4],
            counter: false,
        };
        assert_eq!(none.channel_count(), 0);
        assert_eq!(none.default_packet_size(), 512);
    }

    #[test]
    fn test_pages_round_trip_channel_count() {
        let sel = ChannelSelection {
            mems: vec![0b1010_0001, 0xFF, 0x00, 0x0F],
            analog: [true, false, true, false],
            counter: true,
        };
        let pages = sel.pages();
        assert_eq!(pages.len(), 17);
        assert_eq!(pages[0], (0x00, 0b1010_0001));
        assert_eq!(pages[4], (0x04, 0x00));
        assert_eq!(pages[16], (AUX_PAGE, 0b1000_0101));
        assert_eq!(ChannelSelection::channel_count_from_pages(&pages), sel.channel_count());
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(VendorCommand::reset().request, 0xB0);
        assert_eq!(VendorCommand::reset().payload, vec![0x00]);
        assert_eq!(VendorCommand::purge_fifo().payload, vec![0x06]);
        assert_eq!(VendorCommand::init(9).request, 0xB1);
        assert_eq!(VendorCommand::init(9).payload, vec![0x01, 0x09]);
        assert_eq!(VendorCommand::start().payload, vec![0x02, 0x00]);
        assert_eq!(VendorCommand::data_type(SampleFormat::Float32).payload, vec![0x09, 0x01]);

        let count = VendorCommand::sample_count(150_000);
        assert_eq!(count.request, 0xB4);
        assert_eq!(count.payload, vec![0x04, 0xF0, 0x49, 0x02, 0x00]);
        assert_eq!(count.count_target(), Some(150_000));

        let act = VendorCommand::activate(0x03, 0xFF);
        assert_eq!(act.request, 0xB3);
        assert_eq!(act.activation(), Some((0x03, 0xFF)));

        assert!(VendorCommand::packet_end().is_packet_end());
        assert_eq!(VendorCommand::packet_end().decode(), None);
        assert!(VendorCommand::start().is_start());
        assert!(!VendorCommand::start().is_reset());
    }

    #[test]
    fn test_setup_sequence_layout() {
        let channels = ChannelSelection::beams(1);
        let plan = AcquisitionPlan::new(1.0, 50_000.0, channels.channel_count(), 8192, 8).unwrap();
        let steps = setup_sequence(
            &plan,
            9,
            SampleFormat::Int32,
            &channels,
            Duration::from_millis(1000),
        )
        .unwrap();
        assert_eq!(steps.len(), 5 + 1 + 2 + 17);
        assert_eq!(steps[0], SetupStep::Command(VendorCommand::reset()));
        assert_eq!(steps[5], SetupStep::Settle(Duration::from_millis(1000)));
        assert_eq!(steps[6], SetupStep::Command(VendorCommand::sample_count(50_000)));

        let quick = setup_sequence(&plan, 9, SampleFormat::Int32, &channels, Duration::ZERO).unwrap();
        assert!(!quick.iter().any(|s| matches!(s, SetupStep::Settle(_))));
    }

    #[test]
    fn test_sample_count_overflow_is_rejected() {
        let plan = AcquisitionPlan::new(100_000.0, 50_000.0, 1, 512, 8).unwrap();
        let res = setup_sequence(
            &plan,
            9,
            SampleFormat::Int32,
            &ChannelSelection::beams(1),
            Duration::ZERO,
        );
        assert!(matches!(res, Err(ConfigError::NotInRange(_))));
    }
}
