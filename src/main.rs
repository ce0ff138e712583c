use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tixel_capture::configuration::config::Config;
use tixel_capture::configuration::types::CaptureMode;
use tixel_capture::data_capture::ring_reader::RingReader;
use tixel_capture::data_capture::types::CaptureReport;
use tixel_capture::error_handling::types::AcquisitionError;
use tixel_capture::session_management::{CaptureSession, StopHandle};
use tixel_capture::storage::file_storage::CaptureStorage;
use tixel_capture::transfer::simulated::{
    simulated_device, SimulatedControl, SimulatedDeviceConfig, SimulatedTransport,
};

#[derive(Parser)]
#[command(name = "tixel-capture")]
#[command(version = "0.1.0")]
#[command(about = "Gap-free multi-channel capture from a MEMS acquisition box")]
struct Args {
    /// TOML configuration file
    #[arg(env = "TIXEL_CAPTURE_CONFIG")]
    config_file: Option<PathBuf>,
    /// Capture duration in seconds
    #[arg(short, long)]
    duration: Option<f64>,
    /// Capture file (file mode)
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(short, long, value_enum)]
    mode: Option<CaptureMode>,
    /// Transfers kept in flight
    #[arg(long)]
    slots: Option<usize>,
    /// Bytes per transfer, a multiple of 512
    #[arg(long)]
    packet_size: Option<usize>,
    #[arg(long)]
    clock_divisor: Option<u8>,
    /// Simulated device rate in bytes/s, the real capture rate by default
    #[arg(long)]
    rate: Option<f64>,
    /// Live read window in seconds
    #[arg(long, default_value_t = 0.1)]
    live_window: f64,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(d) = self.duration {
            config.duration_secs = d;
        }
        if let Some(o) = &self.output {
            config.output_path = o.clone();
        }
        if let Some(m) = self.mode {
            config.mode = m;
        }
        if let Some(s) = self.slots {
            config.slot_count = s;
        }
        if let Some(p) = self.packet_size {
            config.packet_size = Some(p);
        }
        if let Some(c) = self.clock_divisor {
            config.clock_divisor = c;
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration");
    let mut config = match &args.config_file {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| {
            error!("Unable to import configuration from {}: {}", path.display(), e);
            std::process::exit(1);
        }),
        None => Config::default(),
    };
    args.apply(&mut config);

    let plan = match config.validate().and_then(|_| config.plan()) {
        Ok(plan) => plan,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration imported successfully");

    warn!("No USB backend available, capturing from the simulated device");
    let device_config = match args.rate {
        Some(rate) => SimulatedDeviceConfig {
            bytes_per_second: Some(rate),
            ..SimulatedDeviceConfig::default()
        },
        None => SimulatedDeviceConfig::real_time(&plan),
    };
    let (transport, control) = simulated_device(device_config);

    let result = match config.mode {
        CaptureMode::File => capture_to_file(&config, transport, control).await,
        CaptureMode::Live => capture_live(&config, transport, control, args.live_window).await,
    };

    match result {
        Ok(report) if report.is_complete() => info!("Capture {} complete", report.session_id),
        Ok(report) => warn!(
            "Capture {} ended {:?}: {} packet(s) missing",
            report.session_id,
            report.outcome,
            report.missing_packets()
        ),
        Err(e) => {
            error!("Capture failed: {}, exiting...", e);
            std::process::exit(1);
        }
    }
}

fn stop_on_interrupt(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping capture");
            stop.request_stop();
        }
    });
}

async fn capture_to_file(
    config: &Config,
    transport: SimulatedTransport,
    control: SimulatedControl,
) -> Result<CaptureReport, AcquisitionError> {
    let mut session = CaptureSession::file(config, transport, control)?;
    stop_on_interrupt(session.stop_handle());
    let report = session.run().await?;
    CaptureStorage::new(&config.output_path).save_report(&report)?;
    Ok(report)
}

async fn capture_live(
    config: &Config,
    transport: SimulatedTransport,
    control: SimulatedControl,
    window: f64,
) -> Result<CaptureReport, AcquisitionError> {
    let (mut session, reader) = CaptureSession::live(config, transport, control)?;
    stop_on_interrupt(session.stop_handle());
    let viewer = tokio::spawn(watch(reader, window));
    let report = session.run().await?;
    match viewer.await {
        Ok(samples) => info!("Live view consumed {} samples", samples),
        Err(e) => error!("Live view task failed: {:?}", e),
    }
    Ok(report)
}

// Polls the live buffer and logs the level of every channel-0 window.
async fn watch(mut reader: RingReader, window: f64) -> usize {
    let poll = Duration::from_secs_f64((window / 4.0).max(0.001));
    let mut consumed = 0;
    loop {
        match reader.get_data(window) {
            Some(block) if !block.is_empty() => {
                consumed += block.samples();
                let peak = block
                    .channel(0)
                    .and_then(|c| c.iter().map(|v| v.unsigned_abs()).max())
                    .unwrap_or(0);
                info!("{} samples, channel 0 peak {}", block.samples(), peak);
            }
            Some(_) => tokio::time::sleep(poll).await,
            None if reader.is_done() => {
                if let Some(rest) = reader.get_samples(reader.available_samples()) {
                    consumed += rest.samples();
                }
                return consumed;
            }
            None => tokio::time::sleep(poll).await,
        }
    }
}
