//! simcam daemon.
//!
//! Opens a simulated camera, waits for one TCP client and streams it a fixed
//! number of frames.
//!
//! # Usage
//!
//! ```sh
//! simcam                                  # 640x480 RAW12, every 2 s, 5 frames on :8080
//! simcam --config simcam.toml --frames 20
//! simcam --echo --port 9000               # stream lines typed on stdin instead
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop waiting, close the connection and exit

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use clap::{Parser, ValueEnum};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, error, info, warn};

use simcam::{
    Config, ConfigError, Device, DeviceError, DeviceVariant, Endpoint, PatternKind, Relay,
    RelayError,
};

/// Simulated camera streaming frames to a TCP client.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    bind: Option<Endpoint>,

    /// Listen port (keeps the configured address)
    #[arg(short, long)]
    port: Option<u16>,

    /// Frames to send before closing the connection
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Producer period in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,

    /// Test pattern drawn into each frame
    #[arg(long, value_enum)]
    pattern: Option<PatternArg>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    bytes_per_sample: Option<u32>,

    /// Use the echo device fed from stdin instead of the camera
    #[arg(long)]
    echo: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatternArg {
    Gradient,
    Text,
}

impl From<PatternArg> for PatternKind {
    fn from(arg: PatternArg) -> Self {
        match arg {
            PatternArg::Gradient => Self::Gradient,
            PatternArg::Text => Self::Text,
        }
    }
}

impl Cli {
    /// Command-line values win over the file, the file over defaults.
    fn apply(&self, config: &mut Config) {
        let device = &mut config.device;
        if self.echo {
            device.kind = DeviceVariant::SimpleBuffer;
        }
        if let Some(ms) = self.period_ms {
            device.period_ms = ms;
        }
        if let Some(pattern) = self.pattern {
            device.pattern = pattern.into();
        }
        if let Some(width) = self.width {
            device.geometry.width = width;
        }
        if let Some(height) = self.height {
            device.geometry.height = height;
        }
        if let Some(bps) = self.bytes_per_sample {
            device.geometry.bytes_per_sample = bps;
        }

        let relay = &mut config.relay;
        if let Some(bind) = self.bind {
            relay.bind = bind;
        }
        if let Some(port) = self.port {
            relay.bind = relay.bind.with_port(port);
        }
        if let Some(frames) = self.frames {
            relay.frame_budget = frames;
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

fn main() -> ExitCode {
    simcam::init_tracing();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "simcam failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            Config::load(path)?
        }
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;
    debug!(?config, "effective configuration");

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(AppError::Signal)?;
    }

    let device = Arc::new(Device::open_with_buffers(
        config.device.kind(),
        config.device.buffers,
    )?);
    let relay = Relay::bind(&config.relay)?;
    if let Ok(local) = relay.local_endpoint() {
        info!(%local, "waiting for client");
    }

    if config.device.kind == DeviceVariant::SimpleBuffer {
        let device = Arc::clone(&device);
        let shutdown = Arc::clone(&shutdown);
        // Detached: a read on stdin cannot be interrupted portably.
        thread::Builder::new()
            .name("simcam-stdin".into())
            .spawn(move || feed_from_stdin(&device, &shutdown))
            .map_err(|e| AppError::Device(DeviceError::Spawn(e)))?;
    }

    let report = relay.run(&device.reader(), &shutdown);
    // Releases anything still blocked on the device.
    device.close();
    let report = report?;

    let stats = device.stats();
    info!(
        frames_sent = report.frames,
        bytes_sent = report.bytes,
        end = ?report.end,
        frames_produced = stats.frames_produced,
        generation_failures = stats.generation_failures,
        "done"
    );
    Ok(())
}

/// Writes stdin into the echo device, one chunk per frame.
fn feed_from_stdin(device: &Device, shutdown: &AtomicBool) {
    let mut buf = vec![0u8; device.frame_size()];
    let mut stdin = io::stdin().lock();
    while !shutdown.load(Ordering::Relaxed) && !device.is_closed() {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = device.write(&buf[..n]) {
                    debug!(error = %e, "stdin feeder stopping");
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                break;
            }
        }
    }
}
