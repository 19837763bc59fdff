use std::{
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use color_eyre::eyre::{
    Error,
    eyre,
};
use sdr_tcp::{
    DeviceController,
    DeviceState,
    SampleFormat,
    reporter::RegisterReporter,
    rtl_tcp::server::RtlTcpServer,
    rtlsdr::RtlSdr,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
struct Args {
    /// Address to listen on
    #[clap(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Sample/control port; the register reporter listens one port above
    #[clap(short, long, default_value_t = 1234)]
    port: u16,

    /// Device index
    #[clap(short, long, default_value_t = 0)]
    device: u32,

    /// Frequency to tune to, in Hz
    #[clap(short, long, default_value_t = 100_000_000)]
    frequency: u32,

    /// Gain - either 'auto' or in dB
    #[clap(short, long, default_value = "auto")]
    gain: Gain,

    /// Sample rate in Hz
    #[clap(short, long, default_value_t = 2_048_000)]
    samplerate: u32,

    /// Number of sample buffers to keep before dropping the oldest
    #[clap(short = 'n', long, default_value_t = 64)]
    queue_depth: usize,

    /// Enable bias-tee power on the antenna port
    #[clap(short = 'T', long)]
    bias_tee: bool,

    /// Frequency correction in ppm
    #[clap(short = 'P', long, default_value_t = 0)]
    ppm: i32,

    /// On-wire bits per IQ component for 16-bit-native devices (16, 8 or 4)
    #[clap(short = 'W', long, default_value_t = 16)]
    bit_width: u32,

    /// Milliseconds between frames on the register report port
    #[clap(long, default_value_t = 500)]
    register_interval_ms: u64,

    /// Log debug detail
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;

    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }
    else {
        tracing_subscriber::fmt::init();
    }

    let sample_format = SampleFormat::from_bit_width(args.bit_width)
        .ok_or_else(|| eyre!("Invalid bit width: {}", args.bit_width))?;

    let rtl_sdr = RtlSdr::open(args.device)?;

    let controller = Arc::new(DeviceController::with_state(
        rtl_sdr.clone(),
        DeviceState {
            center_frequency: args.frequency,
            ppm_error: args.ppm,
            bias_tee: false,
        },
    ));
    controller.set_sample_rate(args.samplerate).await?;
    controller.set_frequency(args.frequency).await?;
    controller.set_gain(args.gain.into()).await?;
    if args.bias_tee {
        controller.set_bias_tee(true).await?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                shutdown.cancel();
            }
        }
    });

    spawn_register_reporter(&args, rtl_sdr.clone(), shutdown.clone()).await;

    let tcp_listener = TcpListener::bind((args.address.as_str(), args.port)).await?;
    tracing::info!(address = %args.address, port = args.port, "listening");

    RtlTcpServer::new(rtl_sdr, tcp_listener)
        .with_controller(controller)
        .with_sample_format(sample_format)
        .with_queue_depth(args.queue_depth)
        .with_shutdown(shutdown)
        .serve()
        .await?;

    Ok(())
}

/// The register reporter is diagnostics only: if its port is taken the
/// server runs on without it.
async fn spawn_register_reporter(args: &Args, rtl_sdr: RtlSdr, shutdown: CancellationToken) {
    let Some(register_port) = args.port.checked_add(1) else {
        tracing::warn!("no port left for the register reporter, disabled");
        return;
    };

    match TcpListener::bind((args.address.as_str(), register_port)).await {
        Ok(tcp_listener) => {
            tracing::info!(port = register_port, "register reporter listening");
            let reporter = RegisterReporter::new(rtl_sdr, tcp_listener)
                .with_period(Duration::from_millis(args.register_interval_ms))
                .with_shutdown(shutdown);
            tokio::spawn(async move {
                if let Err(error) = reporter.serve().await {
                    tracing::error!(?error, "register reporter failed");
                }
            });
        }
        Err(error) => {
            tracing::warn!(?error, port = register_port, "register port unavailable, reporter disabled");
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Gain {
    Auto,
    Manual(i32),
}

impl FromStr for Gain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(Self::Auto)
        }
        else {
            let gain: f32 = s.parse().map_err(|_| eyre!("Invalid gain value: {s}"))?;
            let gain = (gain * 10.0) as i32;
            Ok(Self::Manual(gain))
        }
    }
}

impl From<Gain> for sdr_tcp::Gain {
    fn from(value: Gain) -> Self {
        match value {
            Gain::Auto => Self::Auto,
            Gain::Manual(value) => Self::ManualValue(value),
        }
    }
}
