//! Periodic tuner-register reports on a secondary port.
//!
//! Diagnostic clients (QIRX) connect to the port above the sample port and
//! receive a snapshot of the tuner's I2C register cache at a fixed period:
//! `[0x48, 0x00, 32, reg[0], .., reg[31]]`.

use std::time::Duration;

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener,
        TcpStream,
    },
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::SdrDevice;

/// Frame opcode: periodic I2C register report.
pub const REPORT_I2C_REGISTERS: u8 = 0x48;

/// Registers per report frame.
pub const NUM_I2C_REGISTERS: usize = 32;

const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

/// give the tuner time to settle before the first snapshot
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Serves register report frames to one diagnostic client at a time.
///
/// A send failure just ends that client; the reporter goes back to
/// accepting. Snapshot failures skip the frame. Only shutdown ends the loop.
#[derive(Debug)]
pub struct RegisterReporter<D> {
    device: D,
    tcp_listener: TcpListener,
    period: Duration,
    settle_delay: Duration,
    shutdown: CancellationToken,
}

impl<D> RegisterReporter<D>
where
    D: SdrDevice,
{
    pub fn new(device: D, tcp_listener: TcpListener) -> Self {
        Self {
            device,
            tcp_listener,
            period: DEFAULT_PERIOD,
            settle_delay: DEFAULT_SETTLE_DELAY,
            shutdown: CancellationToken::new(),
        }
    }

    /// Time between report frames.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Delay between accepting a client and the first report frame.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Accept diagnostic clients until shutdown.
    pub async fn serve(self) -> Result<(), std::io::Error> {
        loop {
            tracing::debug!("listening for register clients");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.tcp_listener.accept() => {
                    let (connection, address) = result?;
                    let span = tracing::info_span!("register client", %address);
                    if let Err(error) = self.stream_registers(connection).instrument(span).await {
                        tracing::debug!(?error, "register client disconnected");
                    }
                }
            }
        }

        Ok(())
    }

    async fn stream_registers(&self, mut connection: TcpStream) -> Result<(), std::io::Error> {
        if let Err(error) = connection.set_linger(Some(Duration::ZERO)) {
            tracing::debug!(?error, "failed to set SO_LINGER");
        }

        tracing::debug!("register client accepted");

        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut registers = [0u8; NUM_I2C_REGISTERS];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            if let Err(error) = self.device.read_tuner_registers(&mut registers).await {
                tracing::debug!(?error, "register snapshot failed");
                continue;
            }

            let mut frame = [0u8; NUM_I2C_REGISTERS + 3];
            frame[0] = REPORT_I2C_REGISTERS;
            frame[1] = 0;
            frame[2] = NUM_I2C_REGISTERS as u8;
            frame[3..].copy_from_slice(&registers);

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = connection.write_all(&frame) => result?,
            }
        }
    }
}
