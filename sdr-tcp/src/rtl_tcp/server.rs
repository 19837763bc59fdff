//! The streaming server: accept loop, per-client session lifecycle, sender
//! and command workers.

use std::{
    sync::Arc,
    time::Duration,
};

use bytes::{
    BufMut,
    buf::UninitSlice,
};
use futures_util::StreamExt;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
        BufReader,
    },
    net::{
        TcpListener,
        TcpStream,
        tcp::{
            OwnedReadHalf,
            OwnedWriteHalf,
        },
    },
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    DeviceController,
    SampleFormat,
    SdrDevice,
    device::SampleSink,
    queue,
    rtl_tcp::{
        COMMAND_LENGTH,
        Command,
        HEADER_LENGTH,
        InvalidCommand,
    },
};

/// default queue depth
///
/// at a 16 KiB transfer size this is up to 1 MiB of samples in flight.
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// size of the command read buffer: plenty for a few commands
const READ_BUFFER_SIZE: usize = 0x400;

/// Server errors.
///
/// Transport failures inside a running session end that session and are not
/// reported here; these are the failures that end the serve loop itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("accept failed")]
    Accept(#[source] std::io::Error),

    /// The 12-byte dongle-info send failed. The original server gives up
    /// entirely here, and so do we.
    #[error("handshake failed")]
    Handshake(#[source] std::io::Error),
}

/// An `rtl_tcp` server.
///
/// Like the original `rtl_tcp`, this serves one client at a time: while a
/// session is running the listener does not accept, and queued connection
/// attempts are picked up after the session ends.
#[derive(Debug)]
pub struct RtlTcpServer<D> {
    device: D,
    controller: Arc<DeviceController<D>>,
    tcp_listener: TcpListener,
    sample_format: SampleFormat,
    queue_depth: usize,
    shutdown: CancellationToken,
}

impl<D> RtlTcpServer<D>
where
    D: SdrDevice + Clone + Send + Sync + 'static,
{
    pub fn new(device: D, tcp_listener: TcpListener) -> Self {
        let controller = Arc::new(DeviceController::new(device.clone()));
        Self {
            device,
            controller,
            tcp_listener,
            sample_format: SampleFormat::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            shutdown: CancellationToken::new(),
        }
    }

    /// Share a controller that already carries state, e.g. from startup
    /// configuration.
    pub fn with_controller(mut self, controller: Arc<DeviceController<D>>) -> Self {
        self.controller = controller;
        self
    }

    /// Provide a [`CancellationToken`] with which the server (and a running
    /// session) can be shut down.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Wire format for 16-bit-native devices.
    pub fn with_sample_format(mut self, sample_format: SampleFormat) -> Self {
        self.sample_format = sample_format;
        self
    }

    /// Number of sample buffers kept in flight before the oldest is dropped.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn controller(&self) -> &Arc<DeviceController<D>> {
        &self.controller
    }

    /// Serve clients until shutdown.
    pub async fn serve(self) -> Result<(), Error> {
        loop {
            tracing::debug!("listening");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.tcp_listener.accept() => {
                    let (connection, address) = result.map_err(Error::Accept)?;
                    let span = tracing::info_span!("connection", %address);
                    self.run_session(connection).instrument(span).await?;
                }
            }
        }

        Ok(())
    }

    /// Drive one client from handshake to teardown.
    async fn run_session(&self, mut connection: TcpStream) -> Result<(), Error> {
        // a closing socket should discard unsent samples instead of lingering
        if let Err(error) = connection.set_linger(Some(Duration::ZERO)) {
            tracing::debug!(?error, "failed to set SO_LINGER");
        }

        let mut header = [0u8; HEADER_LENGTH];
        self.device.dongle_info().encode(&mut header[..]);
        connection
            .write_all(&header)
            .await
            .map_err(Error::Handshake)?;

        tracing::debug!("client accepted");

        let session = self.shutdown.child_token();
        let (producer, consumer) = queue::channel(self.queue_depth);

        if let Err(error) = self
            .device
            .start_rx(SampleSink::new(producer, self.sample_format))
            .await
        {
            tracing::error!(?error, "failed to start receiving");
            return Ok(());
        }

        let (tcp_read, tcp_write) = connection.into_split();
        let sender = tokio::spawn(sender_worker(tcp_write, consumer, session.clone()));

        command_worker(tcp_read, &self.controller, &session).await;

        // teardown order matters: stop the producer before draining, so no
        // new buffers arrive behind the drain
        session.cancel();
        if let Err(error) = self.device.stop_rx().await {
            tracing::error!(?error, "failed to stop receiving");
        }

        match sender.await {
            Ok(consumer) => {
                let dropped = consumer.dropped();
                if dropped > 0 {
                    tracing::debug!(dropped, "buffers were dropped during this session");
                }
                consumer.drain();
            }
            Err(error) => {
                tracing::error!(?error, "sender worker panicked");
            }
        }

        tracing::debug!("closing connection");
        Ok(())
    }
}

/// Writes queued sample buffers to the client until the session is cancelled,
/// the stream ends, or the socket fails. Returns the consumer so the session
/// can drain it.
async fn sender_worker(
    mut tcp_write: OwnedWriteHalf,
    mut consumer: queue::Consumer,
    session: CancellationToken,
) -> queue::Consumer {
    loop {
        let buffer = tokio::select! {
            _ = session.cancelled() => break,
            buffer = consumer.next() => {
                match buffer {
                    Some(buffer) => buffer,
                    None => {
                        tracing::debug!("sample stream ended");
                        break;
                    }
                }
            }
        };

        // the write races the token too, so a client that stops reading
        // cannot hold up teardown
        tokio::select! {
            _ = session.cancelled() => break,
            result = tcp_write.write_all(buffer.as_bytes()) => {
                if let Err(error) = result {
                    tracing::error!(?error, "sample write failed");
                    break;
                }
                consumer.recycle(buffer);
            }
        }
    }

    session.cancel();
    consumer
}

/// Reads 5-byte command frames and applies them until the session is
/// cancelled, the client disconnects, or the socket fails. A partial frame
/// at teardown is discarded.
async fn command_worker<D>(
    tcp_read: OwnedReadHalf,
    controller: &DeviceController<D>,
    session: &CancellationToken,
) where
    D: SdrDevice,
{
    let mut tcp_read = BufReader::with_capacity(READ_BUFFER_SIZE, tcp_read);
    let mut command_buffer = CommandBuffer::default();

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            result = tcp_read.read_buf(&mut command_buffer) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("client closed the connection");
                        break;
                    }
                    Ok(_) => {
                        match command_buffer.try_decode() {
                            Ok(Some(command)) => controller.apply(command).await,
                            Ok(None) => {}
                            Err(invalid) => {
                                tracing::warn!(command = ?invalid, "invalid command");
                            }
                        }
                    }
                    Err(error) => {
                        tracing::error!(?error, "command read failed");
                        break;
                    }
                }
            }
        }
    }

    session.cancel();
}

/// Accumulates a 5-byte command frame across short reads.
#[derive(Debug, Default)]
struct CommandBuffer {
    data: [u8; COMMAND_LENGTH],
    filled: usize,
}

impl CommandBuffer {
    fn is_full(&self) -> bool {
        self.filled == COMMAND_LENGTH
    }

    fn reset(&mut self) {
        self.filled = 0;
    }

    /// Decode a complete frame, if one has accumulated. The frame is
    /// consumed either way, so an unknown command doesn't wedge the stream.
    fn try_decode(&mut self) -> Result<Option<Command>, InvalidCommand> {
        if self.is_full() {
            let result = Command::decode(&self.data[..]);
            self.reset();
            result.map(Some)
        }
        else {
            Ok(None)
        }
    }
}

unsafe impl BufMut for CommandBuffer {
    fn remaining_mut(&self) -> usize {
        COMMAND_LENGTH - self.filled
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.filled += cnt;
        assert!(self.filled <= COMMAND_LENGTH);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.data[self.filled..])
    }
}
