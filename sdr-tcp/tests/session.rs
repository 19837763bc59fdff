//! End-to-end coverage of the streaming server over localhost sockets.

use std::{
    io,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use sdr_tcp::{
    Gain,
    RawBlock,
    SampleSink,
    SdrDevice,
    TunerType,
    reporter::RegisterReporter,
    rtl_tcp::{
        DongleInfo,
        server::RtlTcpServer,
    },
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpListener,
        TcpStream,
    },
    time::timeout,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    Frequency(u32),
    SampleRate(u32),
    Gain(Gain),
    StartRx,
    StopRx,
}

#[derive(Clone, Default)]
struct FakeDevice {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    sink: Option<SampleSink>,
}

impl FakeDevice {
    fn calls(&self) -> Vec<Call> {
        self.shared.lock().calls.clone()
    }

    fn has_sink(&self) -> bool {
        self.shared.lock().sink.is_some()
    }

    /// Play the device driver: deliver a block from the "callback" side.
    fn produce(&self, block: RawBlock<'_>) {
        self.shared
            .lock()
            .sink
            .as_mut()
            .expect("no active transfer")
            .deliver(block);
    }
}

impl SdrDevice for FakeDevice {
    type Error = io::Error;

    fn dongle_info(&self) -> DongleInfo {
        DongleInfo::rtl(TunerType::R820T, 29)
    }

    fn supported_sample_rates(&self) -> &[u32] {
        &[]
    }

    async fn set_center_frequency(&self, frequency: u32) -> Result<(), io::Error> {
        self.shared.lock().calls.push(Call::Frequency(frequency));
        Ok(())
    }

    async fn set_sample_rate(&self, sample_rate: u32) -> Result<(), io::Error> {
        self.shared.lock().calls.push(Call::SampleRate(sample_rate));
        Ok(())
    }

    async fn set_tuner_gain(&self, gain: Gain) -> Result<(), io::Error> {
        self.shared.lock().calls.push(Call::Gain(gain));
        Ok(())
    }

    async fn set_tuner_if_gain(&self, _stage: i16, _gain: i16) -> Result<(), io::Error> {
        Ok(())
    }

    async fn set_agc_mode(&self, _enable: bool) -> Result<(), io::Error> {
        Ok(())
    }

    async fn set_bias_tee(&self, _enable: bool) -> Result<(), io::Error> {
        Ok(())
    }

    async fn set_tuner_bandwidth(&self, _bandwidth: u32) -> Result<(), io::Error> {
        Ok(())
    }

    async fn write_tuner_register(
        &self,
        _register: u16,
        _mask: u8,
        _data: u16,
    ) -> Result<(), io::Error> {
        Ok(())
    }

    async fn read_tuner_registers(&self, registers: &mut [u8]) -> Result<(), io::Error> {
        for (index, register) in registers.iter_mut().enumerate() {
            *register = index as u8;
        }
        Ok(())
    }

    async fn start_rx(&self, sink: SampleSink) -> Result<(), io::Error> {
        let mut shared = self.shared.lock();
        shared.calls.push(Call::StartRx);
        shared.sink = Some(sink);
        Ok(())
    }

    async fn stop_rx(&self) -> Result<(), io::Error> {
        let mut shared = self.shared.lock();
        shared.calls.push(Call::StopRx);
        shared.sink = None;
        Ok(())
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn streams_samples_and_applies_commands() {
    let device = FakeDevice::default();
    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = tcp_listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let server = tokio::spawn(
        RtlTcpServer::new(device.clone(), tcp_listener)
            .with_shutdown(shutdown.clone())
            .serve(),
    );

    let mut client = TcpStream::connect(address).await.unwrap();

    // the 12-byte handshake arrives before anything else
    let mut header = [0u8; 12];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[..4], &[0x52, 0x54, 0x4C, 0x30]);
    assert_eq!(u32::from_be_bytes(header[4..8].try_into().unwrap()), 5);
    assert_eq!(u32::from_be_bytes(header[8..12].try_into().unwrap()), 29);

    wait_for(|| device.has_sink()).await;

    // sample bytes flow from the device callback to the socket unchanged
    device.produce(RawBlock::Unsigned8(&[1, 2, 3, 4]));
    let mut samples = [0u8; 4];
    client.read_exact(&mut samples).await.unwrap();
    assert_eq!(samples, [1, 2, 3, 4]);

    // a tune command lands on the device
    client
        .write_all(&[0x01, 0x05, 0xF5, 0xE1, 0x00])
        .await
        .unwrap();
    wait_for(|| device.calls().contains(&Call::Frequency(100_000_000))).await;

    // disconnecting tears the session down and stops the transfer
    drop(client);
    wait_for(|| device.calls().contains(&Call::StopRx)).await;

    // the listener accepts again after the session ends
    let mut second = TcpStream::connect(address).await.unwrap();
    second.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[..4], b"RTL0");
    drop(second);

    shutdown.cancel();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .expect("server task failed")
        .expect("server returned an error");
}

#[tokio::test]
async fn cancellation_wakes_an_idle_session() {
    let device = FakeDevice::default();
    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = tcp_listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let server = tokio::spawn(
        RtlTcpServer::new(device.clone(), tcp_listener)
            .with_shutdown(shutdown.clone())
            .serve(),
    );

    let mut client = TcpStream::connect(address).await.unwrap();
    let mut header = [0u8; 12];
    client.read_exact(&mut header).await.unwrap();
    wait_for(|| device.has_sink()).await;

    // no samples are flowing; the sender is parked on an empty queue
    shutdown.cancel();

    timeout(Duration::from_secs(2), server)
        .await
        .expect("cancellation did not wake the session")
        .expect("server task failed")
        .expect("server returned an error");
    assert!(device.calls().contains(&Call::StopRx));
}

#[tokio::test]
async fn register_reporter_frames_the_snapshot() {
    let device = FakeDevice::default();
    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = tcp_listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let reporter = tokio::spawn(
        RegisterReporter::new(device, tcp_listener)
            .with_settle_delay(Duration::ZERO)
            .with_period(Duration::from_millis(10))
            .with_shutdown(shutdown.clone())
            .serve(),
    );

    let mut client = TcpStream::connect(address).await.unwrap();

    let mut frame = [0u8; 35];
    for _ in 0..2 {
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x48);
        assert_eq!(frame[1], 0x00);
        assert_eq!(frame[2], 32);
        for (index, register) in frame[3..].iter().enumerate() {
            assert_eq!(*register, index as u8);
        }
    }

    shutdown.cancel();
    timeout(Duration::from_secs(5), reporter)
        .await
        .expect("reporter did not shut down")
        .expect("reporter task failed")
        .expect("reporter returned an error");
}
