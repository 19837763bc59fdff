use crate::{
    Gain,
    SampleFormat,
    pack,
    queue,
    rtl_tcp::DongleInfo,
};

/// A block of raw samples as delivered by a device driver.
#[derive(Clone, Copy, Debug)]
pub enum RawBlock<'a> {
    /// Signed 16-bit IQ components (Airspy class).
    Signed16(&'a [i16]),
    /// Unsigned 8-bit IQ components (RTL2832 class), already in wire layout.
    Unsigned8(&'a [u8]),
}

/// Where a device driver delivers its samples.
///
/// The sink owns the producer half of the session's sample queue and the
/// negotiated wire format. [`deliver`][Self::deliver] is meant to be called
/// from the driver's transfer callback: it never blocks on the network,
/// never waits on the consumer, and allocates at most one buffer per call
/// (none once the free list is warm). When the queue is full the oldest
/// buffer is silently retired in favor of the new one.
#[derive(Debug)]
pub struct SampleSink {
    producer: queue::Producer,
    format: SampleFormat,
}

impl SampleSink {
    pub(crate) fn new(producer: queue::Producer, format: SampleFormat) -> Self {
        Self { producer, format }
    }

    /// Pack `block` into the wire format and enqueue it.
    pub fn deliver(&mut self, block: RawBlock<'_>) {
        let mut buffer = self.producer.take_free();
        pack::pack_into(&mut buffer, block, self.format);
        self.producer.push(buffer);
    }

    /// The wire format this sink packs into.
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Number of buffers retired by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.producer.dropped()
    }

    /// True once the session has gone away. Drivers can use this to stop
    /// transfers early instead of waiting for `stop_rx`.
    pub fn is_closed(&self) -> bool {
        self.producer.is_closed()
    }
}

/// An SDR receiver as seen by the streaming server.
///
/// # Synchronization contract
///
/// Control methods are called from the command loop while a transfer started
/// with [`start_rx`][Self::start_rx] is running; implementations must
/// synchronize internally and must not require callers to hold any lock
/// across these calls. `start_rx` and `stop_rx` may block on USB traffic.
///
/// # Delivery contract
///
/// The context an implementation drives [`SampleSink::deliver`] from is
/// treated as a hard real-time boundary: the sink never blocks there, so
/// implementations are free to call it straight from a transfer callback.
pub trait SdrDevice {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The handshake identity sent to every client.
    fn dongle_info(&self) -> DongleInfo;

    /// The discrete sample rates this device supports, or an empty slice if
    /// it accepts a continuous range.
    fn supported_sample_rates(&self) -> &[u32];

    /// Tune to `frequency` Hz. Frequency-correction math happens above this
    /// call; implementations program the value as given.
    fn set_center_frequency(
        &self,
        frequency: u32,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Set the sample rate in Hz.
    fn set_sample_rate(
        &self,
        sample_rate: u32,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Set the tuner gain, or hand gain control to the tuner.
    fn set_tuner_gain(&self, gain: Gain) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Set the gain of a single IF stage, in tenths of a dB.
    fn set_tuner_if_gain(
        &self,
        stage: i16,
        gain: i16,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Demodulator AGC on or off.
    fn set_agc_mode(&self, enable: bool) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Switch bias-tee power on the antenna port.
    fn set_bias_tee(&self, enable: bool) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Set the tuner filter bandwidth in Hz. 0 selects automatic bandwidth.
    fn set_tuner_bandwidth(
        &self,
        bandwidth: u32,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Raw write to a tuner register: `data` masked by `mask`.
    fn write_tuner_register(
        &self,
        register: u16,
        mask: u8,
        data: u16,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Snapshot of the tuner's I2C register cache into `registers`.
    fn read_tuner_registers(
        &self,
        registers: &mut [u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Begin delivering samples into `sink` until [`stop_rx`][Self::stop_rx].
    fn start_rx(&self, sink: SampleSink) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Stop a running transfer and release the sink.
    fn stop_rx(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
