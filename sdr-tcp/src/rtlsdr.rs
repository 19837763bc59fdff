//! [`SdrDevice`] adapter for RTL2832 receivers driven through [librtlsdr][1].
//!
//! Control calls take tens of milliseconds on this hardware, so they are run
//! on the blocking pool instead of the async runtime. Samples are pulled by
//! a dedicated reader thread and handed to the session's [`SampleSink`].
//!
//! [1]: https://gitea.osmocom.org/sdr/rtl-sdr

use std::{
    ffi::c_int,
    ptr::null_mut,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread,
};

use parking_lot::Mutex;

use crate::{
    Gain,
    RawBlock,
    SampleSink,
    SdrDevice,
    TunerGainMode,
    TunerType,
    rtl_tcp::DongleInfo,
};

/// read block size: 16 KiB
///
/// librtlsdr wants a multiple of 512 and performs best around this size. At
/// a 2.4 MHz sample rate this is ~ 3.4 ms of samples per block.
const READ_BLOCK_SIZE: usize = 0x4000;

/// Errors returned by the librtlsdr adapter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("librtlsdr error: {function} returned {value}")]
    LibRtlSdr { function: &'static str, value: i32 },
    #[error("unknown tuner")]
    UnknownTuner,
    #[error("can't select gain level, because librtlsdr doesn't report any supported gain levels")]
    NoSupportedGains,
    #[error("invalid gain index: {index}")]
    InvalidGainIndex { index: usize },
    #[error("operation not supported by librtlsdr")]
    Unsupported,
    #[error("blocking task failed")]
    Runtime,
}

impl Error {
    fn from_lib(function: &'static str, value: i32) -> Self {
        Self::LibRtlSdr { function, value }
    }
}

/// librtlsdr signals failure through non-zero return codes; fold one into a
/// `Result` and leave a trace of what failed.
fn check(function: &'static str, ret: c_int) -> Result<(), Error> {
    if ret == 0 {
        Ok(())
    }
    else {
        tracing::debug!(function, ret, "librtlsdr call failed");
        Err(Error::from_lib(function, ret))
    }
}

/// An RTL2832 receiver.
///
/// Cheaply cloneable; all clones drive the same underlying device.
#[derive(Clone, Debug)]
pub struct RtlSdr {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    handle: Mutex<Handle>,
    tuner_type: TunerType,
    tuner_gains: Vec<i32>,
    reader: Mutex<Option<Reader>>,
}

#[derive(Debug)]
struct Reader {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl RtlSdr {
    /// Open the RTL-SDR with the given index.
    pub fn open(index: u32) -> Result<Self, Error> {
        let mut dev: rtlsdr_sys::rtlsdr_dev_t = null_mut();
        check("rtlsdr_open", unsafe {
            rtlsdr_sys::rtlsdr_open(&mut dev, index)
        })?;
        assert!(!dev.is_null(), "rtlsdr_open succeeded with a NULL handle");

        let tuner = unsafe { rtlsdr_sys::rtlsdr_get_tuner_type(dev) } as u32;
        if tuner == 0 {
            unsafe { rtlsdr_sys::rtlsdr_close(dev) };
            return Err(Error::UnknownTuner);
        }

        let tuner_gains = query_tuner_gains(dev);

        // the demod FIFO has to be flushed once before the first read
        check("rtlsdr_reset_buffer", unsafe {
            rtlsdr_sys::rtlsdr_reset_buffer(dev)
        })?;

        tracing::debug!(index, tuner, gains = tuner_gains.len(), "device opened");

        Ok(Self {
            inner: Arc::new(Inner {
                handle: Mutex::new(Handle {
                    dev,
                    last_gain_mode: None,
                }),
                tuner_type: TunerType(tuner),
                tuner_gains,
                reader: Mutex::new(None),
            }),
        })
    }

    /// Run a control call on the blocking pool; these take ~50 ms each.
    async fn with_handle<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Handle) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&mut inner.handle.lock()))
            .await
            .map_err(|_| Error::Runtime)?
    }
}

/// The gain table is fixed for an open device, so it is read once up front.
fn query_tuner_gains(dev: rtlsdr_sys::rtlsdr_dev_t) -> Vec<i32> {
    let count = unsafe { rtlsdr_sys::rtlsdr_get_tuner_gains(dev, null_mut()) };
    let Ok(count) = usize::try_from(count) else {
        return Vec::new();
    };
    if count == 0 {
        return Vec::new();
    }

    let mut gains = vec![0i32; count];
    let written = unsafe { rtlsdr_sys::rtlsdr_get_tuner_gains(dev, gains.as_mut_ptr()) };
    gains.truncate(usize::try_from(written).unwrap_or(0));
    gains
}

impl SdrDevice for RtlSdr {
    type Error = Error;

    fn dongle_info(&self) -> DongleInfo {
        DongleInfo::rtl(
            self.inner.tuner_type,
            self.inner
                .tuner_gains
                .len()
                .try_into()
                .expect("gain table length exceeds u32"),
        )
    }

    fn supported_sample_rates(&self) -> &[u32] {
        // librtlsdr accepts continuous ranges, not a discrete set
        &[]
    }

    async fn set_center_frequency(&self, frequency: u32) -> Result<(), Error> {
        self.with_handle(move |handle| handle.set_center_frequency(frequency))
            .await
    }

    async fn set_sample_rate(&self, sample_rate: u32) -> Result<(), Error> {
        self.with_handle(move |handle| handle.set_sample_rate(sample_rate))
            .await
    }

    async fn set_tuner_gain(&self, gain: Gain) -> Result<(), Error> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let selected = match gain {
                Gain::ManualValue(gain) => {
                    // find the nearest supported gain value
                    Some(
                        *inner
                            .tuner_gains
                            .iter()
                            .min_by_key(|supported| (**supported - gain).abs())
                            .ok_or(Error::NoSupportedGains)?,
                    )
                }
                Gain::ManualIndex(index) => {
                    Some(
                        *inner
                            .tuner_gains
                            .get(index)
                            .ok_or(Error::InvalidGainIndex { index })?,
                    )
                }
                Gain::Auto => None,
            };

            let mut handle = inner.handle.lock();
            match selected {
                Some(value) => {
                    // manual gain mode must be enabled first
                    handle.set_tuner_gain_mode(TunerGainMode::Manual)?;
                    handle.set_tuner_gain(value)
                }
                None => handle.set_tuner_gain_mode(TunerGainMode::Auto),
            }
        })
        .await
        .map_err(|_| Error::Runtime)?
    }

    async fn set_tuner_if_gain(&self, stage: i16, gain: i16) -> Result<(), Error> {
        self.with_handle(move |handle| handle.set_tuner_if_gain(stage.into(), gain.into()))
            .await
    }

    async fn set_agc_mode(&self, enable: bool) -> Result<(), Error> {
        self.with_handle(move |handle| handle.set_agc_mode(enable))
            .await
    }

    async fn set_bias_tee(&self, enable: bool) -> Result<(), Error> {
        // the generated bindings stop short of rtlsdr_set_bias_tee, so all
        // this can do is acknowledge the request and move on
        tracing::warn!(enable, "bias tee request ignored");
        Ok(())
    }

    async fn set_tuner_bandwidth(&self, bandwidth: u32) -> Result<(), Error> {
        self.with_handle(move |handle| handle.set_tuner_bandwidth(bandwidth))
            .await
    }

    async fn write_tuner_register(
        &self,
        register: u16,
        mask: u8,
        data: u16,
    ) -> Result<(), Error> {
        tracing::debug!(register, mask, data, "raw tuner register access not exposed");
        Err(Error::Unsupported)
    }

    async fn read_tuner_registers(&self, _registers: &mut [u8]) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    async fn start_rx(&self, sink: SampleSink) -> Result<(), Error> {
        // a leftover reader from a previous session must be gone first
        self.stop_rx().await?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::spawn({
            let inner = self.inner.clone();
            let stop = stop.clone();
            move || reader_thread(inner, sink, stop)
        });

        *self.inner.reader.lock() = Some(Reader { stop, thread });
        Ok(())
    }

    async fn stop_rx(&self) -> Result<(), Error> {
        let Some(reader) = self.inner.reader.lock().take() else {
            return Ok(());
        };

        reader.stop.store(true, Ordering::Relaxed);
        tokio::task::spawn_blocking(move || {
            if reader.thread.join().is_err() {
                tracing::error!("reader thread panicked");
            }
        })
        .await
        .map_err(|_| Error::Runtime)
    }
}

fn reader_thread(inner: Arc<Inner>, mut sink: SampleSink, stop: Arc<AtomicBool>) {
    let _guard = tracing::debug_span!("reader thread").entered();
    tracing::debug!("sample reader running");

    let mut block = vec![0u8; READ_BLOCK_SIZE];

    while !stop.load(Ordering::Relaxed) && !sink.is_closed() {
        // reads share the handle lock with control calls, so sampling always
        // sees the state a control call left behind
        let result = { inner.handle.lock().read_sync(&mut block) };

        match result {
            Ok(0) => {
                tracing::debug!("device stopped delivering samples, exiting");
                break;
            }
            Ok(n_read) => {
                sink.deliver(RawBlock::Unsigned8(&block[..n_read]));
            }
            Err(error) => {
                tracing::error!(?error, "reader thread error");
                break;
            }
        }
    }
}

#[derive(Debug)]
struct Handle {
    dev: rtlsdr_sys::rtlsdr_dev_t,

    /// gain mode we programmed last; switching to the mode that is already
    /// active would waste a control transfer, so those calls are elided
    last_gain_mode: Option<TunerGainMode>,
}

unsafe impl Send for Handle {}

impl Drop for Handle {
    fn drop(&mut self) {
        tracing::debug!("closing device");
        unsafe {
            rtlsdr_sys::rtlsdr_close(self.dev);
        }
    }
}

impl Handle {
    fn set_center_frequency(&mut self, frequency: u32) -> Result<(), Error> {
        tracing::debug!(frequency, "setting center frequency");
        check("rtlsdr_set_center_freq", unsafe {
            rtlsdr_sys::rtlsdr_set_center_freq(self.dev, frequency)
        })
    }

    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), Error> {
        tracing::debug!(sample_rate, "setting sample rate");
        check("rtlsdr_set_sample_rate", unsafe {
            rtlsdr_sys::rtlsdr_set_sample_rate(self.dev, sample_rate)
        })
    }

    fn set_tuner_gain_mode(&mut self, mode: TunerGainMode) -> Result<(), Error> {
        if self.last_gain_mode == Some(mode) {
            return Ok(());
        }

        tracing::debug!(?mode, "switching gain mode");
        let manual = match mode {
            TunerGainMode::Manual => 1,
            TunerGainMode::Auto => 0,
        };
        check("rtlsdr_set_tuner_gain_mode", unsafe {
            rtlsdr_sys::rtlsdr_set_tuner_gain_mode(self.dev, manual)
        })?;

        self.last_gain_mode = Some(mode);
        Ok(())
    }

    fn set_tuner_gain(&mut self, gain: i32) -> Result<(), Error> {
        tracing::debug!(gain, "setting tuner gain");
        check("rtlsdr_set_tuner_gain", unsafe {
            rtlsdr_sys::rtlsdr_set_tuner_gain(self.dev, gain)
        })
    }

    fn set_tuner_if_gain(&mut self, stage: i32, gain: i32) -> Result<(), Error> {
        tracing::debug!(stage, gain, "setting IF stage gain");
        check("rtlsdr_set_tuner_if_gain", unsafe {
            rtlsdr_sys::rtlsdr_set_tuner_if_gain(self.dev, stage, gain)
        })
    }

    fn set_tuner_bandwidth(&mut self, bandwidth: u32) -> Result<(), Error> {
        tracing::debug!(bandwidth, "setting tuner bandwidth");
        check("rtlsdr_set_tuner_bandwidth", unsafe {
            rtlsdr_sys::rtlsdr_set_tuner_bandwidth(self.dev, bandwidth)
        })
    }

    fn set_agc_mode(&mut self, enable: bool) -> Result<(), Error> {
        tracing::debug!(enable, "switching demod agc");
        check("rtlsdr_set_agc_mode", unsafe {
            rtlsdr_sys::rtlsdr_set_agc_mode(self.dev, enable as i32)
        })
    }

    /// Blocking read of one block of IQ bytes.
    fn read_sync(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut n_read: c_int = 0;
        let len = c_int::try_from(buffer.len()).expect("read block too large");

        let ret = unsafe {
            rtlsdr_sys::rtlsdr_read_sync(self.dev, buffer.as_mut_ptr().cast(), len, &mut n_read)
        };

        if ret == 0 {
            Ok(usize::try_from(n_read).expect("negative read length"))
        }
        else {
            Err(Error::from_lib("rtlsdr_read_sync", ret))
        }
    }
}
