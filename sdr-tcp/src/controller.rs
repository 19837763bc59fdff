use parking_lot::Mutex;

use crate::{
    Gain,
    SdrDevice,
    TunerGainMode,
    rtl_tcp::Command,
};

/// The legacy rate DAB clients request; Airspy-class devices serve it at
/// twice that.
const LEGACY_DAB_RATE: u32 = 2_048_000;
const NATIVE_DAB_RATE: u32 = 4_096_000;

/// Logical receiver state tracked above the device.
///
/// The frequency actually programmed into hardware is always
/// `round(center_frequency * (1 + ppm_error / 1e6))`; changing either field
/// re-tunes.
#[derive(Clone, Copy, Debug)]
pub struct DeviceState {
    /// Last commanded frequency in Hz, before ppm correction.
    pub center_frequency: u32,
    /// Frequency correction in parts per million.
    pub ppm_error: i32,
    /// Whether bias-tee power is switched on.
    pub bias_tee: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            center_frequency: 100_000_000,
            ppm_error: 0,
            bias_tee: false,
        }
    }
}

/// Applies decoded commands to an [`SdrDevice`], translating protocol values
/// into device values on the way.
///
/// Device rejections of client commands are logged and swallowed; a
/// misbehaving client must not be able to take the session down. The typed
/// setters are for process startup, where a failure *is* fatal.
#[derive(Debug)]
pub struct DeviceController<D> {
    device: D,
    state: Mutex<DeviceState>,
}

impl<D> DeviceController<D>
where
    D: SdrDevice,
{
    pub fn new(device: D) -> Self {
        Self::with_state(device, DeviceState::default())
    }

    pub fn with_state(device: D, state: DeviceState) -> Self {
        Self {
            device,
            state: Mutex::new(state),
        }
    }

    /// A copy of the current logical state.
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Tune to `frequency` Hz, honoring the stored ppm correction.
    pub async fn set_frequency(&self, frequency: u32) -> Result<(), D::Error> {
        self.state.lock().center_frequency = frequency;
        self.retune().await
    }

    /// Store a new ppm correction and re-tune the current frequency.
    pub async fn set_frequency_correction(&self, ppm: i32) -> Result<(), D::Error> {
        self.state.lock().ppm_error = ppm;
        self.retune().await
    }

    async fn retune(&self) -> Result<(), D::Error> {
        let (frequency, ppm) = {
            let state = self.state.lock();
            (state.center_frequency, state.ppm_error)
        };
        self.device
            .set_center_frequency(corrected_frequency(frequency, ppm))
            .await
    }

    /// Apply a sample rate, translating legacy requests for devices with a
    /// discrete rate set.
    pub async fn set_sample_rate(&self, sample_rate: u32) -> Result<(), D::Error> {
        self.device
            .set_sample_rate(self.translate_sample_rate(sample_rate))
            .await
    }

    fn translate_sample_rate(&self, requested: u32) -> u32 {
        let advertised = self.device.supported_sample_rates();
        if requested == LEGACY_DAB_RATE
            && !advertised.is_empty()
            && !advertised.contains(&LEGACY_DAB_RATE)
            && advertised.contains(&NATIVE_DAB_RATE)
        {
            tracing::debug!(requested, actual = NATIVE_DAB_RATE, "remapping sample rate");
            return NATIVE_DAB_RATE;
        }
        requested
    }

    pub async fn set_gain(&self, gain: Gain) -> Result<(), D::Error> {
        self.device.set_tuner_gain(gain).await
    }

    pub async fn set_bias_tee(&self, enable: bool) -> Result<(), D::Error> {
        self.device.set_bias_tee(enable).await?;
        self.state.lock().bias_tee = enable;
        Ok(())
    }

    /// Apply one decoded client command. Never fails: device rejections and
    /// unsupported requests are logged with the command that caused them.
    pub async fn apply(&self, command: Command) {
        if let Err(error) = self.dispatch(command).await {
            tracing::warn!(?command, ?error, "device rejected command");
        }
    }

    async fn dispatch(&self, command: Command) -> Result<(), D::Error> {
        match command {
            Command::SetCenterFrequency { frequency } => {
                self.set_frequency(frequency).await?;
            }
            Command::SetSampleRate { sample_rate } => {
                self.set_sample_rate(sample_rate).await?;
            }
            Command::SetTunerGainMode { mode } => {
                if mode == TunerGainMode::Auto {
                    self.device.set_tuner_gain(Gain::Auto).await?;
                }
                else {
                    // don't do anything here. the next gain value will set
                    // the mode to manual automatically
                }
            }
            Command::SetTunerGain { gain } => {
                self.device.set_tuner_gain(Gain::ManualValue(gain)).await?;
            }
            Command::SetFrequencyCorrection { ppm } => {
                self.set_frequency_correction(ppm).await?;
            }
            Command::SetTunerIfGain { stage, gain } => {
                self.device.set_tuner_if_gain(stage, gain).await?;
            }
            Command::SetAgcMode { enable } => {
                self.device.set_agc_mode(enable).await?;
            }
            Command::SetTunerGainIndex { index } => {
                if let Ok(index) = usize::try_from(index) {
                    self.device.set_tuner_gain(Gain::ManualIndex(index)).await?;
                }
                else {
                    tracing::error!(?index, "gain index doesn't fit into an usize!");
                }
            }
            Command::SetBiasTee { enable } => {
                self.set_bias_tee(enable).await?;
            }
            Command::SetTunerBandwidth { bandwidth } => {
                self.device.set_tuner_bandwidth(bandwidth).await?;
            }
            Command::WriteTunerRegister {
                register,
                mask,
                data,
            } => {
                tracing::info!(
                    "set i2c register 0x{register:03x} to 0x{data:03x} with mask 0x{mask:02x}"
                );
                self.device
                    .write_tuner_register(register, mask, data)
                    .await?;
            }
            Command::SetTestMode { .. }
            | Command::SetDirectSampling { .. }
            | Command::SetOffsetTuning { .. }
            | Command::SetRtlXtal { .. }
            | Command::SetTunerXtal { .. }
            | Command::UdpEstablish
            | Command::UdpTerminate => {
                tracing::debug!(?command, "command not implemented");
            }
        }

        Ok(())
    }
}

/// `frequency`, corrected by `ppm` parts per million.
fn corrected_frequency(frequency: u32, ppm: i32) -> u32 {
    (f64::from(frequency) * (1.0 + f64::from(ppm) / 1e6)).round() as u32
}
