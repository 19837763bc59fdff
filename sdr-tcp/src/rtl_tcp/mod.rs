//! The `rtl_tcp` wire protocol.
//!
//! The protocol is outlined [here][1], but the `rtl_tcp` [source code][2] and
//! the QIRX Airspy port were used for reference.
//!
//! [1]: https://k3xec.com/rtl-tcp/
//! [2]: https://github.com/osmocom/rtl-sdr/blob/master/src/rtl_tcp.c

use bytes::{
    Buf,
    BufMut,
};

use crate::{
    SampleFormat,
    TunerGainMode,
    TunerType,
};

pub mod server;

/// Handshake length in bytes: 4 bytes magic and two big-endian u32 words.
pub const HEADER_LENGTH: usize = 12;

/// Length of a command in bytes
///
/// 1 byte for the command opcode, 4 bytes for the argument.
pub const COMMAND_LENGTH: usize = 5;

/// Magic sent by servers fronting an RTL2832 receiver.
pub const MAGIC_RTL: &[u8; 4] = b"RTL0";

/// Magic sent by servers fronting an Airspy receiver.
pub const MAGIC_AIRSPY: &[u8; 4] = b"ASPY";

/// Commands that can be sent to the server.
///
/// The argument is always a single big-endian u32; variants carrying
/// narrower fields document how they are packed into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SetCenterFrequency {
        frequency: u32,
    },
    SetSampleRate {
        sample_rate: u32,
    },
    SetTunerGainMode {
        mode: TunerGainMode,
    },
    SetTunerGain {
        gain: i32,
    },
    SetFrequencyCorrection {
        ppm: i32,
    },
    /// Stage in the low 16 bits, gain in the high 16 bits.
    SetTunerIfGain {
        stage: i16,
        gain: i16,
    },
    SetTestMode {
        enable: bool,
    },
    SetAgcMode {
        enable: bool,
    },
    SetDirectSampling {
        mode: u32,
    },
    SetOffsetTuning {
        enable: bool,
    },
    SetRtlXtal {
        frequency: u32,
    },
    SetTunerXtal {
        frequency: u32,
    },
    SetTunerGainIndex {
        index: u32,
    },
    SetBiasTee {
        enable: bool,
    },
    SetTunerBandwidth {
        bandwidth: u32,
    },
    UdpEstablish,
    UdpTerminate,
    /// Register in bits 31..20, mask in bits 19..12, data in bits 11..0.
    WriteTunerRegister {
        register: u16,
        mask: u8,
        data: u16,
    },
}

impl Command {
    pub fn decode<B: Buf>(mut buffer: B) -> Result<Self, InvalidCommand> {
        match buffer.get_u8() {
            0x01 => {
                Ok(Self::SetCenterFrequency {
                    frequency: buffer.get_u32(),
                })
            }
            0x02 => {
                Ok(Self::SetSampleRate {
                    sample_rate: buffer.get_u32(),
                })
            }
            0x03 => {
                Ok(Self::SetTunerGainMode {
                    mode: if buffer.get_u32() == 0 {
                        TunerGainMode::Auto
                    }
                    else {
                        TunerGainMode::Manual
                    },
                })
            }
            0x04 => {
                Ok(Self::SetTunerGain {
                    gain: buffer.get_i32(),
                })
            }
            0x05 => {
                Ok(Self::SetFrequencyCorrection {
                    ppm: buffer.get_i32(),
                })
            }
            0x06 => {
                let argument = buffer.get_u32();
                Ok(Self::SetTunerIfGain {
                    stage: (argument & 0xffff) as i16,
                    gain: (argument >> 16) as i16,
                })
            }
            0x07 => {
                Ok(Self::SetTestMode {
                    enable: buffer.get_u32() != 0,
                })
            }
            0x08 => {
                Ok(Self::SetAgcMode {
                    enable: buffer.get_u32() != 0,
                })
            }
            0x09 => {
                Ok(Self::SetDirectSampling {
                    mode: buffer.get_u32(),
                })
            }
            0x0a => {
                Ok(Self::SetOffsetTuning {
                    enable: buffer.get_u32() != 0,
                })
            }
            0x0b => {
                Ok(Self::SetRtlXtal {
                    frequency: buffer.get_u32(),
                })
            }
            0x0c => {
                Ok(Self::SetTunerXtal {
                    frequency: buffer.get_u32(),
                })
            }
            0x0d => {
                Ok(Self::SetTunerGainIndex {
                    index: buffer.get_u32(),
                })
            }
            // 0x0e is the pre-ExtIO bias-tee code some clients still send
            0x0e | 0x0f => {
                Ok(Self::SetBiasTee {
                    enable: buffer.get_u32() != 0,
                })
            }
            0x40 => {
                Ok(Self::SetTunerBandwidth {
                    bandwidth: buffer.get_u32(),
                })
            }
            0x41 => {
                let _ = buffer.get_u32();
                Ok(Self::UdpEstablish)
            }
            0x42 => {
                let _ = buffer.get_u32();
                Ok(Self::UdpTerminate)
            }
            0x43 => {
                let argument = buffer.get_u32();
                Ok(Self::WriteTunerRegister {
                    register: ((argument >> 20) & 0xfff) as u16,
                    mask: ((argument >> 12) & 0xff) as u8,
                    data: (argument & 0xfff) as u16,
                })
            }
            command => {
                Err(InvalidCommand {
                    command,
                    arguments: buffer.get_bytes(),
                })
            }
        }
    }

    pub fn encode<B: BufMut>(&self, mut buffer: B) {
        match self {
            Self::SetCenterFrequency { frequency } => {
                buffer.put_u8(0x01);
                buffer.put_u32(*frequency);
            }
            Self::SetSampleRate { sample_rate } => {
                buffer.put_u8(0x02);
                buffer.put_u32(*sample_rate);
            }
            Self::SetTunerGainMode { mode } => {
                buffer.put_u8(0x03);
                buffer.put_u32(match mode {
                    TunerGainMode::Auto => 0,
                    TunerGainMode::Manual => 1,
                });
            }
            Self::SetTunerGain { gain } => {
                buffer.put_u8(0x04);
                buffer.put_i32(*gain);
            }
            Self::SetFrequencyCorrection { ppm } => {
                buffer.put_u8(0x05);
                buffer.put_i32(*ppm);
            }
            Self::SetTunerIfGain { stage, gain } => {
                buffer.put_u8(0x06);
                buffer.put_u32(
                    (u32::from(*gain as u16) << 16) | u32::from(*stage as u16),
                );
            }
            Self::SetTestMode { enable } => {
                buffer.put_u8(0x07);
                buffer.put_u32(*enable as u32);
            }
            Self::SetAgcMode { enable } => {
                buffer.put_u8(0x08);
                buffer.put_u32(*enable as u32);
            }
            Self::SetDirectSampling { mode } => {
                buffer.put_u8(0x09);
                buffer.put_u32(*mode);
            }
            Self::SetOffsetTuning { enable } => {
                buffer.put_u8(0x0a);
                buffer.put_u32(*enable as u32);
            }
            Self::SetRtlXtal { frequency } => {
                buffer.put_u8(0x0b);
                buffer.put_u32(*frequency);
            }
            Self::SetTunerXtal { frequency } => {
                buffer.put_u8(0x0c);
                buffer.put_u32(*frequency);
            }
            Self::SetTunerGainIndex { index } => {
                buffer.put_u8(0x0d);
                buffer.put_u32(*index);
            }
            Self::SetBiasTee { enable } => {
                buffer.put_u8(0x0f);
                buffer.put_u32(*enable as u32);
            }
            Self::SetTunerBandwidth { bandwidth } => {
                buffer.put_u8(0x40);
                buffer.put_u32(*bandwidth);
            }
            Self::UdpEstablish => {
                buffer.put_u8(0x41);
                buffer.put_u32(0);
            }
            Self::UdpTerminate => {
                buffer.put_u8(0x42);
                buffer.put_u32(0);
            }
            Self::WriteTunerRegister {
                register,
                mask,
                data,
            } => {
                buffer.put_u8(0x43);
                buffer.put_u32(
                    (u32::from(*register & 0xfff) << 20)
                        | (u32::from(*mask) << 12)
                        | u32::from(*data & 0xfff),
                );
            }
        }
    }
}

/// Error for when an invalid command is received.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
#[error("Invalid rtl_tcp command: 0x{command:02x} (arguments: {arguments:?})")]
pub struct InvalidCommand {
    pub command: u8,
    pub arguments: [u8; 4],
}

/// The 12-byte identity a server sends once per connection, before any
/// sample byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DongleInfo {
    /// `"RTL0"` or `"ASPY"`.
    pub magic: [u8; 4],

    /// Tuner type word. For the Airspy variant the bit-width selector rides
    /// one byte above the tuner code, exactly as QIRX expects:
    /// `(selector << 8) | tuner_code`.
    pub tuner_type: u32,

    /// Number of gain levels supported by the tuner.
    pub tuner_gain_count: u32,
}

impl DongleInfo {
    /// Identity of an RTL2832 server.
    pub fn rtl(tuner_type: TunerType, tuner_gain_count: u32) -> Self {
        Self {
            magic: *MAGIC_RTL,
            tuner_type: tuner_type.0,
            tuner_gain_count,
        }
    }

    /// Identity of an Airspy server streaming `format`. The Airspy carries
    /// an R820T tuner, so that is the code reported next to the bit width.
    pub fn airspy(format: SampleFormat, tuner_gain_count: u32) -> Self {
        Self {
            magic: *MAGIC_AIRSPY,
            tuner_type: (u32::from(format.selector()) << 8) | TunerType::R820T.0,
            tuner_gain_count,
        }
    }

    pub fn encode<B: BufMut>(&self, mut buffer: B) {
        buffer.put_slice(&self.magic);
        buffer.put_u32(self.tuner_type);
        buffer.put_u32(self.tuner_gain_count);
    }

    pub fn decode<B: Buf>(mut buffer: B) -> Self {
        Self {
            magic: buffer.get_bytes(),
            tuner_type: buffer.get_u32(),
            tuner_gain_count: buffer.get_u32(),
        }
    }
}

pub(crate) trait BufReadBytesExt {
    fn get_bytes<const N: usize>(&mut self) -> [u8; N];
}

impl<B: Buf> BufReadBytesExt for B {
    fn get_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut data: [u8; N] = [0; N];
        self.copy_to_slice(&mut data[..]);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::{
        COMMAND_LENGTH,
        Command,
        DongleInfo,
        HEADER_LENGTH,
        InvalidCommand,
    };
    use crate::{
        SampleFormat,
        TunerGainMode,
        TunerType,
    };

    fn decode(frame: [u8; COMMAND_LENGTH]) -> Result<Command, InvalidCommand> {
        Command::decode(&frame[..])
    }

    #[test]
    fn decodes_a_tune_command() {
        assert_eq!(
            decode([0x01, 0x05, 0xF5, 0xE1, 0x00]),
            Ok(Command::SetCenterFrequency {
                frequency: 100_000_000
            })
        );
    }

    #[test]
    fn decodes_gain_mode() {
        assert_eq!(
            decode([0x03, 0x00, 0x00, 0x00, 0x00]),
            Ok(Command::SetTunerGainMode {
                mode: TunerGainMode::Auto
            })
        );
        assert_eq!(
            decode([0x03, 0x00, 0x00, 0x00, 0x01]),
            Ok(Command::SetTunerGainMode {
                mode: TunerGainMode::Manual
            })
        );
    }

    #[test]
    fn decodes_if_gain_fields() {
        // gain 100 in the high half, stage 3 in the low half
        assert_eq!(
            decode([0x06, 0x00, 0x64, 0x00, 0x03]),
            Ok(Command::SetTunerIfGain {
                stage: 3,
                gain: 100
            })
        );
    }

    #[test]
    fn decodes_a_raw_register_write() {
        assert_eq!(
            decode([0x43, 0x01, 0x30, 0xA0, 0x55]),
            Ok(Command::WriteTunerRegister {
                register: 0x013,
                mask: 0x0A,
                data: 0x055,
            })
        );
    }

    #[test]
    fn accepts_both_bias_tee_codes() {
        let expected = Ok(Command::SetBiasTee { enable: true });
        assert_eq!(decode([0x0f, 0x00, 0x00, 0x00, 0x01]), expected);
        assert_eq!(decode([0x0e, 0x00, 0x00, 0x00, 0x01]), expected);
    }

    #[test]
    fn unknown_codes_keep_their_arguments() {
        assert_eq!(
            decode([0x7f, 0xde, 0xad, 0xbe, 0xef]),
            Err(InvalidCommand {
                command: 0x7f,
                arguments: [0xde, 0xad, 0xbe, 0xef],
            })
        );
    }

    #[test]
    fn commands_survive_an_encode_decode_cycle() {
        let commands = [
            Command::SetCenterFrequency {
                frequency: 105_500_000,
            },
            Command::SetFrequencyCorrection { ppm: -12 },
            Command::SetTunerIfGain {
                stage: 2,
                gain: -30,
            },
            Command::SetTunerBandwidth { bandwidth: 250_000 },
            Command::WriteTunerRegister {
                register: 0xfff,
                mask: 0xff,
                data: 0xfff,
            },
        ];

        for command in commands {
            let mut frame = Vec::with_capacity(COMMAND_LENGTH);
            command.encode(&mut frame);
            assert_eq!(frame.len(), COMMAND_LENGTH);
            assert_eq!(Command::decode(&frame[..]), Ok(command));
        }
    }

    #[test]
    fn rtl_handshake_layout() {
        let info = DongleInfo::rtl(TunerType::R820T, 29);
        let mut header = Vec::with_capacity(HEADER_LENGTH);
        info.encode(&mut header);

        assert_eq!(
            header,
            [0x52, 0x54, 0x4C, 0x30, 0, 0, 0, 5, 0, 0, 0, 29]
        );
        assert_eq!(DongleInfo::decode(&header[..]), info);
    }

    #[test]
    fn airspy_handshake_carries_the_bit_width() {
        let info = DongleInfo::airspy(SampleFormat::Iq8, 15);
        let mut header = Vec::with_capacity(HEADER_LENGTH);
        info.encode(&mut header);

        assert_eq!(&header[..4], b"ASPY");
        // bit-width selector one byte above the tuner code
        assert_eq!(&header[4..8], &[0, 0, 1, 5]);
        assert_eq!(&header[8..], &[0, 0, 0, 15]);
    }
}
