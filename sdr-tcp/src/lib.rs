//! # `rtl_tcp`-compatible streaming server for SDR receivers
//!
//! This crate fronts a software-defined-radio USB receiver with a TCP server
//! speaking the wire protocol originally defined by [`rtl_tcp`][1]: a 12-byte
//! dongle-info handshake, a raw IQ sample stream, and fixed 5-byte control
//! commands on the same socket.
//!
//! The hardware is abstracted behind the [`SdrDevice`] trait. An adapter for
//! [librtlsdr][2] devices is available behind the `librtlsdr` cargo feature;
//! 16-bit-native receivers (Airspy class) plug in through the same trait and
//! get their samples repacked to the negotiated [`SampleFormat`] on the way
//! out.
//!
//! [1]: https://github.com/osmocom/rtl-sdr/blob/master/src/rtl_tcp.c
//! [2]: https://gitea.osmocom.org/sdr/rtl-sdr

mod controller;
mod device;
mod pack;
mod queue;
pub mod reporter;
pub mod rtl_tcp;

#[cfg(feature = "librtlsdr")]
pub mod rtlsdr;

use std::fmt::Debug;

pub use crate::{
    controller::{
        DeviceController,
        DeviceState,
    },
    device::{
        RawBlock,
        SampleSink,
        SdrDevice,
    },
    queue::SampleBuffer,
};

/// On-wire sample layout negotiated for a connection.
///
/// Selects both the packer transform and the per-sample byte count. Receivers
/// whose native format is already unsigned 8-bit IQ (RTL2832) stream
/// unchanged regardless of this setting; 16-bit-native receivers are packed
/// down to the selected width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SampleFormat {
    /// 16 bits per component, passthrough. 4 bytes per IQ pair.
    #[default]
    Iq16,
    /// 8 bits per component. 2 bytes per IQ pair.
    Iq8,
    /// 4 bits per component, I in the low nibble. 1 byte per IQ pair.
    Iq4,
}

impl SampleFormat {
    /// The bit-width selector carried by the `"ASPY"` handshake.
    pub const fn selector(self) -> u8 {
        match self {
            Self::Iq16 => 2,
            Self::Iq8 => 1,
            Self::Iq4 => 0,
        }
    }

    /// Map a bits-per-component count (16, 8 or 4) to a format.
    pub const fn from_bit_width(bits: u32) -> Option<Self> {
        match bits {
            16 => Some(Self::Iq16),
            8 => Some(Self::Iq8),
            4 => Some(Self::Iq4),
            _ => None,
        }
    }

    /// Bytes one IQ pair occupies on the wire.
    pub const fn bytes_per_pair(self) -> usize {
        match self {
            Self::Iq16 => 4,
            Self::Iq8 => 2,
            Self::Iq4 => 1,
        }
    }
}

/// Tuner gain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gain {
    /// Gain in tenths of a dB
    ManualValue(i32),
    /// Index into the tuner's gain table.
    ManualIndex(usize),
    /// Auto gain control
    Auto,
}

/// Tuner gain mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TunerGainMode {
    /// Tuner gain is set manually
    Manual,
    /// Tuner gain is set automatically by the tuner.
    Auto,
}

/// The type of tuner behind a device, as reported in the handshake.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunerType(pub u32);

impl TunerType {
    pub const UNKNOWN: Self = Self(0);
    pub const E4000: Self = Self(1);
    pub const FC0012: Self = Self(2);
    pub const FC0013: Self = Self(3);
    pub const FC2580: Self = Self(4);
    pub const R820T: Self = Self(5);
    pub const R828D: Self = Self(6);
}

impl Debug for TunerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "TunerType::UNKNOWN"),
            Self::E4000 => write!(f, "TunerType::E4000"),
            Self::FC0012 => write!(f, "TunerType::FC0012"),
            Self::FC0013 => write!(f, "TunerType::FC0013"),
            Self::FC2580 => write!(f, "TunerType::FC2580"),
            Self::R820T => write!(f, "TunerType::R820T"),
            Self::R828D => write!(f, "TunerType::R828D"),
            _ => write!(f, "TunerType({})", self.0),
        }
    }
}
