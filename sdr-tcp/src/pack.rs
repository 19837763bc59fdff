//! Conversion of raw device blocks into the on-wire sample layout.
//!
//! RTL2832-class receivers already deliver unsigned 8-bit IQ, which goes out
//! unchanged. 16-bit-native receivers (Airspy class) carry signed 12-bit
//! data in 16-bit words and are packed down to the negotiated width.

use crate::{
    SampleFormat,
    device::RawBlock,
    queue::SampleBuffer,
};

/// Fill `buffer` with the on-wire rendition of `block`.
///
/// The buffer is cleared first; its allocation is reused, so a recycled
/// buffer makes this allocation-free once warmed up.
pub(crate) fn pack_into(buffer: &mut SampleBuffer, block: RawBlock<'_>, format: SampleFormat) {
    let out = buffer.data_mut();
    out.clear();

    match block {
        RawBlock::Unsigned8(bytes) => {
            out.extend_from_slice(bytes);
        }
        RawBlock::Signed16(samples) => {
            match format {
                SampleFormat::Iq16 => {
                    out.extend_from_slice(bytemuck::cast_slice(samples));
                }
                SampleFormat::Iq8 => {
                    out.reserve(samples.len());
                    out.extend(samples.iter().map(|&sample| pack_component_8(sample)));
                }
                SampleFormat::Iq4 => {
                    out.reserve(samples.len() / 2);
                    out.extend(
                        samples
                            .chunks_exact(2)
                            .map(|pair| pack_pair_4(pair[0], pair[1])),
                    );
                }
            }
        }
    }
}

/// Restore the unsigned 12-bit representation, then cut the four low-order
/// bits.
#[inline]
fn pack_component_8(sample: i16) -> u8 {
    let unsigned_12bit = (i32::from(sample) >> 4) + 2048;
    (unsigned_12bit >> 4) as u8
}

/// One byte per IQ pair: Q's high nibble up top, I's high nibble below.
#[inline]
fn pack_pair_4(i: i16, q: i16) -> u8 {
    let i_byte = (i32::from(i) / 64 + 127) as u8;
    let q_byte = (i32::from(q) / 64 + 127) as u8;
    (q_byte & 0xF0) | ((i_byte >> 4) & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::{
        pack_component_8,
        pack_into,
        pack_pair_4,
    };
    use crate::{
        SampleFormat,
        device::RawBlock,
        queue::SampleBuffer,
    };

    fn packed(block: RawBlock<'_>, format: SampleFormat) -> Vec<u8> {
        let mut buffer = SampleBuffer::default();
        pack_into(&mut buffer, block, format);
        buffer.as_bytes().to_vec()
    }

    #[test]
    fn unsigned_blocks_pass_through_unchanged() {
        let raw = [0x00, 0x7f, 0x80, 0xff];
        for format in [SampleFormat::Iq16, SampleFormat::Iq8, SampleFormat::Iq4] {
            assert_eq!(packed(RawBlock::Unsigned8(&raw), format), raw);
        }
    }

    #[test]
    fn iq16_is_a_byte_for_byte_copy() {
        let samples: [i16; 4] = [0x0010, -0x0010, i16::MAX, i16::MIN];
        let bytes = packed(RawBlock::Signed16(&samples), SampleFormat::Iq16);
        assert_eq!(bytes, bytemuck::cast_slice::<i16, u8>(&samples));
    }

    #[test]
    fn iq8_recovers_the_unsigned_12_bit_midpoint() {
        // 0 maps to the middle of the unsigned range
        assert_eq!(pack_component_8(0x0000), 0x80);
        assert_eq!(pack_component_8(0x0010), 0x80);
        assert_eq!(pack_component_8(0x7FF0), 0xFF);
        assert_eq!(pack_component_8(i16::MAX), 0xFF);
        assert_eq!(pack_component_8(i16::MIN), 0x00);
        assert_eq!(pack_component_8(-0x0010), 0x7F);
    }

    #[test]
    fn iq8_packs_one_byte_per_component() {
        let samples: [i16; 4] = [0x0000, 0x7FF0, i16::MIN, -0x0010];
        let bytes = packed(RawBlock::Signed16(&samples), SampleFormat::Iq8);
        assert_eq!(bytes, [0x80, 0xFF, 0x00, 0x7F]);
    }

    #[test]
    fn iq4_packs_nibbles_q_high_i_low() {
        // I = 64 -> byte 0x80 -> high nibble 0x8 in the low slot
        // Q = -64 -> byte 0x7E -> high nibble 0x70 in the high slot
        assert_eq!(pack_pair_4(64, -64), 0x78);
        assert_eq!(pack_pair_4(0, 0), 0x77);
    }

    #[test]
    fn iq4_packs_one_byte_per_pair() {
        let samples: [i16; 4] = [64, -64, 0, 0];
        let bytes = packed(RawBlock::Signed16(&samples), SampleFormat::Iq4);
        assert_eq!(bytes, [0x78, 0x77]);
    }
}
