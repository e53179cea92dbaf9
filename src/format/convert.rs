//! Sample conversion and volume scaling.
//!
//! Everything here runs on real-time threads: no allocation, no locks, and
//! bounded work proportional to the slice lengths.

use super::SampleFormat;

const U8_BIAS: f32 = 128.0;

/// Byte value that encodes silence for a representation.
#[inline]
pub fn silence_byte(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::UInt8 => 0x80,
        _ => 0,
    }
}

pub fn fill_silence(format: SampleFormat, dst: &mut [u8]) {
    dst.fill(silence_byte(format));
}

/// Decodes raw native-endian samples into `out`.
///
/// Returns the number of samples written, bounded by both slices.
pub fn decode_samples(format: SampleFormat, bytes: &[u8], out: &mut [f32]) -> usize {
    let width = format.bytes_per_sample();
    if width == 0 {
        return 0;
    }

    let count = (bytes.len() / width).min(out.len());
    let chunks = bytes.chunks_exact(width).take(count);
    for (dst, raw) in out.iter_mut().zip(chunks) {
        *dst = match format {
            SampleFormat::UInt8 => (raw[0] as f32 - U8_BIAS) / U8_BIAS,
            SampleFormat::Int16 => i16::from_ne_bytes([raw[0], raw[1]]) as f32 / 32768.0,
            SampleFormat::Int32 => {
                i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32 / 2_147_483_648.0
            }
            SampleFormat::Float => f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            SampleFormat::Unknown => 0.0,
        };
    }
    count
}

/// Encodes `input` into raw native-endian samples.
///
/// Integer targets clamp to their range. Returns the number of samples
/// written.
pub fn encode_samples(format: SampleFormat, input: &[f32], out: &mut [u8]) -> usize {
    let width = format.bytes_per_sample();
    if width == 0 {
        return 0;
    }

    let count = (out.len() / width).min(input.len());
    let chunks = out.chunks_exact_mut(width).take(count);
    for (raw, &sample) in chunks.zip(input) {
        match format {
            SampleFormat::UInt8 => {
                raw[0] = (sample * 127.0 + U8_BIAS).round().clamp(0.0, 255.0) as u8;
            }
            SampleFormat::Int16 => {
                let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                raw.copy_from_slice(&value.to_ne_bytes());
            }
            SampleFormat::Int32 => {
                let value = (sample as f64 * 2_147_483_647.0)
                    .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                raw.copy_from_slice(&value.to_ne_bytes());
            }
            SampleFormat::Float => raw.copy_from_slice(&sample.to_ne_bytes()),
            SampleFormat::Unknown => {}
        }
    }
    count
}

/// Copies `src` into `dst` scaled by `volume`.
///
/// A volume of exactly one copies and zero writes silence. Integer formats
/// clamp the factor into `[0, 1]`. Unsigned samples are scaled around their
/// 0x80 bias. Only the common prefix of the two slices is touched.
pub fn apply_volume(volume: f32, format: SampleFormat, src: &[u8], dst: &mut [u8]) {
    let len = src.len().min(dst.len());
    let (src, dst) = (&src[..len], &mut dst[..len]);

    if volume == 1.0 {
        dst.copy_from_slice(src);
        return;
    }
    if volume == 0.0 {
        fill_silence(format, dst);
        return;
    }

    let factor = volume.clamp(0.0, 1.0);
    match format {
        SampleFormat::UInt8 => {
            for (d, &s) in dst.iter_mut().zip(src) {
                let centered = s as i16 - 0x80;
                *d = (0x80 + (centered as f32 * factor) as i16) as u8;
            }
        }
        SampleFormat::Int16 => {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                let value = i16::from_ne_bytes([s[0], s[1]]);
                d.copy_from_slice(&((value as f32 * factor) as i16).to_ne_bytes());
            }
        }
        SampleFormat::Int32 => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let value = i32::from_ne_bytes([s[0], s[1], s[2], s[3]]);
                d.copy_from_slice(&((value as f64 * factor as f64) as i32).to_ne_bytes());
            }
        }
        SampleFormat::Float => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let value = f32::from_ne_bytes([s[0], s[1], s[2], s[3]]);
                d.copy_from_slice(&(value * volume).to_ne_bytes());
            }
        }
        SampleFormat::Unknown => dst.copy_from_slice(src),
    }
}

/// Scales interleaved float samples in place.
#[inline]
pub fn scale_in_place(volume: f32, samples: &mut [f32]) {
    if volume == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample *= volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint8_volume_zero_is_biased_silence() {
        let src = [0x00u8, 0x40, 0xFF];
        let mut dst = [0u8; 3];
        apply_volume(0.0, SampleFormat::UInt8, &src, &mut dst);
        assert_eq!(dst, [0x80, 0x80, 0x80]);
    }

    #[test]
    fn test_uint8_volume_scales_around_bias() {
        let src = [0x00u8, 0x80, 0xC0];
        let mut dst = [0u8; 3];
        apply_volume(0.5, SampleFormat::UInt8, &src, &mut dst);
        assert_eq!(dst, [0x40, 0x80, 0xA0]);
    }

    #[test]
    fn test_int16_volume_halves() {
        let mut src = Vec::new();
        for v in [1000i16, -2000] {
            src.extend_from_slice(&v.to_ne_bytes());
        }
        let mut dst = vec![0u8; src.len()];
        apply_volume(0.5, SampleFormat::Int16, &src, &mut dst);
        assert_eq!(i16::from_ne_bytes([dst[0], dst[1]]), 500);
        assert_eq!(i16::from_ne_bytes([dst[2], dst[3]]), -1000);
    }

    #[test]
    fn test_integer_volume_is_clamped_but_float_is_not() {
        let src = 1000i16.to_ne_bytes();
        let mut dst = [0u8; 2];
        apply_volume(2.0, SampleFormat::Int16, &src, &mut dst);
        assert_eq!(i16::from_ne_bytes(dst), 1000);

        let src = 0.25f32.to_ne_bytes();
        let mut dst = [0u8; 4];
        apply_volume(2.0, SampleFormat::Float, &src, &mut dst);
        assert_eq!(f32::from_ne_bytes(dst), 0.5);
    }

    #[test]
    fn test_decode_int16() {
        let mut bytes = Vec::new();
        for v in [0i16, 16384, -32768] {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        let mut out = [1.0f32; 3];
        assert_eq!(decode_samples(SampleFormat::Int16, &bytes, &mut out), 3);
        assert_eq!(out, [0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_encode_clamps() {
        let mut out = [0u8; 4];
        encode_samples(SampleFormat::Int16, &[2.0, -2.0], &mut out);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), 32767);
        assert_eq!(i16::from_ne_bytes([out[2], out[3]]), -32768);

        let mut out = [0u8; 2];
        encode_samples(SampleFormat::UInt8, &[0.0, -1.0], &mut out);
        assert_eq!(out, [0x80, 0x01]);
    }

    #[test]
    fn test_conversion_is_bounded_by_shorter_slice() {
        let bytes = [0u8; 8];
        let mut out = [9.0f32; 2];
        assert_eq!(decode_samples(SampleFormat::Int16, &bytes, &mut out), 2);
        assert_eq!(decode_samples(SampleFormat::Unknown, &bytes, &mut out), 0);
    }
}
