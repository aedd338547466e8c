//! WAV decoding, `SPEC_FULL.md` §4.11.
//!
//! Grounded on the `hound::WavReader` usage in
//! `examples/eisenzopf-rvoip/crates/sip-client/tests/full_roundtrip.rs`'s
//! `load_wav` (open, read `spec()`, iterate typed samples), generalized from
//! that test's mono/16-bit-only check to the full PCM mono/stereo 8/16-bit
//! matrix `SPEC_FULL.md` calls for, plus the downmix and linear resample to
//! 8kHz the player needs before it can hand samples to the μ-law encoder.

use std::path::Path;

use crate::error::{Error, Result};

const TARGET_RATE: u32 = 8000;

/// Decoded, downmixed, resampled linear PCM ready for μ-law encoding: mono,
/// 16-bit, 8kHz.
pub struct Pcm8k {
    pub samples: Vec<i16>,
}

/// Reads a WAV file and returns mono 16-bit PCM at 8kHz, widening 8-bit
/// samples into the 16-bit domain and downmixing stereo to mono by taking
/// the left channel before resampling, exactly in that order.
pub fn load_as_pcm8k(path: impl AsRef<Path>) -> Result<Pcm8k> {
    let mut reader = hound::WavReader::open(path.as_ref())?;
    let spec = reader.spec();

    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(Error::ParseError(format!("{}: zero audio channels", path.as_ref().display())));
    }

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            reader.samples::<i16>().collect::<std::result::Result<Vec<i16>, _>>()?
        }
        (hound::SampleFormat::Int, 8) => {
            // WAV 8-bit PCM is stored unsigned; hound hands it back as `i8`
            // by reinterpreting the raw byte, so recover the original
            // unsigned byte before widening `(byte - 128) << 8` into the
            // signed 16-bit domain.
            reader
                .samples::<i8>()
                .map(|s| s.map(|v| (((v as u8) as i16 - 128) << 8)))
                .collect::<std::result::Result<Vec<i16>, _>>()?
        }
        (format, bits) => {
            return Err(Error::ParseError(format!(
                "{}: unsupported WAV format {format:?}/{bits}-bit",
                path.as_ref().display()
            )));
        }
    };

    let mono = downmix_to_mono(&interleaved, channels);
    let resampled = resample_linear(&mono, spec.sample_rate, TARGET_RATE);
    Ok(Pcm8k { samples: resampled })
}

/// Downmixes interleaved multi-channel PCM to mono by selecting the left
/// (first) channel of each frame, per `SPEC_FULL.md` §4.11.
fn downmix_to_mono(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved.chunks(channels).filter(|frame| frame.len() == channels).map(|frame| frame[0]).collect()
}

/// Linear resampling from `from_rate` to `to_rate`. Identity when the rates
/// already match.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;

    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;

        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        let interpolated = a + (b - a) * frac;
        out.push(interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_mono_is_identity() {
        let samples = vec![1, 2, 3, 4];
        assert_eq!(downmix_to_mono(&samples, 1), samples);
    }

    #[test]
    fn downmix_stereo_keeps_left_channel() {
        let interleaved = vec![10, -10, 20, -20, 30, -30];
        assert_eq!(downmix_to_mono(&interleaved, 2), vec![10, 20, 30]);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = vec![1i16, 2, 3, 4, 5];
        assert_eq!(resample_linear(&samples, 8000, 8000), samples);
    }

    #[test]
    fn resample_halves_length_at_half_rate() {
        let samples: Vec<i16> = (0..16000).map(|i| (i % 100) as i16).collect();
        let out = resample_linear(&samples, 16000, 8000);
        assert_eq!(out.len(), 8000);
    }

    #[test]
    fn resample_upsamples_without_panicking() {
        let samples = vec![0i16, 1000, -1000, 500];
        let out = resample_linear(&samples, 4000, 8000);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn resample_empty_is_empty() {
        assert!(resample_linear(&[], 8000, 16000).is_empty());
    }
}
