//! Oversampled up/down sample-rate conversion built on `rubato`'s sinc resampler.
//! The input processor upsamples to `output_rate * oversampling_factor` before EQ
//! and speaker mixing, then downsamples back to `output_rate` at the end of the
//! chain; both stages share this adapter with different channel counts and ratios.

use rubato::{Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::DspError;

/// Wraps a `rubato` sinc resampler behind the dynamic-ratio interface the dataplane
/// needs (the playback rate can change between chunks for sync correction).
pub struct RateConverter {
    inner: SincFixedIn<f32>,
    channels: usize,
}

impl RateConverter {
    /// `channels` is the resampler's own channel count: the upsampler runs at
    /// `input_channels`, the downsampler at `output_channels`.
    pub fn new(channels: usize, chunk_frames: usize) -> Result<Self, DspError> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::new(1.0, 4.0, params, chunk_frames, channels)
            .map_err(|e| DspError::Resample(e.to_string()))?;
        Ok(Self { inner, channels })
    }

    /// Resample `input` (interleaved) at the given ratio (`output_rate / input_rate`),
    /// writing de-interleaved-then-reinterleaved output frames into `output`.
    /// Returns the number of interleaved samples written.
    pub fn process(&mut self, input: &[f32], ratio: f64, output: &mut Vec<f32>) -> Result<usize, DspError> {
        if input.is_empty() {
            output.clear();
            return Ok(0);
        }
        self.inner
            .set_resample_ratio(ratio, true)
            .map_err(|e| DspError::Resample(e.to_string()))?;

        let frames_in = input.len() / self.channels;
        let mut deinterleaved: Vec<Vec<f32>> = vec![Vec::with_capacity(frames_in); self.channels];
        for frame in input.chunks_exact(self.channels) {
            for (ch, &s) in frame.iter().enumerate() {
                deinterleaved[ch].push(s);
            }
        }

        let result = self
            .inner
            .process(&deinterleaved, None)
            .map_err(|e| DspError::Resample(e.to_string()))?;

        let frames_out = result.first().map(|c| c.len()).unwrap_or(0);
        output.clear();
        output.resize(frames_out * self.channels, 0.0);
        for (ch, channel_data) in result.iter().enumerate() {
            for (i, &s) in channel_data.iter().enumerate() {
                output[i * self.channels + ch] = s;
            }
        }
        Ok(output.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_ratio_preserves_roughly_same_frame_count() {
        let mut rc = RateConverter::new(2, 256).expect("resampler constructs");
        let input: Vec<f32> = (0..512)
            .map(|i| (i as f32 * 0.05).sin())
            .collect();
        let mut out = Vec::new();
        rc.process(&input, 1.0, &mut out).expect("process succeeds");
        assert!(!out.is_empty());
    }
}
