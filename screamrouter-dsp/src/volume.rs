//! Volume control with optional RMS-based loudness normalization, smoothed to avoid
//! zipper noise/clicks on changes. Operates on `i32`-scaled samples (full `i32` range
//! represents the `[-1.0, 1.0]` analog range) and soft-clips the result.

use crate::softclip::soft_clip;

/// Per-stream volume/normalization state, carried across chunks so the smoothing
/// filters settle continuously instead of resetting at chunk boundaries.
pub struct VolumeAdjuster {
    target_volume: f32,
    current_volume: f32,
    smoothing_factor: f32,
    normalization_enabled: bool,
    target_rms: f32,
    attack_smoothing: f32,
    decay_smoothing: f32,
    current_gain: f32,
}

impl VolumeAdjuster {
    pub fn new(initial_volume: f32, smoothing_factor: f32) -> Self {
        Self {
            target_volume: initial_volume,
            current_volume: initial_volume,
            smoothing_factor,
            normalization_enabled: false,
            target_rms: 0.1,
            attack_smoothing: 0.5,
            decay_smoothing: 0.05,
            current_gain: 1.0,
        }
    }

    pub fn set_target_volume(&mut self, volume: f32) {
        self.target_volume = volume;
    }

    pub fn set_normalization_enabled(&mut self, enabled: bool) {
        self.normalization_enabled = enabled;
    }

    pub fn set_normalization_tuning(&mut self, target_rms: f32, attack_smoothing: f32, decay_smoothing: f32) {
        self.target_rms = target_rms;
        self.attack_smoothing = attack_smoothing;
        self.decay_smoothing = decay_smoothing;
    }

    /// Apply volume (and, if enabled, normalization) in place to `i32`-scaled samples.
    pub fn process(&mut self, samples: &mut [i32]) {
        if self.normalization_enabled {
            let sum_of_squares: f64 = samples
                .iter()
                .map(|&s| {
                    let f = s as f64 / i32::MAX as f64;
                    f * f
                })
                .sum();
            let rms = if samples.is_empty() {
                0.0
            } else {
                (sum_of_squares / samples.len() as f64).sqrt()
            };
            let gain = if rms > 0.0 {
                self.target_rms as f64 / rms
            } else {
                1.0
            };

            for sample in samples.iter_mut() {
                let smoothing = if gain as f32 > self.current_gain {
                    self.attack_smoothing
                } else {
                    self.decay_smoothing
                };
                self.current_gain = self.current_gain * (1.0 - smoothing) + gain as f32 * smoothing;
                self.current_volume += (self.target_volume - self.current_volume) * self.smoothing_factor;

                let mut f = *sample as f32 / i32::MAX as f32;
                f *= self.current_volume * self.current_gain;
                f = soft_clip(f);
                *sample = (f * i32::MAX as f32) as i32;
            }
        } else {
            for sample in samples.iter_mut() {
                self.current_volume += (self.target_volume - self.current_volume) * self.smoothing_factor;
                let mut f = *sample as f32 / i32::MAX as f32;
                f *= self.current_volume;
                f = soft_clip(f);
                *sample = (f * i32::MAX as f32) as i32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_toward_target_volume() {
        let mut vol = VolumeAdjuster::new(0.0, 0.2);
        vol.set_target_volume(1.0);
        let mut samples = vec![i32::MAX / 2; 500];
        vol.process(&mut samples);
        assert!(vol.current_volume > 0.5, "current_volume={}", vol.current_volume);
    }

    #[test]
    fn zero_volume_silences_output() {
        let mut vol = VolumeAdjuster::new(0.0, 1.0);
        let mut samples = vec![i32::MAX / 2; 64];
        vol.process(&mut samples);
        assert!(samples.iter().all(|&s| s == 0));
    }
}
