//! Configuration knobs the dataplane consumes. All structs are plain `serde`
//! data with `Default` impls matching the documented defaults; the core never
//! reads a config file itself, a host process loads these from wherever it keeps
//! its configuration and hands them in.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorTuning {
    pub oversampling_factor: u32,
    pub volume_smoothing_factor: f32,
    pub normalization_target_rms: f32,
    pub normalization_attack_smoothing: f32,
    pub normalization_decay_smoothing: f32,
    pub dc_filter_cutoff_hz: f32,
    pub dither_noise_shaping_factor: f32,
}

impl Default for ProcessorTuning {
    fn default() -> Self {
        Self {
            oversampling_factor: 2,
            volume_smoothing_factor: 0.01,
            normalization_target_rms: 0.1,
            normalization_attack_smoothing: 0.5,
            normalization_decay_smoothing: 0.05,
            dc_filter_cutoff_hz: 20.0,
            dither_noise_shaping_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerTuning {
    pub underrun_hold_timeout_ms: u64,
    pub mp3_output_queue_max_size: usize,
    pub mp3_bitrate_kbps: u32,
    pub mp3_vbr_enabled: bool,
    pub enable_adaptive_buffer_drain: bool,
    pub target_buffer_level_ms: f32,
    pub buffer_tolerance_ms: f32,
    pub drain_rate_ms_per_sec: f32,
    pub max_speedup_factor: f32,
    pub drain_smoothing_factor: f32,
    pub buffer_measurement_interval_ms: u64,
}

impl Default for MixerTuning {
    fn default() -> Self {
        Self {
            underrun_hold_timeout_ms: 30,
            mp3_output_queue_max_size: 64,
            mp3_bitrate_kbps: 192,
            mp3_vbr_enabled: false,
            enable_adaptive_buffer_drain: true,
            target_buffer_level_ms: 40.0,
            buffer_tolerance_ms: 10.0,
            drain_rate_ms_per_sec: 500.0,
            max_speedup_factor: 1.02,
            drain_smoothing_factor: 0.1,
            buffer_measurement_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerTuning {
    pub enabled: bool,
    pub log_interval_ms: u64,
}

impl Default for ProfilerTuning {
    fn default() -> Self {
        Self {
            enabled: false,
            log_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryTuning {
    pub enabled: bool,
    pub log_interval_ms: u64,
}

impl Default for TelemetryTuning {
    fn default() -> Self {
        Self {
            enabled: false,
            log_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    pub proportional_gain: f64,
    pub max_rate_adjustment: f64,
    pub barrier_timeout_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            proportional_gain: 0.01,
            max_rate_adjustment: 0.5,
            barrier_timeout_ms: 50,
        }
    }
}

/// Timeshift / jitter-buffer depth, shared process-wide by the Time-Shift Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeshiftTuning {
    pub timeshift_buffer_seconds: f32,
}

impl Default for TimeshiftTuning {
    fn default() -> Self {
        Self {
            timeshift_buffer_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEngineConfig {
    pub processor_tuning: ProcessorTuning,
    pub mixer_tuning: MixerTuning,
    pub profiler: ProfilerTuning,
    pub telemetry: TelemetryTuning,
    pub sync_tuning: SyncTuning,
    pub timeshift: TimeshiftTuning,
}

/// A single input-channel-count's speaker mix configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerLayout {
    pub auto_mode: bool,
    /// `matrix[input_channel][output_channel]`, only meaningful when `auto_mode` is false.
    pub matrix: Vec<Vec<f32>>,
}

impl SpeakerLayout {
    pub fn auto() -> Self {
        Self {
            auto_mode: true,
            matrix: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let sync = SyncTuning::default();
        assert_eq!(sync.proportional_gain, 0.01);
        assert_eq!(sync.max_rate_adjustment, 0.5);
        assert_eq!(sync.barrier_timeout_ms, 50);

        let proc = ProcessorTuning::default();
        assert_eq!(proc.oversampling_factor, 2);
        assert_eq!(proc.dc_filter_cutoff_hz, 20.0);

        let mixer = MixerTuning::default();
        assert_eq!(mixer.target_buffer_level_ms, 40.0);
        assert_eq!(mixer.max_speedup_factor, 1.02);
    }
}
