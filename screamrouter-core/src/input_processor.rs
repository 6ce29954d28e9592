//! Input Processor (IP): the per-`(source_tag, sink_id)` binding DSP pipeline.
//! Scale -> volume/soft-clip -> upsample -> de-interleave -> speaker mix ->
//! equalize -> (optional) DC removal -> re-interleave -> downsample ->
//! (optional) dither.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use screamrouter_dsp::biquad::{Biquad, FilterType};
use screamrouter_dsp::dither::Ditherer;
use screamrouter_dsp::resample::RateConverter;
use screamrouter_dsp::softclip::soft_clip;
use screamrouter_dsp::speaker_mix::{auto_speaker_mix, MixMatrix};
use screamrouter_dsp::volume::VolumeAdjuster;
use screamrouter_dsp::{EQ_BAND_FREQUENCIES_HZ, EQ_BANDS, MAX_CHANNELS};

use crate::config::{ProcessorTuning, SpeakerLayout};
use crate::packet::{ProcessedAudioChunk, TaggedAudioPacket};

/// Control-plane commands an IP consumes asynchronously, off the audio hot path.
#[derive(Debug, Clone)]
pub enum IpCommand {
    SetVolume(f32),
    SetEqualizer([f32; EQ_BANDS]),
    SetVolumeNormalization(bool),
    SetEqNormalization(bool),
    UpdateSpeakerLayouts(std::collections::HashMap<usize, SpeakerLayout>),
    SetDelayMs(u64),
    SetTimeshiftSec(f64),
    SetPlaybackRateScale(f64),
}

struct ChannelFilterBank {
    eq: Vec<[Biquad; EQ_BANDS]>,
    dc: Vec<Biquad>,
}

/// Format parameters an IP is currently built for. When a packet arrives with a
/// different tuple, the IP rebuilds its filters/resamplers/mix matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Format {
    input_channels: u16,
    output_channels: u16,
    input_bit_depth: u16,
    input_sample_rate: u32,
}

pub struct InputProcessor {
    format: Format,
    output_sample_rate: u32,
    tuning: ProcessorTuning,

    volume: VolumeAdjuster,
    eq_gains_db: [f32; EQ_BANDS],
    eq_normalization_enabled: bool,
    speaker_layouts: std::collections::HashMap<usize, SpeakerLayout>,
    active_mix: MixMatrix,

    filters: ChannelFilterBank,
    dc_filter_enabled: bool,

    upsampler: Option<RateConverter>,
    downsampler: Option<RateConverter>,
    playback_rate_scale: Arc<AtomicU64>, // f64 bits, relaxed atomics

    dither: Option<Ditherer>,

    needs_processing: bool,
    needs_processing_set: bool,
}

const OVERSAMPLE_CHUNK_FRAMES: usize = 1152;

fn rate_scale_to_bits(rate: f64) -> u64 {
    rate.to_bits()
}

fn bits_to_rate_scale(bits: u64) -> f64 {
    f64::from_bits(bits)
}

impl InputProcessor {
    pub fn new(
        input_channels: u16,
        output_channels: u16,
        input_bit_depth: u16,
        input_sample_rate: u32,
        output_sample_rate: u32,
        initial_volume: f32,
        tuning: ProcessorTuning,
    ) -> Self {
        let format = Format {
            input_channels,
            output_channels,
            input_bit_depth,
            input_sample_rate,
        };

        let mut volume = VolumeAdjuster::new(initial_volume, tuning.volume_smoothing_factor);
        volume.set_normalization_tuning(
            tuning.normalization_target_rms,
            tuning.normalization_attack_smoothing,
            tuning.normalization_decay_smoothing,
        );

        let mut ip = Self {
            format,
            output_sample_rate,
            tuning,
            volume,
            eq_gains_db: [0.0; EQ_BANDS],
            eq_normalization_enabled: false,
            speaker_layouts: std::collections::HashMap::new(),
            active_mix: [[0.0; MAX_CHANNELS]; MAX_CHANNELS],
            filters: ChannelFilterBank {
                eq: Vec::new(),
                dc: Vec::new(),
            },
            dc_filter_enabled: false,
            upsampler: None,
            downsampler: None,
            playback_rate_scale: Arc::new(AtomicU64::new(rate_scale_to_bits(1.0))),
            dither: None,
            needs_processing: true,
            needs_processing_set: false,
        };
        ip.rebuild_for_format();
        ip
    }

    fn oversampled_rate(&self) -> f64 {
        self.output_sample_rate as f64 * self.tuning.oversampling_factor as f64
    }

    fn playback_rate(&self) -> f64 {
        bits_to_rate_scale(self.playback_rate_scale.load(Ordering::Relaxed))
    }

    fn rebuild_for_format(&mut self) {
        let out_ch = self.format.output_channels as usize;
        let in_ch = self.format.input_channels as usize;

        self.filters.eq = (0..out_ch)
            .map(|_| std::array::from_fn(|band| self.build_eq_biquad(band)))
            .collect();
        self.filters.dc = (0..out_ch)
            .map(|_| self.build_dc_biquad())
            .collect();

        self.active_mix = self
            .speaker_layouts
            .get(&in_ch)
            .filter(|l| !l.auto_mode)
            .map(|l| custom_matrix_to_fixed(&l.matrix))
            .unwrap_or_else(|| auto_speaker_mix(in_ch, out_ch));

        self.upsampler = RateConverter::new(in_ch, OVERSAMPLE_CHUNK_FRAMES).ok();
        self.downsampler = RateConverter::new(out_ch, OVERSAMPLE_CHUNK_FRAMES).ok();

        self.needs_processing_set = false;
    }

    fn build_eq_biquad(&self, band: usize) -> Biquad {
        let freq = EQ_BAND_FREQUENCIES_HZ[band];
        Biquad::from_hz(FilterType::Peak, freq, self.oversampled_rate(), 1.0, 0.0)
    }

    fn build_dc_biquad(&self) -> Biquad {
        let nyquist_safe = (self.tuning.dc_filter_cutoff_hz as f64 / self.oversampled_rate()).min(0.499);
        Biquad::from_hz(FilterType::HighPass, nyquist_safe * self.oversampled_rate(), self.oversampled_rate(), 0.707, 0.0)
    }

    /// Whether the full DSP chain can be skipped this chunk: format is already
    /// identity end-to-end and the mix matrix is a plain pass-through. Cached and
    /// invalidated only on format/layout changes — toggling volume or EQ
    /// normalization does not recompute it, matching the pre-existing behavior
    /// this was ported from.
    fn needs_processing(&mut self) -> bool {
        if !self.needs_processing_set {
            let identity_format = self.format.input_sample_rate == self.output_sample_rate
                && self.format.input_channels == self.format.output_channels;
            let identity_mix = identity_format && is_identity_matrix(&self.active_mix, self.format.input_channels as usize);
            self.needs_processing = !identity_mix;
            self.needs_processing_set = true;
        }
        self.needs_processing
    }

    pub fn apply_command(&mut self, cmd: IpCommand) {
        match cmd {
            IpCommand::SetVolume(v) => self.volume.set_target_volume(v),
            IpCommand::SetEqualizer(gains) => {
                self.eq_gains_db = gains;
                self.apply_eq_gains();
            }
            IpCommand::SetVolumeNormalization(enabled) => self.volume.set_normalization_enabled(enabled),
            IpCommand::SetEqNormalization(enabled) => {
                self.eq_normalization_enabled = enabled;
                self.apply_eq_gains();
            }
            IpCommand::UpdateSpeakerLayouts(layouts) => {
                self.speaker_layouts = layouts;
                self.active_mix = self
                    .speaker_layouts
                    .get(&(self.format.input_channels as usize))
                    .filter(|l| !l.auto_mode)
                    .map(|l| custom_matrix_to_fixed(&l.matrix))
                    .unwrap_or_else(|| {
                        auto_speaker_mix(self.format.input_channels as usize, self.format.output_channels as usize)
                    });
                self.needs_processing_set = false;
            }
            IpCommand::SetDelayMs(_) | IpCommand::SetTimeshiftSec(_) => {
                // Forwarded to the owning TSM cursor by the Audio Manager; the IP
                // itself has no delay/timeshift state.
            }
            IpCommand::SetPlaybackRateScale(scale) => {
                self.playback_rate_scale.store(rate_scale_to_bits(scale), Ordering::Relaxed);
            }
        }
    }

    fn apply_eq_gains(&mut self) {
        let max_gain = self
            .eq_gains_db
            .iter()
            .cloned()
            .fold(1.0f32, f32::max);
        for channel_bank in self.filters.eq.iter_mut() {
            for (band, biquad) in channel_bank.iter_mut().enumerate() {
                let mut gain = self.eq_gains_db[band];
                if self.eq_normalization_enabled && max_gain > 0.0 {
                    gain /= max_gain;
                }
                let gain_db = 20.0 * gain.max(1e-6).log10();
                biquad.set_peak_gain(gain_db as f64);
            }
        }
    }

    /// Process one input packet into one (or zero, on format failure) processed
    /// chunk at the sink's target format.
    pub fn process(&mut self, packet: &TaggedAudioPacket) -> ProcessedAudioChunk {
        let incoming = Format {
            input_channels: packet.channels,
            output_channels: self.format.output_channels,
            input_bit_depth: packet.bit_depth,
            input_sample_rate: packet.sample_rate,
        };
        if incoming != self.format {
            self.format = incoming;
            self.rebuild_for_format();
        }

        if !matches!(packet.bit_depth, 16 | 24 | 32) {
            return ProcessedAudioChunk::silence(self.format.output_channels, self.output_sample_rate, OVERSAMPLE_CHUNK_FRAMES);
        }

        let mut scaled = scale_to_i32(&packet.audio_data, packet.bit_depth);
        self.volume.process(&mut scaled);

        if !self.needs_processing() {
            if let Some(ditherer) = &mut self.dither {
                ditherer.process_buffer(&mut scaled);
            }
            return ProcessedAudioChunk {
                samples: scaled,
                channels: self.format.output_channels,
                sample_rate: self.output_sample_rate,
                ssrcs: packet.ssrcs.clone(),
                produced_time: std::time::Instant::now(),
                rtp_timestamp: packet.rtp_timestamp,
            };
        }

        let in_ch = self.format.input_channels as usize;
        let out_ch = self.format.output_channels as usize;

        let mut upsampled_i32 = scaled.clone();
        if let Some(up) = &mut self.upsampler {
            let float_in: Vec<f32> = scaled.iter().map(|&s| s as f32 / i32::MAX as f32).collect();
            let ratio = (self.oversampled_rate() * self.playback_rate()) / self.format.input_sample_rate as f64;
            let mut float_out = Vec::new();
            if up.process(&float_in, ratio, &mut float_out).is_ok() {
                upsampled_i32 = float_out.iter().map(|&f| (f * i32::MAX as f32) as i32).collect();
            }
        }

        let frames = if in_ch > 0 { upsampled_i32.len() / in_ch } else { 0 };
        let mut planar_in = vec![vec![0i32; frames]; in_ch];
        for (frame_idx, frame) in upsampled_i32.chunks_exact(in_ch).enumerate() {
            for (ch, &s) in frame.iter().enumerate() {
                planar_in[ch][frame_idx] = s;
            }
        }

        let mut planar_out = vec![vec![0i64; frames]; out_ch];
        for ic in 0..in_ch {
            for oc in 0..out_ch {
                let gain = self.active_mix[ic][oc];
                if gain == 0.0 {
                    continue;
                }
                for f in 0..frames {
                    planar_out[oc][f] += (planar_in[ic][f] as f64 * gain as f64) as i64;
                }
            }
        }
        let mut planar_out: Vec<Vec<i32>> = planar_out
            .into_iter()
            .map(|ch| {
                ch.into_iter()
                    .map(|s| {
                        let f = s as f32 / i32::MAX as f32;
                        (soft_clip(f) * i32::MAX as f32) as i32
                    })
                    .collect()
            })
            .collect();

        for (ch_idx, channel) in planar_out.iter_mut().enumerate() {
            if let Some(bank) = self.filters.eq.get_mut(ch_idx) {
                let active = self.eq_gains_db.iter().any(|&g| g != 0.0);
                if active {
                    for biquad in bank.iter_mut() {
                        for sample in channel.iter_mut() {
                            let f = *sample as f32 / i32::MAX as f32;
                            let y = biquad.process(f);
                            *sample = (y * i32::MAX as f32) as i32;
                        }
                    }
                }
            }
            if self.dc_filter_enabled {
                if let Some(dc) = self.filters.dc.get_mut(ch_idx) {
                    for sample in channel.iter_mut() {
                        let f = *sample as f32 / i32::MAX as f32;
                        let y = dc.process(f);
                        *sample = (y * i32::MAX as f32) as i32;
                    }
                }
            }
        }

        let mut merged = vec![0i32; frames * out_ch];
        for (ch, channel) in planar_out.iter().enumerate() {
            for (f, &s) in channel.iter().enumerate() {
                merged[f * out_ch + ch] = s;
            }
        }

        let mut downsampled = merged.clone();
        if let Some(down) = &mut self.downsampler {
            let float_in: Vec<f32> = merged.iter().map(|&s| s as f32 / i32::MAX as f32).collect();
            let ratio = self.output_sample_rate as f64 / (self.oversampled_rate() * self.playback_rate());
            let mut float_out = Vec::new();
            if down.process(&float_in, ratio, &mut float_out).is_ok() {
                downsampled = float_out.iter().map(|&f| (f * i32::MAX as f32) as i32).collect();
            }
        }

        if let Some(ditherer) = &mut self.dither {
            ditherer.process_buffer(&mut downsampled);
        }

        ProcessedAudioChunk {
            samples: downsampled,
            channels: self.format.output_channels,
            sample_rate: self.output_sample_rate,
            ssrcs: packet.ssrcs.clone(),
            produced_time: std::time::Instant::now(),
            rtp_timestamp: packet.rtp_timestamp,
        }
    }

    pub fn flush_filters(&mut self) {
        for bank in self.filters.eq.iter_mut() {
            for biquad in bank.iter_mut() {
                biquad.flush();
            }
        }
        for dc in self.filters.dc.iter_mut() {
            dc.flush();
        }
    }
}

fn is_identity_matrix(mix: &MixMatrix, channels: usize) -> bool {
    for i in 0..channels {
        for j in 0..channels {
            let expected = if i == j { 1.0 } else { 0.0 };
            if (mix[i][j] - expected).abs() > 1e-6 {
                return false;
            }
        }
    }
    true
}

fn custom_matrix_to_fixed(matrix: &[Vec<f32>]) -> MixMatrix {
    let mut fixed = [[0.0f32; MAX_CHANNELS]; MAX_CHANNELS];
    for (i, row) in matrix.iter().enumerate().take(MAX_CHANNELS) {
        for (j, &gain) in row.iter().enumerate().take(MAX_CHANNELS) {
            fixed[i][j] = gain;
        }
    }
    fixed
}

/// Scale raw little-endian PCM bytes to left-justified `i32` samples.
fn scale_to_i32(data: &[u8], bit_depth: u16) -> Vec<i32> {
    match bit_depth {
        16 => data
            .chunks_exact(2)
            .map(|b| (i16::from_le_bytes([b[0], b[1]]) as i32) << 16)
            .collect(),
        24 => data
            .chunks_exact(3)
            .map(|b| {
                let v = (b[0] as i32) | ((b[1] as i32) << 8) | ((b[2] as i32) << 16);
                let sign_extended = (v << 8) >> 8; // sign-extend 24-bit value
                sign_extended << 8
            })
            .collect(),
        32 => data
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_packet(channels: u16, bit_depth: u16, rate: u32, samples_i16: &[i16]) -> TaggedAudioPacket {
        let mut data = Vec::with_capacity(samples_i16.len() * 2);
        for &s in samples_i16 {
            data.extend_from_slice(&s.to_le_bytes());
        }
        TaggedAudioPacket {
            source_tag: "src".into(),
            sample_rate: rate,
            channels,
            bit_depth,
            chlayout1: 0,
            chlayout2: 0,
            audio_data: Bytes::from(data),
            rtp_timestamp: None,
            received_time: std::time::Instant::now(),
            playback_rate: 1.0,
            ssrcs: vec![42],
        }
    }

    #[test]
    fn scale_16_bit_left_justifies() {
        let scaled = scale_to_i32(&1i16.to_le_bytes(), 16);
        assert_eq!(scaled[0], 1 << 16);
    }

    #[test]
    fn invalid_bit_depth_produces_silence() {
        let mut ip = InputProcessor::new(2, 2, 16, 48000, 48000, 1.0, ProcessorTuning::default());
        let mut packet = make_packet(2, 16, 48000, &[100, 200]);
        packet.bit_depth = 20;
        let chunk = ip.process(&packet);
        assert!(chunk.samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn carries_ssrcs_forward() {
        let mut ip = InputProcessor::new(2, 2, 16, 48000, 48000, 1.0, ProcessorTuning::default());
        let packet = make_packet(2, 16, 48000, &[0; 64]);
        let chunk = ip.process(&packet);
        assert_eq!(chunk.ssrcs, vec![42]);
    }
}
