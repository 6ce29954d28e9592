//! MP3 side-chain encoder wrapping `mp3lame-encoder`. Consumes interleaved
//! stereo i32 PCM from the mixer's downmixed side-chain feed.

use mp3lame_encoder::{Bitrate, Builder, DualPcm, FlushNoGap, Quality};

use screamrouter_core::sender::{EncodedMp3Frame, Mp3Encoder};

fn bitrate_from_kbps(kbps: u32) -> Bitrate {
    match kbps {
        0..=32 => Bitrate::Kbps32,
        33..=64 => Bitrate::Kbps64,
        65..=96 => Bitrate::Kbps96,
        97..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=224 => Bitrate::Kbps224,
        225..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}

pub struct LameMp3Encoder {
    encoder: mp3lame_encoder::Encoder,
    left: Vec<i16>,
    right: Vec<i16>,
}

impl LameMp3Encoder {
    pub fn new(sample_rate: u32, bitrate_kbps: u32) -> Result<Self, String> {
        let mut builder = Builder::new().ok_or("failed to allocate lame encoder")?;
        builder
            .set_num_channels(2)
            .map_err(|e| format!("set_num_channels: {e:?}"))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| format!("set_sample_rate: {e:?}"))?;
        builder
            .set_brate(bitrate_from_kbps(bitrate_kbps))
            .map_err(|e| format!("set_brate: {e:?}"))?;
        builder
            .set_quality(Quality::Best)
            .map_err(|e| format!("set_quality: {e:?}"))?;
        let encoder = builder.build().map_err(|e| format!("build: {e:?}"))?;
        Ok(Self {
            encoder,
            left: Vec::new(),
            right: Vec::new(),
        })
    }
}

impl Mp3Encoder for LameMp3Encoder {
    fn encode(&mut self, interleaved_stereo_pcm_i32: &[i32]) -> Vec<EncodedMp3Frame> {
        self.left.clear();
        self.right.clear();
        for pair in interleaved_stereo_pcm_i32.chunks_exact(2) {
            self.left.push(pair[0].clamp(i16::MIN as i32, i16::MAX as i32) as i16);
            self.right.push(pair[1].clamp(i16::MIN as i32, i16::MAX as i32) as i16);
        }
        if self.left.is_empty() {
            return Vec::new();
        }

        let input = DualPcm {
            left: &self.left,
            right: &self.right,
        };
        let mut out_buf = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(self.left.len()));
        match self.encoder.encode(input, out_buf.spare_capacity_mut()) {
            Ok(written) => {
                unsafe { out_buf.set_len(written) };
                vec![EncodedMp3Frame { data: out_buf }]
            }
            Err(e) => {
                tracing::debug!(error = ?e, "mp3 encode failed, dropping frame");
                Vec::new()
            }
        }
    }
}

impl Drop for LameMp3Encoder {
    fn drop(&mut self) {
        let mut out_buf = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(0));
        let _ = self
            .encoder
            .flush::<FlushNoGap>(out_buf.spare_capacity_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_mapping_rounds_to_nearest_tier() {
        assert!(matches!(bitrate_from_kbps(128), Bitrate::Kbps128));
        assert!(matches!(bitrate_from_kbps(320), Bitrate::Kbps320));
        assert!(matches!(bitrate_from_kbps(10), Bitrate::Kbps32));
    }

    #[test]
    fn empty_input_produces_no_frames() {
        if let Ok(mut enc) = LameMp3Encoder::new(48000, 192) {
            assert!(enc.encode(&[]).is_empty());
        }
    }
}
