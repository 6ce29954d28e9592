//! Wire-agnostic packet and chunk types passed between dataplane stages.

use std::time::Instant;

use bytes::Bytes;

/// Fully-decoded PCM packet as delivered by a receiver (out of scope here).
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    /// Stable identifier derived from the wire source (padded IP+program for Pulse,
    /// raw IP for RTP, etc).
    pub source_tag: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Opaque Scream channel-layout bytes, passed through unmodified.
    pub chlayout1: u8,
    pub chlayout2: u8,
    /// Raw little-endian interleaved PCM.
    pub audio_data: Bytes,
    /// Monotonic frame counter from the source, if the wire protocol carries one.
    pub rtp_timestamp: Option<u32>,
    pub received_time: Instant,
    pub playback_rate: f32,
    /// Originating SSRC followed by any CSRCs already accumulated upstream.
    pub ssrcs: Vec<u32>,
}

impl TaggedAudioPacket {
    pub fn bytes_per_frame(&self) -> usize {
        (self.bit_depth as usize / 8) * self.channels as usize
    }

    /// `false` if the packet's length isn't a whole number of frames for its format.
    pub fn is_well_formed(&self) -> bool {
        let bpf = self.bytes_per_frame();
        bpf > 0 && self.audio_data.len() % bpf == 0
    }
}

/// Fixed-size int32 interleaved samples at a sink's output rate/channel count,
/// produced by one Input Processor step.
#[derive(Debug, Clone)]
pub struct ProcessedAudioChunk {
    pub samples: Vec<i32>,
    pub channels: u16,
    pub sample_rate: u32,
    pub ssrcs: Vec<u32>,
    pub produced_time: Instant,
    pub rtp_timestamp: Option<u32>,
}

impl ProcessedAudioChunk {
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn silence(channels: u16, sample_rate: u32, frames: usize) -> Self {
        Self {
            samples: vec![0; frames * channels as usize],
            channels,
            sample_rate,
            ssrcs: Vec::new(),
            produced_time: Instant::now(),
            rtp_timestamp: None,
        }
    }
}
