//! RTP senders: RTP/L16 (PCM, payload type 127) and RTP/Opus (payload type
//! 111). Both build standard 12-byte RTP headers plus an optional CSRC list
//! sourced from the mixer's per-tick contributor set.

use std::net::{SocketAddr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

use screamrouter_core::error::{Error, Result};
use screamrouter_core::sender::Sender;

use crate::net::bind_sender_socket;

const RTP_VERSION: u8 = 2;
const PAYLOAD_TYPE_L16: u8 = 127;
const PAYLOAD_TYPE_OPUS: u8 = 111;
const OPUS_FRAME_SAMPLES: usize = 960; // 20ms @ 48kHz

fn random_ssrc() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0xC0FFEE)
        ^ std::process::id()
}

/// Encodes a 12-byte RTP header plus an optional CSRC list into `out`,
/// returning the number of bytes written.
fn encode_header(
    out: &mut Vec<u8>,
    payload_type: u8,
    marker: bool,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    csrcs: &[u32],
) {
    let csrc_count = csrcs.len().min(15) as u8;
    let byte0 = (RTP_VERSION << 6) | csrc_count;
    let byte1 = (if marker { 0x80 } else { 0 }) | (payload_type & 0x7F);
    out.push(byte0);
    out.push(byte1);
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    for csrc in csrcs.iter().take(csrc_count as usize) {
        out.extend_from_slice(&csrc.to_be_bytes());
    }
}

fn swap_to_network_order(samples: &[u8], bit_depth: u16) -> Vec<u8> {
    // Input is host-order (little-endian on every platform we target); RTP/L16
    // payload must be network (big-endian) order.
    match bit_depth {
        16 => samples
            .chunks_exact(2)
            .flat_map(|c| [c[1], c[0]])
            .collect(),
        24 => samples
            .chunks_exact(3)
            .flat_map(|c| [c[2], c[1], c[0]])
            .collect(),
        32 => samples
            .chunks_exact(4)
            .flat_map(|c| [c[3], c[2], c[1], c[0]])
            .collect(),
        _ => samples.to_vec(),
    }
}

pub struct RtpL16Sender {
    destinations: Vec<SocketAddr>,
    bit_depth: u16,
    channels: u16,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    socket: Option<UdpSocket>,
}

impl RtpL16Sender {
    pub fn new(destinations: Vec<SocketAddr>, bit_depth: u16, channels: u16) -> Self {
        Self {
            destinations,
            bit_depth,
            channels,
            ssrc: random_ssrc(),
            sequence: 0,
            timestamp: 0,
            socket: None,
        }
    }

    fn bytes_per_frame(&self) -> usize {
        (self.bit_depth / 8) as usize * self.channels as usize
    }
}

impl Sender for RtpL16Sender {
    fn setup(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        self.socket = Some(bind_sender_socket("rtp-l16")?);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn send_payload(&mut self, payload: &[u8], csrcs: &[u32]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let bytes_per_frame = self.bytes_per_frame();
        if bytes_per_frame == 0 || payload.len() % bytes_per_frame != 0 {
            tracing::debug!("rtp-l16 sender: payload not frame-aligned, dropping");
            return;
        }
        let network_payload = swap_to_network_order(payload, self.bit_depth);

        let mut packet = Vec::with_capacity(12 + 4 * csrcs.len() + network_payload.len());
        encode_header(
            &mut packet,
            PAYLOAD_TYPE_L16,
            false,
            self.sequence,
            self.timestamp,
            self.ssrc,
            csrcs,
        );
        packet.extend_from_slice(&network_payload);

        for dest in &self.destinations {
            if let Err(e) = socket.send_to(&packet, dest) {
                tracing::debug!(%dest, error = %e, "rtp-l16 sender: send failed, dropping");
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add((payload.len() / bytes_per_frame) as u32);
    }
}

/// Per-receiver multi-device fan-out: each destination gets its own stereo
/// extraction from a wider multichannel mix, all sharing one RTP timestamp.
pub struct RtpL16MultiDeviceSender {
    receivers: Vec<(SocketAddr, usize, usize)>, // (addr, left_channel, right_channel)
    channels: u16,
    bit_depth: u16,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    mtu_bytes: usize,
    socket: Option<UdpSocket>,
}

impl RtpL16MultiDeviceSender {
    pub fn new(
        receivers: Vec<(SocketAddr, usize, usize)>,
        channels: u16,
        bit_depth: u16,
        mtu_bytes: usize,
    ) -> Self {
        Self {
            receivers,
            channels,
            bit_depth,
            ssrc: random_ssrc(),
            sequence: 0,
            timestamp: 0,
            mtu_bytes,
            socket: None,
        }
    }

    fn extract_stereo(&self, payload: &[u8], left: usize, right: usize) -> Vec<u8> {
        let bytes_per_sample = (self.bit_depth / 8) as usize;
        let frame_bytes = bytes_per_sample * self.channels as usize;
        if frame_bytes == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(payload.len() / self.channels.max(1) as usize * 2);
        for frame in payload.chunks_exact(frame_bytes) {
            let l_start = left * bytes_per_sample;
            let r_start = right * bytes_per_sample;
            out.extend_from_slice(&frame[l_start..l_start + bytes_per_sample]);
            out.extend_from_slice(&frame[r_start..r_start + bytes_per_sample]);
        }
        out
    }
}

impl Sender for RtpL16MultiDeviceSender {
    fn setup(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        self.socket = Some(bind_sender_socket("rtp-l16-multi")?);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn send_payload(&mut self, payload: &[u8], csrcs: &[u32]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let bytes_per_sample = (self.bit_depth / 8) as usize;
        let stereo_frame_bytes = bytes_per_sample * 2;
        let shared_timestamp = self.timestamp;
        let mut frames_sent = 0usize;

        for (addr, left, right) in &self.receivers {
            let stereo = self.extract_stereo(payload, *left, *right);
            let network = swap_to_network_order(&stereo, self.bit_depth);
            frames_sent = network.len() / stereo_frame_bytes;

            let max_payload_bytes = (self.mtu_bytes / stereo_frame_bytes).max(1) * stereo_frame_bytes;
            let mut seq = self.sequence;
            let chunks: Vec<&[u8]> = network.chunks(max_payload_bytes).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let is_last = i + 1 == chunks.len();
                let mut packet = Vec::with_capacity(12 + 4 * csrcs.len() + chunk.len());
                encode_header(
                    &mut packet,
                    PAYLOAD_TYPE_L16,
                    is_last,
                    seq,
                    shared_timestamp,
                    self.ssrc,
                    csrcs,
                );
                packet.extend_from_slice(chunk);
                if let Err(e) = socket.send_to(&packet, addr) {
                    tracing::debug!(%addr, error = %e, "rtp-l16 multi sender: send failed, dropping");
                }
                seq = seq.wrapping_add(1);
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(frames_sent as u32);
    }
}

pub struct RtpOpusSender {
    destinations: Vec<SocketAddr>,
    channels: u16,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    encoder: audiopus::coder::Encoder,
    socket: Option<UdpSocket>,
}

impl RtpOpusSender {
    pub fn new(destinations: Vec<SocketAddr>, channels: u16) -> Result<Self> {
        let opus_channels = match channels {
            1 => audiopus::Channels::Mono,
            2 => audiopus::Channels::Stereo,
            n => {
                return Err(Error::UnsupportedChannelCount(n));
            }
        };
        let encoder = audiopus::coder::Encoder::new(
            audiopus::SampleRate::Hz48000,
            opus_channels,
            audiopus::Application::Audio,
        )
        .map_err(|e| Error::other(format!("opus encoder init failed: {e}")))?;
        Ok(Self {
            destinations,
            channels,
            ssrc: random_ssrc(),
            sequence: 0,
            timestamp: 0,
            encoder,
            socket: None,
        })
    }
}

impl Sender for RtpOpusSender {
    fn setup(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        self.socket = Some(bind_sender_socket("rtp-opus")?);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn send_payload(&mut self, payload: &[u8], csrcs: &[u32]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let channels = self.channels.max(1) as usize;
        let samples: Vec<i16> = payload
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect();
        let expected = OPUS_FRAME_SAMPLES * channels;
        if samples.len() != expected {
            tracing::debug!(
                got = samples.len(),
                expected,
                "opus sender: frame size mismatch, dropping"
            );
            return;
        }

        let mut opus_buf = [0u8; 4000];
        let written = match self.encoder.encode(&samples, &mut opus_buf) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "opus encode failed, dropping");
                return;
            }
        };

        let mut packet = Vec::with_capacity(12 + 4 * csrcs.len() + written);
        encode_header(
            &mut packet,
            PAYLOAD_TYPE_OPUS,
            false,
            self.sequence,
            self.timestamp,
            self.ssrc,
            csrcs,
        );
        packet.extend_from_slice(&opus_buf[..written]);

        for dest in &self.destinations {
            if let Err(e) = socket.send_to(&packet, dest) {
                tracing::debug!(%dest, error = %e, "rtp-opus sender: send failed, dropping");
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(OPUS_FRAME_SAMPLES as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_version_and_csrc_count() {
        let mut out = Vec::new();
        encode_header(&mut out, PAYLOAD_TYPE_L16, true, 7, 1000, 0xAABBCCDD, &[1, 2]);
        assert_eq!(out[0] >> 6, RTP_VERSION);
        assert_eq!(out[0] & 0x0F, 2);
        assert_eq!(out[1] & 0x80, 0x80);
        assert_eq!(out[1] & 0x7F, PAYLOAD_TYPE_L16);
        assert_eq!(out.len(), 12 + 8);
    }

    #[test]
    fn swap_to_network_order_reverses_16_bit_pairs() {
        let host = [0x34, 0x12];
        let net = swap_to_network_order(&host, 16);
        assert_eq!(net, vec![0x12, 0x34]);
    }

    #[test]
    fn multi_device_extracts_requested_channel_pair() {
        let sender = RtpL16MultiDeviceSender::new(Vec::new(), 4, 16, 1400);
        // frame: ch0=0x0001, ch1=0x0002, ch2=0x0003, ch3=0x0004 (host LE)
        let frame: Vec<u8> = vec![1, 0, 2, 0, 3, 0, 4, 0];
        let stereo = sender.extract_stereo(&frame, 2, 3);
        assert_eq!(stereo, vec![3, 0, 4, 0]);
    }

    #[test]
    fn multi_device_uses_one_shared_timestamp_across_receivers() {
        use std::net::UdpSocket;

        let recv_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let recv_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv_a.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        recv_b.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();

        let mut sender = RtpL16MultiDeviceSender::new(
            vec![
                (recv_a.local_addr().unwrap(), 0, 1),
                (recv_b.local_addr().unwrap(), 2, 3),
            ],
            4,
            16,
            1400,
        );
        sender.setup().unwrap();

        // one 8-channel frame, values 1..=8 (host LE 16-bit)
        let mut frame = Vec::new();
        for v in 1i16..=8 {
            frame.extend_from_slice(&v.to_le_bytes());
        }
        sender.send_payload(&frame, &[]);

        let mut buf_a = [0u8; 64];
        let (n_a, _) = recv_a.recv_from(&mut buf_a).unwrap();
        let mut buf_b = [0u8; 64];
        let (n_b, _) = recv_b.recv_from(&mut buf_b).unwrap();

        let ts_a = u32::from_be_bytes([buf_a[4], buf_a[5], buf_a[6], buf_a[7]]);
        let ts_b = u32::from_be_bytes([buf_b[4], buf_b[5], buf_b[6], buf_b[7]]);
        assert_eq!(ts_a, ts_b);

        // receiver A got channels {0,1} -> samples 1,2; receiver B got {2,3} -> samples 3,4
        let payload_a = &buf_a[12..n_a];
        let payload_b = &buf_b[12..n_b];
        assert_eq!(u16::from_be_bytes([payload_a[0], payload_a[1]]), 1);
        assert_eq!(u16::from_be_bytes([payload_a[2], payload_a[3]]), 2);
        assert_eq!(u16::from_be_bytes([payload_b[0], payload_b[1]]), 3);
        assert_eq!(u16::from_be_bytes([payload_b[2], payload_b[3]]), 4);
    }
}
