//! Scream UDP sender: a 5-byte format header followed by raw little-endian PCM,
//! broadcast (or unicast) over UDP to one or more legacy Scream receivers.

use std::net::{SocketAddr, UdpSocket};

use screamrouter_core::error::Result;
use screamrouter_core::sender::Sender;

use crate::net::bind_sender_socket;

/// Scream's rate encoding packs a multiplier and a base-rate flag into one byte.
fn rate_byte(sample_rate: u32) -> u8 {
    let (base_is_44100, base) = if sample_rate % 44100 == 0 {
        (true, 44100u32)
    } else {
        (false, 48000u32)
    };
    let multiplier = (sample_rate / base).max(1).min(127) as u8;
    multiplier | ((base_is_44100 as u8) << 7)
}

fn channel_layout(channels: u16) -> (u8, u8) {
    // Standard SMPTE/WAVE channel masks for the common layouts; anything
    // unrecognized falls back to a front-left/front-right mask.
    match channels {
        1 => (0x04, 0x00),
        2 => (0x03, 0x00),
        4 => (0x33, 0x00),
        6 => (0x3F, 0x00),
        8 => (0x63, 0x06),
        n => {
            let _ = n;
            (0x03, 0x00)
        }
    }
}

/// Five evenly-spaced samples across the chunk all reading as digital zero is
/// treated as silence and the send is skipped entirely.
fn is_digital_silence(pcm: &[u8], bytes_per_sample: usize) -> bool {
    if pcm.is_empty() || bytes_per_sample == 0 {
        return true;
    }
    let frame_count = pcm.len() / bytes_per_sample;
    if frame_count == 0 {
        return true;
    }
    let probes = 5usize.min(frame_count);
    for i in 0..probes {
        let idx = i * frame_count / probes;
        let start = idx * bytes_per_sample;
        let end = start + bytes_per_sample;
        if pcm[start..end].iter().any(|&b| b != 0) {
            return false;
        }
    }
    true
}

pub struct ScreamSender {
    destinations: Vec<SocketAddr>,
    bit_depth: u16,
    channels: u16,
    sample_rate: u32,
    socket: Option<UdpSocket>,
}

impl ScreamSender {
    pub fn new(destinations: Vec<SocketAddr>, sample_rate: u32, bit_depth: u16, channels: u16) -> Self {
        Self {
            destinations,
            bit_depth,
            channels,
            sample_rate,
            socket: None,
        }
    }

    fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    fn header(&self) -> [u8; 5] {
        let (layout1, layout2) = channel_layout(self.channels);
        [
            rate_byte(self.sample_rate),
            self.bit_depth as u8,
            self.channels as u8,
            layout1,
            layout2,
        ]
    }
}

impl Sender for ScreamSender {
    fn setup(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        self.socket = Some(bind_sender_socket("scream")?);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        if is_digital_silence(payload, self.bytes_per_sample()) {
            tracing::trace!("scream sender: skipping silent chunk");
            return;
        }
        let header = self.header();
        let mut packet = Vec::with_capacity(header.len() + payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(payload);
        for dest in &self.destinations {
            if let Err(e) = socket.send_to(&packet, dest) {
                tracing::debug!(%dest, error = %e, "scream sender: send failed, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_byte_encodes_44100_family() {
        assert_eq!(rate_byte(44100), 1 | 0x80);
        assert_eq!(rate_byte(88200), 2 | 0x80);
    }

    #[test]
    fn rate_byte_encodes_48000_family() {
        assert_eq!(rate_byte(48000), 1);
        assert_eq!(rate_byte(96000), 2);
    }

    #[test]
    fn silence_check_detects_all_zero_chunk() {
        let pcm = vec![0u8; 4 * 100];
        assert!(is_digital_silence(&pcm, 4));
    }

    #[test]
    fn silence_check_misses_on_any_nonzero_probe() {
        let mut pcm = vec![0u8; 4 * 100];
        pcm[4 * 50] = 1;
        assert!(!is_digital_silence(&pcm, 4));
    }

    #[test]
    fn loopback_header_matches_48khz_stereo_16bit() {
        use std::net::UdpSocket;

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let mut sender = ScreamSender::new(vec![dest], 48000, 16, 2);
        sender.setup().unwrap();

        // 1kHz-ish sine, guaranteed non-silent (not all five probes are zero).
        let frame_count = 256;
        let mut pcm = Vec::with_capacity(frame_count * 4);
        for i in 0..frame_count {
            let sample = ((i as f32 * 0.2).sin() * 10_000.0) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
            pcm.extend_from_slice(&sample.to_le_bytes());
        }

        let mut received = 0;
        for _ in 0..20 {
            sender.send_payload(&pcm, &[]);
            let mut buf = [0u8; 2048];
            if let Ok((n, _)) = receiver.recv_from(&mut buf) {
                assert_eq!(&buf[..5], &[0x81, 0x10, 0x02, 0x03, 0x00]);
                assert_eq!(n, 5 + pcm.len());
                received += 1;
            }
        }
        assert!(received >= 15, "expected at least 15 packets, got {received}");
    }
}
