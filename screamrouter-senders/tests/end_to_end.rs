//! Drives a real `AudioManager` sink with a real `ScreamSender` listener over
//! loopback UDP, matching how a host process actually wires the two crates.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use bytes::Bytes;
use screamrouter_core::config::AudioEngineConfig;
use screamrouter_core::manager::{AudioManager, SinkSpec};
use screamrouter_core::packet::TaggedAudioPacket;
use screamrouter_senders::ScreamSender;

fn sine_packet(tag: &str, frames: usize, sample_rate: u32) -> TaggedAudioPacket {
    let mut pcm = Vec::with_capacity(frames * 4);
    for i in 0..frames {
        let phase = i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32;
        let sample = (phase.sin() * 20_000.0) as i16;
        pcm.extend_from_slice(&sample.to_le_bytes());
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    TaggedAudioPacket {
        source_tag: tag.to_string(),
        sample_rate,
        channels: 2,
        bit_depth: 16,
        chlayout1: 0,
        chlayout2: 0,
        audio_data: Bytes::from(pcm),
        rtp_timestamp: None,
        received_time: Instant::now(),
        playback_rate: 1.0,
        ssrcs: vec![7],
    }
}

#[test]
fn scream_loopback_end_to_end() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let dest = receiver.local_addr().unwrap();

    let manager = AudioManager::new(AudioEngineConfig::default());
    manager
        .add_sink(
            "sink1",
            SinkSpec {
                channels: 2,
                bit_depth: 16,
                sample_rate: 48000,
                chunk_frames: 288,
                synchronized: false,
            },
        )
        .unwrap();

    manager
        .add_listener("sink1", Box::new(ScreamSender::new(vec![dest], 48000, 16, 2)))
        .unwrap();

    manager.connect("src-a", "sink1", 2, 16, 48000, 1.0).unwrap();

    let keep_feeding = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    std::thread::scope(|scope| {
        let feeding = keep_feeding.clone();
        scope.spawn(|| {
            let manager = &manager;
            while feeding.load(std::sync::atomic::Ordering::Relaxed) {
                manager.push_packet(sine_packet("src-a", 288, 48000));
                std::thread::sleep(Duration::from_millis(3));
            }
        });

        let mut received = 0;
        let deadline = Instant::now() + Duration::from_millis(400);
        let mut buf = [0u8; 2048];
        while Instant::now() < deadline && received < 15 {
            if let Ok((n, _)) = receiver.recv_from(&mut buf) {
                assert_eq!(&buf[..5], &[0x81, 0x10, 0x02, 0x03, 0x00]);
                assert_eq!(n, 5 + 288 * 4);
                received += 1;
            }
        }
        keep_feeding.store(false, std::sync::atomic::Ordering::Relaxed);
        assert!(received >= 15, "expected at least 15 Scream packets over loopback, got {received}");
    });

    manager.shutdown();
}
