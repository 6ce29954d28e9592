//! Full-stack scenarios driving `AudioManager` the way a real protocol receiver
//! and a real sender would: packets in one end, dispatched payloads out the other.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use screamrouter_core::config::AudioEngineConfig;
use screamrouter_core::error::Result;
use screamrouter_core::manager::{AudioManager, SinkSpec};
use screamrouter_core::packet::TaggedAudioPacket;
use screamrouter_core::sender::Sender;

struct RecordingSender {
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Sender for RecordingSender {
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    fn close(&mut self) {}
    fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) {
        self.payloads.lock().unwrap().push(payload.to_vec());
    }
}

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
        ssrcs: vec![42],
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

#[test]
fn two_active_sources_dispatch_non_silent_audio() {
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

    let payloads = Arc::new(Mutex::new(Vec::new()));
    manager
        .add_listener("sink1", Box::new(RecordingSender { payloads: payloads.clone() }))
        .unwrap();

    manager.connect("a", "sink1", 2, 16, 48000, 1.0).unwrap();
    manager.connect("b", "sink1", 2, 16, 48000, 1.0).unwrap();

    let keep_feeding = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let feeder = {
        let manager_ref: &AudioManager = &manager;
        let keep_feeding = keep_feeding.clone();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                while keep_feeding.load(std::sync::atomic::Ordering::Relaxed) {
                    manager_ref.push_packet(sine_packet("a", 288, 48000));
                    manager_ref.push_packet(sine_packet("b", 288, 48000));
                    std::thread::sleep(Duration::from_millis(3));
                }
            });

            let found = wait_until(Duration::from_millis(500), || {
                payloads
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|p| p.iter().any(|&b| b != 0))
            });
            keep_feeding.store(false, std::sync::atomic::Ordering::Relaxed);
            found
        })
    };

    assert!(feeder, "expected at least one non-silent dispatched payload");
    manager.shutdown();
}

#[test]
fn underrun_then_resumed_source_transitions_silence_to_audio() {
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

    let payloads = Arc::new(Mutex::new(Vec::new()));
    manager
        .add_listener("sink1", Box::new(RecordingSender { payloads: payloads.clone() }))
        .unwrap();

    // No sources connected at all: the sink must eventually dispatch a
    // silent chunk once the underrun hold timeout elapses.
    let saw_silence = wait_until(Duration::from_millis(300), || {
        payloads
            .lock()
            .unwrap()
            .iter()
            .any(|p| !p.is_empty() && p.iter().all(|&b| b == 0))
    });
    assert!(saw_silence, "expected a silent chunk once the underrun hold timeout elapsed");

    payloads.lock().unwrap().clear();
    manager.connect("a", "sink1", 2, 16, 48000, 1.0).unwrap();

    let keep_feeding = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let became_audible = {
        let manager_ref: &AudioManager = &manager;
        let keep_feeding = keep_feeding.clone();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                while keep_feeding.load(std::sync::atomic::Ordering::Relaxed) {
                    manager_ref.push_packet(sine_packet("a", 288, 48000));
                    std::thread::sleep(Duration::from_millis(3));
                }
            });

            let found = wait_until(Duration::from_millis(500), || {
                payloads
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|p| p.iter().any(|&b| b != 0))
            });
            keep_feeding.store(false, std::sync::atomic::Ordering::Relaxed);
            found
        })
    };

    assert!(became_audible, "resumed source should produce a non-silent dispatch");
    manager.shutdown();
}
