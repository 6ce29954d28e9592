//! Local hardware playback sender: feeds a cpal output stream through a
//! lock-free ring buffer, with an optional PI feedback loop that nudges the
//! mixer's playback rate to track device drift.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use screamrouter_core::error::{Error, Result};
use screamrouter_core::sender::Sender;

const RING_BUFFER_SECONDS: u32 = 2;
/// Target ~24ms of buffered audio across three periods, per the hardware
/// playback contract.
const TARGET_BUFFER_MS: f64 = 24.0;
const PERIODS: u32 = 3;

/// PI controller over buffer fill level, producing a clamped rate multiplier.
struct DriftController {
    target_frames: f64,
    kp: f64,
    ki: f64,
    integral: f64,
}

impl DriftController {
    fn new(target_frames: f64) -> Self {
        Self {
            target_frames,
            kp: 0.0005,
            ki: 0.00001,
            integral: 0.0,
        }
    }

    fn update(&mut self, buffered_frames: f64) -> f64 {
        let error = (buffered_frames - self.target_frames) / self.target_frames.max(1.0);
        let error = if error.abs() < 0.02 { 0.0 } else { error };
        self.integral = (self.integral + error * self.ki).clamp(-0.02, 0.02);
        let adjustment = error * self.kp + self.integral;
        (1.0 + adjustment).clamp(0.96, 1.02)
    }
}

/// cpal's `Stream` is not `Send` on every backend; the mixer only ever touches
/// it through `setup`/`close` on whichever thread owns this sender, never
/// concurrently, so the ownership transfer this wrapper allows is sound.
struct StreamHandle(cpal::Stream);
unsafe impl Send for StreamHandle {}

pub struct HardwarePlaybackSender {
    device_name: Option<String>,
    channels: u16,
    sample_rate: u32,
    bit_depth: u16,
    producer: Option<HeapProd<f32>>,
    stream: Option<StreamHandle>,
    frames_pushed: Arc<AtomicU64>,
    frames_pulled: Arc<AtomicU64>,
    current_rate: Arc<std::sync::Mutex<f64>>,
    feedback_enabled: bool,
    controller: DriftController,
}

impl HardwarePlaybackSender {
    pub fn new(
        device_name: Option<String>,
        channels: u16,
        sample_rate: u32,
        bit_depth: u16,
        feedback_enabled: bool,
    ) -> Self {
        let period_frames = sample_rate as f64 * (TARGET_BUFFER_MS / PERIODS as f64) / 1000.0;
        let target_frames = period_frames * PERIODS as f64;
        Self {
            device_name,
            channels,
            sample_rate,
            bit_depth,
            producer: None,
            stream: None,
            frames_pushed: Arc::new(AtomicU64::new(0)),
            frames_pulled: Arc::new(AtomicU64::new(0)),
            current_rate: Arc::new(std::sync::Mutex::new(1.0)),
            feedback_enabled,
            controller: DriftController::new(target_frames),
        }
    }

    /// Current playback rate multiplier published by the drift loop, clamped
    /// to `[0.96, 1.02]`. The sink mixer may read this to steer its own
    /// downstream pacing.
    pub fn playback_rate(&self) -> f64 {
        *self.current_rate.lock().unwrap()
    }

    fn find_device(&self, host: &cpal::Host) -> Option<cpal::Device> {
        if let Some(name) = &self.device_name {
            if let Ok(mut devices) = host.output_devices() {
                if let Some(d) = devices.find(|d| d.name().map(|n| &n == name).unwrap_or(false)) {
                    return Some(d);
                }
            }
        }
        host.default_output_device()
    }
}

impl Sender for HardwarePlaybackSender {
    fn setup(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let host = cpal::default_host();
        let device = self.find_device(&host).ok_or_else(|| Error::SenderSetupFailed {
            sink_id: "hardware".into(),
            reason: "no output device available".into(),
        })?;

        let capacity = (self.sample_rate as usize) * (self.channels as usize) * RING_BUFFER_SECONDS as usize;
        let ring = HeapRb::<f32>::new(capacity);
        let (producer, mut consumer): (HeapProd<f32>, HeapCons<f32>) = ring.split();

        let channels = self.channels;
        let frames_pulled = self.frames_pulled.clone();

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let pulled = consumer.pop_slice(data);
                    if pulled < data.len() {
                        data[pulled..].fill(0.0);
                    }
                    frames_pulled.fetch_add((pulled / channels.max(1) as usize) as u64, Ordering::Relaxed);
                },
                move |err| tracing::error!(%err, "hardware playback stream error"),
                None,
            )
            .map_err(|e| Error::SenderSetupFailed {
                sink_id: "hardware".into(),
                reason: e.to_string(),
            })?;

        stream.play().map_err(|e| Error::SenderSetupFailed {
            sink_id: "hardware".into(),
            reason: e.to_string(),
        })?;

        self.producer = Some(producer);
        self.stream = Some(StreamHandle(stream));
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.producer = None;
    }

    fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) {
        let Some(producer) = self.producer.as_mut() else {
            return;
        };
        let bytes_per_sample = (self.bit_depth / 8) as usize;
        if bytes_per_sample == 0 {
            return;
        }
        let samples: Vec<f32> = match self.bit_depth {
            16 => payload
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
                .collect(),
            24 => payload
                .chunks_exact(3)
                .map(|c| {
                    let v = i32::from_le_bytes([c[0], c[1], c[2], if c[2] & 0x80 != 0 { 0xFF } else { 0 }]);
                    v as f32 / 8_388_607.0
                })
                .collect(),
            32 => payload
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / i32::MAX as f32)
                .collect(),
            _ => return,
        };

        let pushed = producer.push_slice(&samples);
        self.frames_pushed
            .fetch_add((pushed / self.channels.max(1) as usize) as u64, Ordering::Relaxed);

        if self.feedback_enabled {
            let buffered = self.frames_pushed.load(Ordering::Relaxed) as f64
                - self.frames_pulled.load(Ordering::Relaxed) as f64;
            let rate = self.controller.update(buffered);
            *self.current_rate.lock().unwrap() = rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_controller_holds_rate_at_one_when_at_target() {
        let mut ctrl = DriftController::new(1000.0);
        let rate = ctrl.update(1000.0);
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn drift_controller_clamps_to_bounds() {
        let mut ctrl = DriftController::new(1.0);
        let rate = ctrl.update(1_000_000.0);
        assert!(rate <= 1.02);
        let mut ctrl2 = DriftController::new(1_000_000.0);
        let rate2 = ctrl2.update(0.0);
        assert!(rate2 >= 0.96);
    }
}
