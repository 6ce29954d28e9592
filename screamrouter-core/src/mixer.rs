//! Sink Mixer: the per-sink tick loop. Waits on a shared mix-tick condition,
//! harvests one chunk per active source from the Mix Scheduler, saturating-sums
//! them, optionally nudges laggy sources via an adaptive drain, downconverts to
//! the sink's wire bit depth, and fans the result out to every registered
//! sender plus the MP3 side-chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::ClockCondition;
use crate::config::{MixerTuning, ProfilerTuning, TelemetryTuning};
use crate::input_processor::IpCommand;
use crate::packet::ProcessedAudioChunk;
use crate::queue::BoundedQueue;
use crate::scheduler::{MixScheduler, SourceId};
use crate::sender::{Mp3Encoder, Sender};
use crate::sync::SinkCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Mixed { frames: usize, active_sources: usize },
    Underrun,
}

#[derive(Debug, Default, Clone)]
pub struct MixerStats {
    pub ticks: u64,
    pub underrun_ticks: u64,
    pub frames_mixed: u64,
    pub samples_clipped: u64,
}

struct ProfilerAccumulator {
    count: u64,
    sum: Duration,
    min: Duration,
    max: Duration,
    window_start: Instant,
}

impl ProfilerAccumulator {
    fn new() -> Self {
        Self {
            count: 0,
            sum: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            window_start: Instant::now(),
        }
    }

    fn record(&mut self, d: Duration) {
        self.count += 1;
        self.sum += d;
        self.min = self.min.min(d);
        self.max = self.max.max(d);
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Per-source lag tracking feeding the adaptive drain decision.
struct SourceDrainState {
    avg_latency_ms: f32,
    current_rate_scale: f64,
    command_queue: BoundedQueue<IpCommand>,
}

/// Stereo down-mix side-chain feeding the MP3 worker. Kept deliberately simple:
/// an even-weighted fold of every mixed channel into L/R, not a full
/// `InputProcessor` instance, since the MP3 tap never needs EQ/resample/dither.
struct Mp3Side {
    encoder: Box<dyn Mp3Encoder>,
    output_queue: BoundedQueue<crate::sender::EncodedMp3Frame>,
}

pub struct SinkMixer {
    sink_id: String,
    channels: u16,
    bit_depth: u16,
    sample_rate: u32,
    chunk_frames: usize,

    tuning: MixerTuning,
    profiler_tuning: ProfilerTuning,
    telemetry_tuning: TelemetryTuning,

    scheduler: Arc<MixScheduler>,
    clock: Arc<ClockCondition>,
    coordinator: Option<SinkCoordinator>,

    senders: Mutex<Vec<Box<dyn Sender>>>,
    drain_state: Mutex<HashMap<SourceId, SourceDrainState>>,
    mp3: Mutex<Option<Mp3Side>>,

    stats: Mutex<MixerStats>,
    profiler: Mutex<ProfilerAccumulator>,
    underrun_since: Mutex<Option<Instant>>,

    next_rtp_ts: AtomicU64,
}

impl SinkMixer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink_id: String,
        channels: u16,
        bit_depth: u16,
        sample_rate: u32,
        chunk_frames: usize,
        tuning: MixerTuning,
        profiler_tuning: ProfilerTuning,
        telemetry_tuning: TelemetryTuning,
        scheduler: Arc<MixScheduler>,
        clock: Arc<ClockCondition>,
    ) -> Self {
        Self {
            sink_id,
            channels,
            bit_depth,
            sample_rate,
            chunk_frames,
            tuning,
            profiler_tuning,
            telemetry_tuning,
            scheduler,
            clock,
            coordinator: None,
            senders: Mutex::new(Vec::new()),
            drain_state: Mutex::new(HashMap::new()),
            mp3: Mutex::new(None),
            stats: Mutex::new(MixerStats::default()),
            profiler: Mutex::new(ProfilerAccumulator::new()),
            underrun_since: Mutex::new(None),
            next_rtp_ts: AtomicU64::new(0),
        }
    }

    pub fn set_coordinator(&mut self, coordinator: SinkCoordinator) {
        self.coordinator = Some(coordinator);
    }

    pub fn add_sender(&self, sender: Box<dyn Sender>) {
        self.senders.lock().push(sender);
    }

    pub fn enable_mp3(&self, encoder: Box<dyn Mp3Encoder>) {
        *self.mp3.lock() = Some(Mp3Side {
            encoder,
            output_queue: BoundedQueue::new(self.tuning.mp3_output_queue_max_size),
        });
    }

    pub fn mp3_output_queue(&self) -> Option<BoundedQueue<crate::sender::EncodedMp3Frame>> {
        self.mp3.lock().as_ref().map(|m| m.output_queue.clone())
    }

    /// Register the command queue a source's Input Processor listens on, so the
    /// adaptive drain can push `SetPlaybackRateScale` nudges back to it.
    pub fn register_source_command_queue(&self, source: SourceId, queue: BoundedQueue<IpCommand>) {
        self.drain_state.lock().insert(
            source,
            SourceDrainState {
                avg_latency_ms: self.tuning.target_buffer_level_ms,
                current_rate_scale: 1.0,
                command_queue: queue,
            },
        );
    }

    pub fn unregister_source(&self, source: &str) {
        self.drain_state.lock().remove(source);
        self.scheduler.detach_source(source);
    }

    pub fn stats(&self) -> MixerStats {
        self.stats.lock().clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Blocks on the shared tick condition, then runs exactly one mix/dispatch
    /// cycle. Intended to be called in a loop from the sink's own thread.
    pub fn run_one_tick(&self, last_seen_seq: &mut u64) -> TickOutcome {
        *last_seen_seq = self.clock.wait_for_tick(*last_seen_seq);
        let tick_start = Instant::now();

        if let Some(coord) = &self.coordinator {
            coord.begin_dispatch();
        }

        let harvest = self.scheduler.collect_ready_chunks();
        for drained in &harvest.drained_sources {
            self.unregister_source(drained);
        }

        let active_sources = harvest.ready_chunks.len();
        let outcome = if active_sources == 0 {
            self.handle_underrun()
        } else {
            self.handle_mix(harvest.ready_chunks)
        };

        self.update_drain_state();
        self.record_profile(tick_start.elapsed());

        if let Some(coord) = &self.coordinator {
            coord.report_dispatch(self.chunk_frames as u64, self.next_rtp_ts.load(Ordering::Relaxed) as u32);
        }

        outcome
    }

    fn handle_underrun(&self) -> TickOutcome {
        let mut since = self.underrun_since.lock();
        let held_for = since.get_or_insert_with(Instant::now).elapsed();

        let mut stats = self.stats.lock();
        stats.ticks += 1;
        stats.underrun_ticks += 1;
        drop(stats);

        if held_for >= Duration::from_millis(self.tuning.underrun_hold_timeout_ms) {
            let silence = vec![0u8; self.chunk_frames * self.channels as usize * (self.bit_depth as usize / 8)];
            self.dispatch(&silence, &[]);
        }
        TickOutcome::Underrun
    }

    fn handle_mix(&self, chunks: HashMap<SourceId, ProcessedAudioChunk>) -> TickOutcome {
        *self.underrun_since.lock() = None;

        let frames = chunks
            .values()
            .map(ProcessedAudioChunk::frame_count)
            .max()
            .unwrap_or(0);
        let total_samples = frames * self.channels as usize;
        let mut mixed = vec![0i64; total_samples];
        let mut csrcs = Vec::new();

        let now = Instant::now();
        let mut drain_state = self.drain_state.lock();
        for (source, chunk) in chunks.iter() {
            csrcs.extend(chunk.ssrcs.iter().copied());
            for (i, &s) in chunk.samples.iter().enumerate().take(total_samples) {
                mixed[i] += s as i64;
            }
            if let Some(state) = drain_state.get_mut(source) {
                let latency_ms = now.duration_since(chunk.produced_time).as_secs_f32() * 1000.0;
                state.avg_latency_ms = state.avg_latency_ms * 0.9 + latency_ms * 0.1;
            }
        }
        drop(drain_state);
        csrcs.sort_unstable();
        csrcs.dedup();

        let mut clipped = 0u64;
        let saturated: Vec<i32> = mixed
            .into_iter()
            .map(|s| {
                if s > i32::MAX as i64 || s < i32::MIN as i64 {
                    clipped += 1;
                }
                s.clamp(i32::MIN as i64, i32::MAX as i64) as i32
            })
            .collect();

        let mut stats = self.stats.lock();
        stats.ticks += 1;
        stats.frames_mixed += frames as u64;
        stats.samples_clipped += clipped;
        drop(stats);

        let payload = samples_to_bytes(&saturated, self.bit_depth);
        self.dispatch(&payload, &csrcs);
        self.feed_mp3(&saturated, frames);
        self.next_rtp_ts.fetch_add(frames as u64, Ordering::Relaxed);

        TickOutcome::Mixed {
            frames,
            active_sources: chunks.len(),
        }
    }

    fn dispatch(&self, payload: &[u8], csrcs: &[u32]) {
        let mut senders = self.senders.lock();
        senders.retain_mut(|sender| {
            if sender.is_closed() {
                sender.close();
                return false;
            }
            sender.send_payload(payload, csrcs);
            true
        });
    }

    fn feed_mp3(&self, mixed: &[i32], frames: usize) {
        let mut mp3 = self.mp3.lock();
        let Some(side) = mp3.as_mut() else {
            return;
        };
        let ch = self.channels as usize;
        if ch == 0 || frames == 0 {
            return;
        }
        let mut stereo = vec![0i32; frames * 2];
        for f in 0..frames {
            let frame = &mixed[f * ch..f * ch + ch];
            let (l, r) = downmix_to_stereo(frame);
            stereo[f * 2] = l;
            stereo[f * 2 + 1] = r;
        }
        for encoded in side.encoder.encode(&stereo) {
            side.output_queue.push_drop_oldest(encoded);
        }
    }

    /// Adjusts each source's requested playback-rate scale toward draining or
    /// refilling its queue back to `target_buffer_level_ms`, using the age of
    /// its most recently harvested chunk as a proxy for buffer depth.
    fn update_drain_state(&self) {
        if !self.tuning.enable_adaptive_buffer_drain {
            return;
        }
        let mut drain_state = self.drain_state.lock();
        for state in drain_state.values_mut() {
            let target = self.tuning.target_buffer_level_ms;
            let tolerance = self.tuning.buffer_tolerance_ms;
            let error = state.avg_latency_ms - target;

            let desired_scale = if error > tolerance {
                1.0 + (self.tuning.drain_rate_ms_per_sec / 1000.0 / target.max(1.0)) as f64
            } else if error < -tolerance {
                1.0 - (self.tuning.drain_rate_ms_per_sec / 1000.0 / target.max(1.0)) as f64
            } else {
                1.0
            };
            let desired_scale = desired_scale.clamp(
                2.0 - self.tuning.max_speedup_factor as f64,
                self.tuning.max_speedup_factor as f64,
            );

            let smoothing = self.tuning.drain_smoothing_factor as f64;
            let new_scale = state.current_rate_scale * (1.0 - smoothing) + desired_scale * smoothing;
            if (new_scale - state.current_rate_scale).abs() > 1e-4 {
                state.current_rate_scale = new_scale;
                state
                    .command_queue
                    .push_drop_oldest(IpCommand::SetPlaybackRateScale(new_scale));
            }
        }
    }

    fn record_profile(&self, tick_duration: Duration) {
        if !self.profiler_tuning.enabled && !self.telemetry_tuning.enabled {
            return;
        }
        let mut profiler = self.profiler.lock();
        profiler.record(tick_duration);

        let interval = Duration::from_millis(self.profiler_tuning.log_interval_ms.max(1));
        if profiler.window_start.elapsed() >= interval {
            let avg = if profiler.count > 0 {
                profiler.sum / profiler.count as u32
            } else {
                Duration::ZERO
            };
            if self.profiler_tuning.enabled {
                debug!(
                    sink = %self.sink_id,
                    ticks = profiler.count,
                    avg_us = avg.as_micros(),
                    min_us = profiler.min.as_micros(),
                    max_us = profiler.max.as_micros(),
                    "mix tick profile"
                );
            }
            if self.telemetry_tuning.enabled {
                let stats = self.stats.lock();
                debug!(
                    sink = %self.sink_id,
                    underrun_ticks = stats.underrun_ticks,
                    frames_mixed = stats.frames_mixed,
                    samples_clipped = stats.samples_clipped,
                    "mix tick telemetry"
                );
                if stats.samples_clipped > 0 {
                    warn!(sink = %self.sink_id, clipped = stats.samples_clipped, "sink is clipping");
                }
            }
            profiler.reset();
        }
    }
}

fn downmix_to_stereo(frame: &[i32]) -> (i32, i32) {
    match frame.len() {
        0 => (0, 0),
        1 => (frame[0], frame[0]),
        2 => (frame[0], frame[1]),
        n => {
            let half = n / 2;
            let l: i64 = frame[..half].iter().map(|&s| s as i64).sum::<i64>() / half.max(1) as i64;
            let r: i64 = frame[half..].iter().map(|&s| s as i64).sum::<i64>() / (n - half).max(1) as i64;
            (l as i32, r as i32)
        }
    }
}

fn samples_to_bytes(samples: &[i32], bit_depth: u16) -> Vec<u8> {
    match bit_depth {
        16 => samples
            .iter()
            .flat_map(|&s| ((s >> 16) as i16).to_le_bytes())
            .collect(),
        24 => samples
            .iter()
            .flat_map(|&s| {
                let v = s >> 8;
                [(v & 0xff) as u8, ((v >> 8) & 0xff) as u8, ((v >> 16) & 0xff) as u8]
            })
            .collect(),
        32 => samples.iter().flat_map(|&s| s.to_le_bytes()).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockKey;
    use crate::clock::ClockManager;
    use crate::config::{MixerTuning, ProfilerTuning, TelemetryTuning};
    use crate::scheduler::MixScheduler;
    use std::sync::Mutex as StdMutex;

    struct RecordingSender {
        payloads: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl Sender for RecordingSender {
        fn setup(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) {
            self.payloads.lock().unwrap().push(payload.to_vec());
        }
    }

    fn make_mixer() -> (SinkMixer, Arc<MixScheduler>) {
        let clock_mgr = ClockManager::new();
        let key = ClockKey {
            rate: 48000,
            channels: 2,
            bit_depth: 16,
        };
        let condition = clock_mgr.condition_for(key, 1152);
        let scheduler = Arc::new(MixScheduler::new(8));
        let mixer = SinkMixer::new(
            "sink1".into(),
            2,
            16,
            48000,
            288,
            MixerTuning {
                enable_adaptive_buffer_drain: false,
                ..MixerTuning::default()
            },
            ProfilerTuning::default(),
            TelemetryTuning::default(),
            scheduler.clone(),
            condition,
        );
        (mixer, scheduler)
    }

    fn chunk(val: i32, frames: usize) -> ProcessedAudioChunk {
        ProcessedAudioChunk {
            samples: vec![val; frames * 2],
            channels: 2,
            sample_rate: 48000,
            ssrcs: vec![7],
            produced_time: Instant::now(),
            rtp_timestamp: None,
        }
    }

    #[test]
    fn mixing_two_sources_sums_samples() {
        let (mixer, scheduler) = make_mixer();
        let a = scheduler.attach_source("a".into());
        let b = scheduler.attach_source("b".into());
        a.push(chunk(1000, 16));
        b.push(chunk(2000, 16));

        let payloads = Arc::new(StdMutex::new(Vec::new()));
        mixer.add_sender(Box::new(RecordingSender { payloads: payloads.clone() }));

        let harvest = scheduler.collect_ready_chunks();
        let outcome = mixer.handle_mix(harvest.ready_chunks);
        assert_eq!(outcome, TickOutcome::Mixed { frames: 16, active_sources: 2 });
        assert_eq!(payloads.lock().unwrap().len(), 1);
    }

    #[test]
    fn saturating_mix_clips_instead_of_wrapping() {
        let (mixer, scheduler) = make_mixer();
        let a = scheduler.attach_source("a".into());
        let b = scheduler.attach_source("b".into());
        a.push(chunk(i32::MAX - 10, 4));
        b.push(chunk(i32::MAX - 10, 4));

        let harvest = scheduler.collect_ready_chunks();
        mixer.handle_mix(harvest.ready_chunks);
        assert!(mixer.stats().samples_clipped > 0);
    }

    #[test]
    fn no_sources_reports_underrun() {
        let (mixer, _scheduler) = make_mixer();
        let outcome = mixer.handle_underrun();
        assert_eq!(outcome, TickOutcome::Underrun);
        assert_eq!(mixer.stats().underrun_ticks, 1);
    }

    #[test]
    fn samples_to_bytes_16_bit_round_trips_sign() {
        let bytes = samples_to_bytes(&[-1 << 16], 16);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), -1);
    }

    #[test]
    fn underrun_emits_silence_only_after_hold_timeout() {
        let clock_mgr = ClockManager::new();
        let key = ClockKey { rate: 48000, channels: 2, bit_depth: 16 };
        let condition = clock_mgr.condition_for(key, 1152);
        let scheduler = Arc::new(MixScheduler::new(8));
        let mixer = SinkMixer::new(
            "sink1".into(),
            2,
            16,
            48000,
            288,
            MixerTuning {
                underrun_hold_timeout_ms: 0,
                ..MixerTuning::default()
            },
            ProfilerTuning::default(),
            TelemetryTuning::default(),
            scheduler,
            condition,
        );
        let payloads = Arc::new(StdMutex::new(Vec::new()));
        mixer.add_sender(Box::new(RecordingSender { payloads: payloads.clone() }));

        mixer.handle_underrun();
        assert_eq!(payloads.lock().unwrap().len(), 1, "zero-ms hold should emit silence immediately");
    }

    #[test]
    fn adaptive_drain_requests_speedup_when_backlog_exceeds_target() {
        let clock_mgr = ClockManager::new();
        let key = ClockKey { rate: 48000, channels: 2, bit_depth: 16 };
        let condition = clock_mgr.condition_for(key, 1152);
        let scheduler = Arc::new(MixScheduler::new(8));
        let mixer = SinkMixer::new(
            "sink1".into(),
            2,
            16,
            48000,
            288,
            MixerTuning {
                enable_adaptive_buffer_drain: true,
                target_buffer_level_ms: 40.0,
                buffer_tolerance_ms: 5.0,
                max_speedup_factor: 1.02,
                drain_smoothing_factor: 1.0,
                ..MixerTuning::default()
            },
            ProfilerTuning::default(),
            TelemetryTuning::default(),
            scheduler,
            condition,
        );

        let commands: BoundedQueue<IpCommand> = BoundedQueue::new(8);
        mixer.register_source_command_queue("a".to_string(), commands.clone());
        mixer.drain_state.lock().get_mut("a").unwrap().avg_latency_ms = 200.0;

        mixer.update_drain_state();

        match commands.try_pop() {
            Some(IpCommand::SetPlaybackRateScale(scale)) => assert!(scale > 1.0 && scale <= 1.02),
            other => panic!("expected a SetPlaybackRateScale command, got {other:?}"),
        }
    }

    #[test]
    fn resumed_source_produces_non_silent_chunk_within_one_tick() {
        let (mixer, scheduler) = make_mixer();
        let payloads = Arc::new(StdMutex::new(Vec::new()));
        mixer.add_sender(Box::new(RecordingSender { payloads: payloads.clone() }));

        // both sources silent: underrun branch, no chunks in flight yet.
        let harvest = scheduler.collect_ready_chunks();
        assert!(harvest.ready_chunks.is_empty());
        mixer.handle_underrun();

        // source "a" resumes; the very next tick must mix and dispatch a
        // non-silent payload, not hold through another underrun tick.
        let a = scheduler.attach_source("a".into());
        a.push(chunk(1000, 16));
        let harvest = scheduler.collect_ready_chunks();
        let outcome = mixer.handle_mix(harvest.ready_chunks);
        assert_eq!(outcome, TickOutcome::Mixed { frames: 16, active_sources: 1 });

        let last = payloads.lock().unwrap().last().cloned().unwrap();
        assert!(last.iter().any(|&b| b != 0), "resumed source's chunk must not be silent");
    }
}
