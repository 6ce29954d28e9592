//! Audio Manager: the single process-wide registry tying the Time-Shift Manager,
//! Clock Manager, Mix Schedulers and Input Processors together. Every sink and
//! every `(source, sink)` binding owns one worker thread; add/remove here is the
//! only place that starts or stops them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{ClockKey, ClockManager};
use crate::config::AudioEngineConfig;
use crate::error::{Error, Result};
use crate::input_processor::{InputProcessor, IpCommand};
use crate::mixer::SinkMixer;
use crate::packet::TaggedAudioPacket;
use crate::queue::BoundedQueue;
use crate::scheduler::MixScheduler;
use crate::sender::Sender;
use crate::sync::{GlobalSynchronizationClock, SinkCoordinator};
use crate::tsm::{CursorHandle, TimeShiftManager};

const COMMAND_QUEUE_CAPACITY: usize = 32;
const MIX_SCHEDULER_QUEUE_CAPACITY: usize = 8;
const BINDING_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct SinkSpec {
    pub channels: u16,
    pub bit_depth: u16,
    pub sample_rate: u32,
    pub chunk_frames: usize,
    pub synchronized: bool,
}

struct SinkEntry {
    scheduler: Arc<MixScheduler>,
    mixer: Arc<SinkMixer>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct BindingEntry {
    cursor: CursorHandle,
    command_queue: BoundedQueue<IpCommand>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

pub struct AudioManager {
    config: AudioEngineConfig,
    tsm: Arc<TimeShiftManager>,
    clock_manager: Arc<ClockManager>,
    sync_clocks: Mutex<HashMap<u32, Arc<GlobalSynchronizationClock>>>,
    sinks: Mutex<HashMap<String, SinkEntry>>,
    bindings: Mutex<HashMap<(String, String), BindingEntry>>,
}

impl AudioManager {
    pub fn new(config: AudioEngineConfig) -> Self {
        let tsm = Arc::new(TimeShiftManager::new(config.timeshift.timeshift_buffer_seconds));
        Self {
            clock_manager: Arc::new(ClockManager::new()),
            tsm,
            sync_clocks: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn sync_clock_for_rate(&self, rate: u32) -> Arc<GlobalSynchronizationClock> {
        self.sync_clocks
            .lock()
            .entry(rate)
            .or_insert_with(|| Arc::new(GlobalSynchronizationClock::new(rate, self.config.sync_tuning.clone())))
            .clone()
    }

    /// Feed one decoded packet into the shared time-shift ring. Cheap and
    /// non-blocking; callers are the protocol receivers, out of scope here.
    pub fn push_packet(&self, packet: TaggedAudioPacket) {
        if !packet.is_well_formed() {
            warn!(source = %packet.source_tag, "dropping malformed packet");
            return;
        }
        self.tsm.push_packet(packet);
    }

    pub fn add_sink(&self, sink_id: &str, spec: SinkSpec) -> Result<()> {
        let mut sinks = self.sinks.lock();
        if sinks.contains_key(sink_id) {
            return Err(Error::other(format!("sink {sink_id} already exists")));
        }

        let scheduler = Arc::new(MixScheduler::new(MIX_SCHEDULER_QUEUE_CAPACITY));
        let clock_key = ClockKey {
            rate: spec.sample_rate,
            channels: spec.channels,
            bit_depth: spec.bit_depth,
        };
        let chunk_size_bytes = spec.chunk_frames * spec.channels as usize * (spec.bit_depth as usize / 8);
        let condition = self.clock_manager.condition_for(clock_key, chunk_size_bytes);

        let mut mixer = SinkMixer::new(
            sink_id.to_string(),
            spec.channels,
            spec.bit_depth,
            spec.sample_rate,
            spec.chunk_frames,
            self.config.mixer_tuning.clone(),
            self.config.profiler.clone(),
            self.config.telemetry.clone(),
            scheduler.clone(),
            condition,
        );

        if spec.synchronized {
            let sync_clock = self.sync_clock_for_rate(spec.sample_rate);
            let timeout = Duration::from_millis(self.config.sync_tuning.barrier_timeout_ms);
            let mut coordinator = SinkCoordinator::new(sink_id.to_string(), sync_clock, timeout);
            coordinator.set_enabled(true);
            mixer.set_coordinator(coordinator);
        }

        let mixer = Arc::new(mixer);
        let running = Arc::new(AtomicBool::new(true));
        let thread = spawn_mixer_thread(mixer.clone(), running.clone());

        sinks.insert(
            sink_id.to_string(),
            SinkEntry {
                scheduler,
                mixer,
                running,
                thread: Some(thread),
            },
        );
        info!(sink = %sink_id, "sink added");
        Ok(())
    }

    pub fn remove_sink(&self, sink_id: &str) -> Result<()> {
        let entry = self
            .sinks
            .lock()
            .remove(sink_id)
            .ok_or_else(|| Error::UnknownSink(sink_id.to_string()))?;
        stop_entry(entry.running, entry.thread);
        info!(sink = %sink_id, "sink removed");
        Ok(())
    }

    /// Stores `sender` on the sink's mixer, calling its `setup()` here at a
    /// point known safe from host reentrancy (outside the mixer's own tick
    /// thread and any caller-held lock).
    pub fn add_listener(&self, sink_id: &str, mut sender: Box<dyn Sender>) -> Result<()> {
        let sinks = self.sinks.lock();
        let entry = sinks.get(sink_id).ok_or_else(|| Error::UnknownSink(sink_id.to_string()))?;
        if let Err(e) = sender.setup() {
            warn!(sink = %sink_id, error = %e, "listener setup failed, not attaching");
            return Err(e);
        }
        entry.mixer.add_sender(sender);
        Ok(())
    }

    /// Bind a source to a sink: attach a TSM cursor, spin up an Input Processor
    /// for the declared input format, and start the worker thread that pumps
    /// cursor -> processor -> scheduler.
    pub fn connect(
        &self,
        source_tag: &str,
        sink_id: &str,
        input_channels: u16,
        input_bit_depth: u16,
        input_sample_rate: u32,
        initial_volume: f32,
    ) -> Result<()> {
        let key = (source_tag.to_string(), sink_id.to_string());
        if self.bindings.lock().contains_key(&key) {
            return Err(Error::BindingAlreadyExists {
                source_tag: source_tag.to_string(),
                sink_id: sink_id.to_string(),
            });
        }

        let (scheduler, mixer, sample_rate, channels) = {
            let sinks = self.sinks.lock();
            let entry = sinks.get(sink_id).ok_or_else(|| Error::UnknownSink(sink_id.to_string()))?;
            (entry.scheduler.clone(), entry.mixer.clone(), entry.mixer.sample_rate(), entry.mixer.channels())
        };

        let cursor = self.tsm.attach(source_tag, sink_id);
        let input_handle = scheduler.attach_source(source_tag.to_string());
        let command_queue = BoundedQueue::new(COMMAND_QUEUE_CAPACITY);
        mixer.register_source_command_queue(source_tag.to_string(), command_queue.clone());

        let processor = InputProcessor::new(
            input_channels,
            channels,
            input_bit_depth,
            input_sample_rate,
            sample_rate,
            initial_volume,
            self.config.processor_tuning.clone(),
        );

        let running = Arc::new(AtomicBool::new(true));
        let thread = spawn_binding_thread(
            self.tsm.clone(),
            cursor,
            processor,
            input_handle,
            command_queue.clone(),
            running.clone(),
        );

        self.bindings.lock().insert(
            key,
            BindingEntry {
                cursor,
                command_queue,
                running,
                thread: Some(thread),
            },
        );
        info!(source = %source_tag, sink = %sink_id, "binding connected");
        Ok(())
    }

    pub fn disconnect(&self, source_tag: &str, sink_id: &str) -> Result<()> {
        let key = (source_tag.to_string(), sink_id.to_string());
        let entry = self
            .bindings
            .lock()
            .remove(&key)
            .ok_or_else(|| Error::NoSuchBinding {
                source_tag: source_tag.to_string(),
                sink_id: sink_id.to_string(),
            })?;

        self.tsm.detach(entry.cursor);
        entry.command_queue.close();
        stop_entry(entry.running, entry.thread);

        if let Some(sinks) = self.sinks.lock().get(sink_id) {
            sinks.scheduler.mark_closed(source_tag);
        }
        info!(source = %source_tag, sink = %sink_id, "binding disconnected");
        Ok(())
    }

    pub fn send_command(&self, source_tag: &str, sink_id: &str, cmd: IpCommand) -> Result<()> {
        let key = (source_tag.to_string(), sink_id.to_string());
        let bindings = self.bindings.lock();
        let entry = bindings.get(&key).ok_or_else(|| Error::NoSuchBinding {
            source_tag: source_tag.to_string(),
            sink_id: sink_id.to_string(),
        })?;

        match &cmd {
            IpCommand::SetDelayMs(ms) => self.tsm.set_delay_ms(entry.cursor, *ms),
            IpCommand::SetTimeshiftSec(sec) => self.tsm.set_timeshift_sec(entry.cursor, *sec),
            _ => {
                entry.command_queue.push_drop_oldest(cmd);
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let bindings: Vec<_> = self.bindings.lock().drain().collect();
        for (_, entry) in bindings {
            self.tsm.detach(entry.cursor);
            entry.command_queue.close();
            stop_entry(entry.running, entry.thread);
        }

        let sinks: Vec<_> = self.sinks.lock().drain().collect();
        for (_, entry) in sinks {
            stop_entry(entry.running, entry.thread);
        }

        self.clock_manager.shutdown();
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_entry(running: Arc<AtomicBool>, thread: Option<JoinHandle<()>>) {
    running.store(false, Ordering::SeqCst);
    if let Some(handle) = thread {
        let _ = handle.join();
    }
}

fn spawn_mixer_thread(mixer: Arc<SinkMixer>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sr-sink-mixer".into())
        .spawn(move || {
            let mut last_seq = 0u64;
            while running.load(Ordering::SeqCst) {
                mixer.run_one_tick(&mut last_seq);
            }
        })
        .expect("failed to spawn sink mixer thread")
}

fn spawn_binding_thread(
    tsm: Arc<TimeShiftManager>,
    cursor: CursorHandle,
    mut processor: InputProcessor,
    input_handle: crate::scheduler::SchedulerInputHandle,
    command_queue: BoundedQueue<IpCommand>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sr-input-processor".into())
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                while let Some(cmd) = command_queue.try_pop() {
                    processor.apply_command(cmd);
                }

                match tsm.next_chunk(cursor) {
                    Some(packet) => {
                        let chunk = processor.process(&packet);
                        input_handle.push(chunk);
                    }
                    None => thread::sleep(BINDING_POLL_INTERVAL),
                }
            }
        })
        .expect("failed to spawn input processor thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioEngineConfig;

    #[test]
    fn add_and_remove_sink_round_trips() {
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
        assert!(manager.remove_sink("sink1").is_ok());
        assert!(matches!(manager.remove_sink("sink1"), Err(Error::UnknownSink(_))));
    }

    #[test]
    fn connect_requires_existing_sink() {
        let manager = AudioManager::new(AudioEngineConfig::default());
        let result = manager.connect("src", "missing-sink", 2, 16, 48000, 1.0);
        assert!(matches!(result, Err(Error::UnknownSink(_))));
    }

    #[test]
    fn double_connect_is_rejected() {
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
        manager.connect("src", "sink1", 2, 16, 48000, 1.0).unwrap();
        let result = manager.connect("src", "sink1", 2, 16, 48000, 1.0);
        assert!(matches!(result, Err(Error::BindingAlreadyExists { .. })));
        manager.disconnect("src", "sink1").unwrap();
    }

    /// Randomized add_sink/connect/send_command/disconnect/remove_sink churn,
    /// varied across rate/bit_depth/channels, asserting no operation hangs and a
    /// final shutdown completes cleanly.
    #[test]
    fn lifecycle_stress_survives_randomized_churn() {
        let manager = AudioManager::new(AudioEngineConfig::default());
        let formats: &[(u32, u16, u16)] = &[(44100, 16, 2), (48000, 24, 2), (96000, 32, 1), (48000, 16, 6)];

        for i in 0..50u32 {
            let (rate, bit_depth, channels) = formats[(i as usize) % formats.len()];
            let sink_id = format!("sink-{}", i % 5);
            let source_tag = format!("src-{}", i % 7);

            let start = std::time::Instant::now();

            let _ = manager.add_sink(
                &sink_id,
                SinkSpec {
                    channels,
                    bit_depth,
                    sample_rate: rate,
                    chunk_frames: 288,
                    synchronized: i % 2 == 0,
                },
            );
            let _ = manager.connect(&source_tag, &sink_id, channels, bit_depth, rate, 0.8);
            let _ = manager.send_command(&source_tag, &sink_id, IpCommand::SetVolume(0.5));
            let _ = manager.send_command(&source_tag, &sink_id, IpCommand::SetDelayMs(20));
            if i % 3 == 0 {
                let _ = manager.disconnect(&source_tag, &sink_id);
            }
            if i % 4 == 0 {
                let _ = manager.remove_sink(&sink_id);
            }

            assert!(start.elapsed() < Duration::from_secs(5), "operation at iteration {i} exceeded timeout");
        }

        manager.shutdown();
    }

    struct FailingSender;

    impl Sender for FailingSender {
        fn setup(&mut self) -> Result<()> {
            Err(Error::SenderSetupFailed {
                sink_id: "sink1".into(),
                reason: "device busy".into(),
            })
        }
        fn close(&mut self) {}
        fn send_payload(&mut self, _payload: &[u8], _csrcs: &[u32]) {}
    }

    #[derive(Clone, Default)]
    struct CapturingWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl std::io::Write for CapturingWriter {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.buf.lock().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturingWriter {
        type Writer = CapturingWriter;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn listener_setup_failure_is_logged_at_warn() {
        use tracing_subscriber::fmt::format::FmtSpan;

        let writer = CapturingWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer.clone())
            .with_span_events(FmtSpan::NONE)
            .with_ansi(false)
            .finish();

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

        let result = tracing::subscriber::with_default(subscriber, || {
            manager.add_listener("sink1", Box::new(FailingSender))
        });
        assert!(result.is_err());

        let logged = String::from_utf8(writer.buf.lock().clone()).unwrap();
        assert!(logged.contains("WARN"));
        assert!(logged.contains("device busy"));
    }
}
