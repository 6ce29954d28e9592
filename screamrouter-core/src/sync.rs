//! Synchronization Coordinator / Global Sync Clock: one instance per distinct
//! sample rate, shared by every sink running at that rate. Provides a reusable
//! dispatch barrier and a secondary long-run drift correction on top of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::SyncTuning;

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub total_barrier_timeouts: u64,
    pub total_barriers_completed: u64,
}

struct SinkTimingInfo {
    total_samples_output: u64,
    last_rtp_ts: u32,
    last_report_time: Instant,
    accumulated_error_ema: f64,
    current_rate_adjustment: f64,
    active: bool,
}

struct Reference {
    rtp_ts0: u32,
    wall_t0: Instant,
}

struct Barrier {
    generation: u64,
    arrived_count: usize,
}

/// Per-rate-group coordination clock. Disabled until at least one sink opts in.
pub struct GlobalSynchronizationClock {
    sample_rate: u32,
    tuning: SyncTuning,
    enabled: AtomicBool,
    reference: Mutex<Option<Reference>>,
    sinks: Mutex<HashMap<String, SinkTimingInfo>>,
    barrier_mutex: Mutex<Barrier>,
    barrier_cv: Condvar,
    stats: Mutex<SyncStats>,
    total_arrived_target: AtomicU64,
}

impl GlobalSynchronizationClock {
    pub fn new(sample_rate: u32, tuning: SyncTuning) -> Self {
        Self {
            sample_rate,
            tuning,
            enabled: AtomicBool::new(false),
            reference: Mutex::new(None),
            sinks: Mutex::new(HashMap::new()),
            barrier_mutex: Mutex::new(Barrier {
                generation: 0,
                arrived_count: 0,
            }),
            barrier_cv: Condvar::new(),
            stats: Mutex::new(SyncStats::default()),
            total_arrived_target: AtomicU64::new(0),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn initialize_reference(&self, rtp_ts0: u32) {
        let mut reference = self.reference.lock().unwrap();
        if reference.is_none() {
            *reference = Some(Reference {
                rtp_ts0,
                wall_t0: Instant::now(),
            });
        }
    }

    pub fn current_playback_timestamp(&self) -> Option<f64> {
        let reference = self.reference.lock().unwrap();
        let r = reference.as_ref()?;
        let elapsed = r.wall_t0.elapsed().as_secs_f64();
        Some(r.rtp_ts0 as f64 + elapsed * self.sample_rate as f64)
    }

    pub fn register_sink(&self, sink_id: &str) {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.insert(
            sink_id.to_string(),
            SinkTimingInfo {
                total_samples_output: 0,
                last_rtp_ts: 0,
                last_report_time: Instant::now(),
                accumulated_error_ema: 0.0,
                current_rate_adjustment: 1.0,
                active: true,
            },
        );
        self.total_arrived_target.store(sinks.values().filter(|s| s.active).count() as u64, Ordering::SeqCst);
    }

    pub fn unregister_sink(&self, sink_id: &str) {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.remove(sink_id);
        self.total_arrived_target.store(sinks.values().filter(|s| s.active).count() as u64, Ordering::SeqCst);
    }

    pub fn report_sink_timing(&self, sink_id: &str, frames_dispatched: u64, last_rtp_ts: u32) {
        let mut sinks = self.sinks.lock().unwrap();
        if let Some(info) = sinks.get_mut(sink_id) {
            info.total_samples_output += frames_dispatched;
            info.last_rtp_ts = last_rtp_ts;
            info.last_report_time = Instant::now();
        }
    }

    /// `adj = clamp(1 + ema/sample_rate * K_p, 1 - max_adj, 1 + max_adj)`, where
    /// `ema` is the 0.9/0.1-smoothed expected-vs-actual sample error.
    pub fn calculate_rate_adjustment(&self, sink_id: &str) -> f64 {
        let reference = self.reference.lock().unwrap();
        let Some(r) = reference.as_ref() else {
            return 1.0;
        };
        let mut sinks = self.sinks.lock().unwrap();
        let Some(info) = sinks.get_mut(sink_id) else {
            return 1.0;
        };

        let elapsed = r.wall_t0.elapsed().as_secs_f64();
        let expected = r.rtp_ts0 as f64 + elapsed * self.sample_rate as f64;
        let actual = info.total_samples_output as f64;
        let err = expected - actual;

        info.accumulated_error_ema = 0.9 * info.accumulated_error_ema + 0.1 * err;

        let raw_adj = 1.0 + (info.accumulated_error_ema / self.sample_rate as f64) * self.tuning.proportional_gain;
        let adj = raw_adj.clamp(1.0 - self.tuning.max_rate_adjustment, 1.0 + self.tuning.max_rate_adjustment);
        info.current_rate_adjustment = adj;
        adj
    }

    /// Each participant blocks here until every active sink at this rate has
    /// arrived, or `timeout` elapses. Returns `false` (and counts a timeout) if it
    /// had to give up rather than synchronize — callers proceed regardless.
    pub fn wait_for_dispatch_barrier(&self, timeout: Duration) -> bool {
        let target = self.total_arrived_target.load(Ordering::SeqCst).max(1) as usize;
        if target <= 1 {
            return true;
        }

        let mut barrier = self.barrier_mutex.lock().unwrap();
        let my_generation = barrier.generation;
        barrier.arrived_count += 1;

        if barrier.arrived_count >= target {
            barrier.generation += 1;
            barrier.arrived_count = 0;
            self.barrier_cv.notify_all();
            self.stats.lock().unwrap().total_barriers_completed += 1;
            return true;
        }

        let (guard, timeout_result) = self
            .barrier_cv
            .wait_timeout_while(barrier, timeout, |b| b.generation == my_generation)
            .unwrap();
        drop(guard);

        if timeout_result.timed_out() {
            self.stats.lock().unwrap().total_barrier_timeouts += 1;
            false
        } else {
            true
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Per-sink wrapper around the mixer<->clock interaction: registers/unregisters
/// on enable/disable and skips the barrier entirely when coordination is off.
pub struct SinkCoordinator {
    sink_id: String,
    clock: std::sync::Arc<GlobalSynchronizationClock>,
    enabled: bool,
    timeout: Duration,
}

impl SinkCoordinator {
    pub fn new(sink_id: String, clock: std::sync::Arc<GlobalSynchronizationClock>, timeout: Duration) -> Self {
        Self {
            sink_id,
            clock,
            enabled: false,
            timeout,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.clock.register_sink(&self.sink_id);
            self.clock.set_enabled(true);
        } else if !enabled && self.enabled {
            self.clock.unregister_sink(&self.sink_id);
        }
        self.enabled = enabled;
    }

    /// Returns `false` (skip the barrier) if coordination is disabled.
    pub fn begin_dispatch(&self) -> bool {
        if !self.enabled || !self.clock.is_enabled() {
            return false;
        }
        self.clock.wait_for_dispatch_barrier(self.timeout)
    }

    pub fn report_dispatch(&self, frames_dispatched: u64, last_rtp_ts: u32) {
        if self.enabled {
            self.clock.report_sink_timing(&self.sink_id, frames_dispatched, last_rtp_ts);
        }
    }

    pub fn rate_adjustment(&self) -> f64 {
        if self.enabled {
            self.clock.calculate_rate_adjustment(&self.sink_id)
        } else {
            1.0
        }
    }
}
