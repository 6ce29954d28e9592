//! Clock Manager: publishes periodic "mix tick" conditions keyed by
//! `(rate, channels, bit_depth)`, either driven by its own software timer or
//! handed off to a hardware clock consumer (e.g. the local playback sender's
//! own write loop).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifies one mix-tick cadence. Sinks sharing `(rate, channels, bit_depth)`
/// share a single timer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockKey {
    pub rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Shared tick counter a condition's waiters poll against.
pub struct ClockCondition {
    sequence: AtomicU64,
    mutex: Mutex<()>,
    cv: Condvar,
    claimed_by_hardware: AtomicBool,
    stopping: AtomicBool,
}

impl ClockCondition {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sequence: AtomicU64::new(0),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            claimed_by_hardware: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    fn tick(&self) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        let _guard = self.mutex.lock().unwrap();
        self.cv.notify_all();
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Block until `sequence` advances past `last_seen`, or shutdown is signaled.
    /// Returns the new sequence (unchanged from `last_seen` only on shutdown).
    pub fn wait_for_tick(&self, last_seen: u64) -> u64 {
        let mut guard = self.mutex.lock().unwrap();
        while self.sequence.load(Ordering::SeqCst) == last_seen && !self.stopping.load(Ordering::SeqCst) {
            guard = self.cv.wait_timeout(guard, Duration::from_millis(500)).unwrap().0;
        }
        self.sequence.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _guard = self.mutex.lock().unwrap();
        self.cv.notify_all();
    }
}

/// Hardware-driven tick source: a local-playback sender's own write loop claims
/// the condition for its format and advances it instead of the software timer.
pub trait HardwareClockConsumer: Send + Sync {
    /// Called by the Clock Manager once after the condition is claimed.
    fn on_claimed(&self) {}
}

struct ActiveCondition {
    condition: Arc<ClockCondition>,
    period: Duration,
    timer_thread: Option<JoinHandle<()>>,
    timer_running: Arc<AtomicBool>,
}

/// Computes the period of one mix tick from the chunk byte size and output format.
pub fn tick_period(chunk_size_bytes: usize, rate: u32, channels: u16, bit_depth: u16) -> Duration {
    let bytes_per_frame = (bit_depth as usize / 8) * channels as usize;
    let frames = chunk_size_bytes / bytes_per_frame.max(1);
    Duration::from_secs_f64(frames as f64 / rate as f64)
}

pub struct ClockManager {
    conditions: Mutex<HashMap<ClockKey, ActiveCondition>>,
}

impl Default for ClockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockManager {
    pub fn new() -> Self {
        Self {
            conditions: Mutex::new(HashMap::new()),
        }
    }

    /// Get (creating if necessary) the condition for a `(rate, channels, bit_depth)`
    /// tuple, starting its software timer unless a hardware consumer has already
    /// claimed it.
    pub fn condition_for(&self, key: ClockKey, chunk_size_bytes: usize) -> Arc<ClockCondition> {
        let mut conditions = self.conditions.lock().unwrap();
        let entry = conditions.entry(key).or_insert_with(|| {
            let condition = ClockCondition::new();
            let period = tick_period(chunk_size_bytes, key.rate, key.channels, key.bit_depth);
            let running = Arc::new(AtomicBool::new(true));
            let thread = spawn_software_timer(condition.clone(), period, running.clone());
            ActiveCondition {
                condition,
                period,
                timer_thread: Some(thread),
                timer_running: running,
            }
        });
        entry.condition.clone()
    }

    /// Claim a condition for a hardware clock consumer, suspending the software timer.
    pub fn claim_for_hardware(&self, key: ClockKey) -> Option<Arc<ClockCondition>> {
        let mut conditions = self.conditions.lock().unwrap();
        let entry = conditions.get_mut(&key)?;
        entry.condition.claimed_by_hardware.store(true, Ordering::SeqCst);
        entry.timer_running.store(false, Ordering::SeqCst);
        if let Some(handle) = entry.timer_thread.take() {
            let _ = handle.join();
        }
        tracing::debug!(rate = key.rate, channels = key.channels, bit_depth = key.bit_depth, "clock condition claimed by hardware consumer, software timer stopped");
        Some(entry.condition.clone())
    }

    /// Called by the hardware consumer each time it completes one period of I/O.
    pub fn hardware_tick(&self, key: ClockKey) {
        if let Some(entry) = self.conditions.lock().unwrap().get(&key) {
            entry.condition.tick();
        }
    }

    pub fn shutdown(&self) {
        let mut conditions = self.conditions.lock().unwrap();
        for (_, mut entry) in conditions.drain() {
            entry.timer_running.store(false, Ordering::SeqCst);
            entry.condition.shutdown();
            if let Some(handle) = entry.timer_thread.take() {
                let _ = handle.join();
            }
        }
    }
}

fn spawn_software_timer(
    condition: Arc<ClockCondition>,
    period: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sr-clock-timer".into())
        .spawn(move || {
            let mut next_tick = Instant::now();
            while running.load(Ordering::SeqCst) {
                next_tick += period;
                let now = Instant::now();
                if next_tick > now {
                    thread::sleep(next_tick - now);
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                condition.tick();

                let now = Instant::now();
                if now > next_tick + period * 2 {
                    tracing::debug!(?period, "clock timer fell behind by more than 2 periods, catching up");
                    next_tick = now;
                }
            }
        })
        .expect("failed to spawn clock timer thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_matches_expected_6ms() {
        let period = tick_period(1152, 48000, 2, 16);
        let expected = Duration::from_secs_f64(1152.0 / (2.0 * 2.0) / 48000.0);
        assert!((period.as_secs_f64() - expected.as_secs_f64()).abs() < 0.0001);
    }

    #[test]
    fn condition_advances_over_real_time() {
        let mgr = ClockManager::new();
        let key = ClockKey {
            rate: 48000,
            channels: 2,
            bit_depth: 16,
        };
        let condition = mgr.condition_for(key, 1152);
        let start = condition.sequence();
        let new_seq = condition.wait_for_tick(start);
        assert!(new_seq > start);
        mgr.shutdown();
    }
}
