//! Time-Shift Manager: one process-wide instance owning a bounded, arrival-ordered
//! ring per observed source tag, with per-binding read cursors that can each look
//! at a different point in the past (delay + timeshift).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::packet::TaggedAudioPacket;

/// Nominal packet rate assumed when sizing a ring purely from a configured
/// duration (actual packet cadence varies by source format).
const ASSUMED_PACKETS_PER_SECOND: f32 = 200.0;
const MIN_RING_CAPACITY: usize = 16;

struct RingEntry {
    seq: u64,
    packet: Arc<TaggedAudioPacket>,
}

struct SourceRing {
    entries: VecDeque<RingEntry>,
    capacity: usize,
    next_seq: u64,
    highest_ssrc: Option<u32>,
    last_arrival: Option<Instant>,
}

impl SourceRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(MIN_RING_CAPACITY),
            next_seq: 0,
            highest_ssrc: None,
            last_arrival: None,
        }
    }

    fn push(&mut self, packet: TaggedAudioPacket) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.last_arrival = Some(packet.received_time);
        if let Some(&ssrc) = packet.ssrcs.first() {
            self.highest_ssrc = Some(self.highest_ssrc.map_or(ssrc, |h| h.max(ssrc)));
        }
        self.entries.push_back(RingEntry {
            seq,
            packet: Arc::new(packet),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq)
    }

    fn get(&self, seq: u64) -> Option<&RingEntry> {
        let oldest = self.oldest_seq()?;
        if seq < oldest {
            return None;
        }
        let idx = (seq - oldest) as usize;
        self.entries.get(idx)
    }
}

/// Statistics for one binding cursor's progress through its source's ring.
#[derive(Debug, Default, Clone)]
pub struct CursorStats {
    pub chunks_delivered: u64,
    pub reanchor_events: u64,
}

/// A registered binding's read position into its source's ring.
pub struct BindingCursor {
    source_tag: String,
    sink_id: String,
    delay_ms: u64,
    timeshift_sec: f64,
    last_returned_seq: Option<u64>,
    stats: CursorStats,
}

impl BindingCursor {
    pub fn set_delay_ms(&mut self, ms: u64) {
        self.delay_ms = ms;
    }

    pub fn set_timeshift_sec(&mut self, sec: f64) {
        self.timeshift_sec = sec;
    }

    pub fn stats(&self) -> &CursorStats {
        &self.stats
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    pub fn sink_id(&self) -> &str {
        &self.sink_id
    }
}

/// Opaque handle returned by `attach`, used for all subsequent cursor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle(u64);

pub struct TimeShiftManager {
    rings: Mutex<HashMap<String, SourceRing>>,
    cursors: Mutex<HashMap<CursorHandle, BindingCursor>>,
    next_handle: std::sync::atomic::AtomicU64,
    timeshift_buffer_seconds: f32,
}

impl TimeShiftManager {
    pub fn new(timeshift_buffer_seconds: f32) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            next_handle: std::sync::atomic::AtomicU64::new(0),
            timeshift_buffer_seconds,
        }
    }

    fn ring_capacity(&self) -> usize {
        ((self.timeshift_buffer_seconds * ASSUMED_PACKETS_PER_SECOND) as usize).max(MIN_RING_CAPACITY)
    }

    /// Append a packet to its source's ring, creating the ring on first sight of a tag.
    pub fn push_packet(&self, packet: TaggedAudioPacket) {
        let mut rings = self.rings.lock();
        let capacity = self.ring_capacity();
        rings
            .entry(packet.source_tag.clone())
            .or_insert_with(|| SourceRing::new(capacity))
            .push(packet);
    }

    pub fn attach(&self, source_tag: &str, sink_id: &str) -> CursorHandle {
        let handle = CursorHandle(self.next_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        self.cursors.lock().insert(
            handle,
            BindingCursor {
                source_tag: source_tag.to_string(),
                sink_id: sink_id.to_string(),
                delay_ms: 0,
                timeshift_sec: 0.0,
                last_returned_seq: None,
                stats: CursorStats::default(),
            },
        );
        handle
    }

    pub fn detach(&self, handle: CursorHandle) {
        self.cursors.lock().remove(&handle);
    }

    pub fn set_delay_ms(&self, handle: CursorHandle, ms: u64) {
        if let Some(cursor) = self.cursors.lock().get_mut(&handle) {
            cursor.set_delay_ms(ms);
        }
    }

    pub fn set_timeshift_sec(&self, handle: CursorHandle, sec: f64) {
        if let Some(cursor) = self.cursors.lock().get_mut(&handle) {
            cursor.set_timeshift_sec(sec);
        }
    }

    pub fn cursor_stats(&self, handle: CursorHandle) -> Option<CursorStats> {
        self.cursors.lock().get(&handle).map(|c| c.stats.clone())
    }

    /// Pull the next in-order packet for a cursor whose target wall-clock has arrived,
    /// re-anchoring to the oldest surviving packet (and counting an underrun) if the
    /// cursor fell behind the ring's eviction point.
    pub fn next_chunk(&self, handle: CursorHandle) -> Option<Arc<TaggedAudioPacket>> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(&handle)?;
        let rings = self.rings.lock();
        let ring = rings.get(&cursor.source_tag)?;

        let oldest = ring.oldest_seq()?;
        let mut candidate = cursor.last_returned_seq.map(|s| s + 1).unwrap_or(oldest);
        if candidate < oldest {
            candidate = oldest;
            cursor.stats.reanchor_events += 1;
            tracing::debug!(
                source_tag = %cursor.source_tag,
                sink_id = %cursor.sink_id,
                "binding cursor fell behind ring eviction, re-anchoring to oldest packet"
            );
        }

        let entry = ring.get(candidate)?;
        let target = Instant::now()
            .checked_sub(Duration::from_millis(cursor.delay_ms))
            .unwrap_or_else(Instant::now);
        let target = if cursor.timeshift_sec >= 0.0 {
            target
                .checked_sub(Duration::from_secs_f64(cursor.timeshift_sec))
                .unwrap_or(target)
        } else {
            target + Duration::from_secs_f64(-cursor.timeshift_sec)
        };

        if entry.packet.received_time <= target {
            cursor.last_returned_seq = Some(entry.seq);
            cursor.stats.chunks_delivered += 1;
            Some(entry.packet.clone())
        } else {
            None
        }
    }
}
