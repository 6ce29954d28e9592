//! Mix Scheduler: per-sink collection of per-source ready queues. Each Input
//! Processor pushes its processed chunks into its own queue; once per mix tick
//! the sink harvests the head of every non-empty queue.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::packet::ProcessedAudioChunk;
use crate::queue::{BoundedQueue, PushOutcome};

/// Stable identity of one source's binding to this sink (usually `source_tag`).
pub type SourceId = String;

#[derive(Debug, Default, Clone)]
pub struct SourceQueueStats {
    pub received: u64,
    pub popped: u64,
    pub dropped: u64,
}

struct SourceSlot {
    queue: BoundedQueue<(Instant, ProcessedAudioChunk)>,
    stats: Mutex<SourceQueueStats>,
    closed: std::sync::atomic::AtomicBool,
}

/// Result of one `collect_ready_chunks` call.
pub struct Harvest {
    pub ready_chunks: HashMap<SourceId, ProcessedAudioChunk>,
    pub drained_sources: Vec<SourceId>,
}

/// Producer-side handle an Input Processor uses to deliver chunks without ever
/// seeing the scheduler itself.
#[derive(Clone)]
pub struct SchedulerInputHandle {
    queue: BoundedQueue<(Instant, ProcessedAudioChunk)>,
}

impl SchedulerInputHandle {
    pub fn push(&self, chunk: ProcessedAudioChunk) -> PushOutcome {
        self.queue.push_drop_oldest((Instant::now(), chunk))
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

pub struct MixScheduler {
    ready_queue_capacity: usize,
    sources: Mutex<HashMap<SourceId, SourceSlot>>,
}

impl MixScheduler {
    pub fn new(ready_queue_capacity: usize) -> Self {
        Self {
            ready_queue_capacity,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Register a source, returning the producer handle its Input Processor holds.
    pub fn attach_source(&self, id: SourceId) -> SchedulerInputHandle {
        let queue = BoundedQueue::new(self.ready_queue_capacity);
        let handle = SchedulerInputHandle {
            queue: queue.clone(),
        };
        self.sources.lock().insert(
            id,
            SourceSlot {
                queue,
                stats: Mutex::new(SourceQueueStats::default()),
                closed: std::sync::atomic::AtomicBool::new(false),
            },
        );
        handle
    }

    pub fn detach_source(&self, id: &str) {
        self.sources.lock().remove(id);
    }

    pub fn mark_closed(&self, id: &str) {
        if let Some(slot) = self.sources.lock().get(id) {
            slot.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            slot.queue.close();
        }
    }

    pub fn stats_for(&self, id: &str) -> Option<SourceQueueStats> {
        self.sources.lock().get(id).map(|s| s.stats.lock().clone())
    }

    /// Atomically pop the head chunk from each non-empty source queue.
    pub fn collect_ready_chunks(&self) -> Harvest {
        let sources = self.sources.lock();
        let mut ready_chunks = HashMap::new();
        let mut drained_sources = Vec::new();

        for (id, slot) in sources.iter() {
            match slot.queue.try_pop() {
                Some((_, chunk)) => {
                    let mut stats = slot.stats.lock();
                    stats.popped += 1;
                    ready_chunks.insert(id.clone(), chunk);
                }
                None => {
                    let is_closed = slot.closed.load(std::sync::atomic::Ordering::SeqCst);
                    if is_closed && slot.queue.is_empty() {
                        drained_sources.push(id.clone());
                    }
                }
            }
        }

        Harvest {
            ready_chunks,
            drained_sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn chunk(val: i32) -> ProcessedAudioChunk {
        ProcessedAudioChunk {
            samples: vec![val; 4],
            channels: 2,
            sample_rate: 48000,
            ssrcs: vec![1],
            produced_time: StdInstant::now(),
            rtp_timestamp: None,
        }
    }

    #[test]
    fn harvest_pops_one_chunk_per_source() {
        let sched = MixScheduler::new(4);
        let a = sched.attach_source("a".into());
        let b = sched.attach_source("b".into());
        a.push(chunk(1));
        b.push(chunk(2));

        let harvest = sched.collect_ready_chunks();
        assert_eq!(harvest.ready_chunks.len(), 2);
        assert!(harvest.drained_sources.is_empty());
    }

    #[test]
    fn drained_source_is_reported_once_empty_and_closed() {
        let sched = MixScheduler::new(4);
        let a = sched.attach_source("a".into());
        a.push(chunk(1));
        sched.collect_ready_chunks();
        sched.mark_closed("a");

        let harvest = sched.collect_ready_chunks();
        assert_eq!(harvest.drained_sources, vec!["a".to_string()]);
    }

    #[test]
    fn ordering_preserved_per_source() {
        let sched = MixScheduler::new(8);
        let a = sched.attach_source("a".into());
        for i in 0..5 {
            a.push(chunk(i));
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            let harvest = sched.collect_ready_chunks();
            if let Some(c) = harvest.ready_chunks.get("a") {
                seen.push(c.samples[0]);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
