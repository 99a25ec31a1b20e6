//! BUF — per-thread event buffers (spec §4.6): an allocator hook records
//! an event in single-digit microseconds without contending with any
//! other thread but the drain thread at rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const SEGMENT_CAPACITY_BYTES: usize = 64 * 1024;
const DEFAULT_POOL_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Alloc {
        address: u64,
        size: u64,
        type_tag: u32,
        flags: u32,
        stack_hash: u64,
        /// Present only the first time this thread has seen `stack_hash`
        /// (spec §4.8 step 7, "store frames inline only if the hash is new
        /// to this thread's local seen-hashes set").
        stack_frames: Option<Vec<u64>>,
    },
    Free {
        address: u64,
        flags: u32,
    },
    UpdateType {
        address: u64,
        new_type_tag: u32,
    },
    StackProbe {
        stack_hash: u64,
        stack_frames: Vec<u64>,
    },
}

/// A contiguous per-thread region holding a sequence of [`EventRecord`]s
/// (spec §4.6). Owned by one producing thread at a time; a single-byte
/// CAS lock guards in-place compaction against the drain thread, which
/// only ever takes a whole segment, never touches an open one.
pub struct EventBufferSegment {
    pub producing_thread: u32,
    records: Vec<EventRecord>,
    locked: AtomicBool,
}

impl EventBufferSegment {
    pub fn new(producing_thread: u32) -> Self {
        EventBufferSegment {
            producing_thread,
            records: Vec::new(),
            locked: AtomicBool::new(false),
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Approximate worst-case bytes an `EventRecord` occupies, used to
    /// decide whether a segment has room before appending (spec §4.6
    /// "if the remaining capacity is insufficient... acquire a new
    /// segment").
    fn worst_case_size(record: &EventRecord) -> usize {
        match record {
            EventRecord::Alloc { stack_frames, .. } => {
                32 + stack_frames.as_ref().map_or(0, |f| f.len() * 8)
            }
            EventRecord::Free { .. } => 16,
            EventRecord::UpdateType { .. } => 16,
            EventRecord::StackProbe { stack_frames, .. } => 16 + stack_frames.len() * 8,
        }
    }

    fn used_bytes(&self) -> usize {
        self.records.iter().map(Self::worst_case_size).sum()
    }

    /// Returns `false` (caller must rotate to a fresh segment) if the
    /// record would not fit.
    pub fn enqueue(&mut self, record: EventRecord) -> bool {
        if !self.try_lock() {
            // Contention only happens against the drain thread claiming a
            // full segment for handoff; that caller never holds the lock
            // long, but a producer never blocks on it either (spec §4.6).
            return false;
        }
        let fits = self.used_bytes() + Self::worst_case_size(&record) <= SEGMENT_CAPACITY_BYTES;
        if fits {
            self.compact_before_append(&record);
            self.records.push(record);
        }
        self.unlock();
        fits
    }

    /// Compaction optimization (spec §4.6): a Free immediately following
    /// an Alloc at the same address on the same segment elides both.
    fn compact_before_append(&mut self, incoming: &EventRecord) {
        let EventRecord::Free { address: free_addr, .. } = incoming else {
            return;
        };
        if let Some(EventRecord::Alloc { address, .. }) = self.records.last() {
            if address == free_addr {
                self.records.pop();
            }
        }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn reset(&mut self, new_owner: u32) {
        self.records.clear();
        self.producing_thread = new_owner;
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drain-side second compaction pass (spec §4.8 step 1, "compact it
    /// — collapse adjacent paired rules a second time, in case events
    /// straddled a rotation").
    pub fn compact(&mut self) {
        let mut out: Vec<EventRecord> = Vec::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if let EventRecord::Free { address, .. } = &record {
                if let Some(EventRecord::Alloc { address: alloc_addr, .. }) = out.last() {
                    if alloc_addr == address {
                        out.pop();
                        continue;
                    }
                }
            }
            out.push(record);
        }
        self.records = out;
    }
}

/// A FIFO queue of segments handed from producers to the drain thread
/// (spec §4.6 "Handoff"), protected by a short mutex contended only
/// between producer-at-rotate and drainer-at-claim-all.
#[derive(Default)]
pub struct HandoffQueue {
    inner: Mutex<Vec<EventBufferSegment>>,
}

impl HandoffQueue {
    pub fn new() -> Self {
        HandoffQueue::default()
    }

    pub fn push(&self, segment: EventBufferSegment) {
        self.inner.lock().unwrap().push(segment);
    }

    /// Atomically takes every pending segment (spec §4.8 step 1, "dequeue
    /// all pending segments — single atomic list-swap").
    pub fn drain_all(&self) -> Vec<EventBufferSegment> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A small pool of pre-allocated, recycled segments (spec §4.6 "Pool
/// discipline"): lazily grown up to `max_size`, segments returned after
/// drain are reset and reused rather than freed.
pub struct SegmentPool {
    free: Mutex<Vec<EventBufferSegment>>,
    max_size: usize,
}

impl SegmentPool {
    pub fn new(max_size: usize) -> Self {
        SegmentPool {
            free: Mutex::new(Vec::new()),
            max_size,
        }
    }

    pub fn acquire(&self, owner: u32) -> EventBufferSegment {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut segment) => {
                segment.reset(owner);
                segment
            }
            None => EventBufferSegment::new(owner),
        }
    }

    pub fn release(&self, mut segment: EventBufferSegment) {
        segment.records.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_size {
            free.push(segment);
        }
    }

    pub fn pooled_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        SegmentPool::new(DEFAULT_POOL_SIZE)
    }
}
