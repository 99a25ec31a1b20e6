//! RING — bounded ring buffer of sampled stacks and Point-Stack selection
//! (spec §3/§4.3).

use crate::stack::StackSample;
use rustc_hash::FxHashMap;
use std::sync::Mutex;

struct Slot {
    sample: StackSample,
    /// Count of consecutive samples (ending at this slot) sharing this
    /// slot's top-of-stack address.
    consecutive_top_repeats: u32,
}

struct RingInner {
    slots: Vec<Slot>,
    capacity: usize,
    next_write: usize,
    len: usize,
}

/// The sampled-stack ring described in spec §3/§4.3. Guarded by a single
/// mutex (spec §4.3 "Thread safety"): the sampler thread inserts, the dump
/// path reads; both operations are `O(capacity * max_depth)` with small
/// constants so contention is brief.
pub struct Ring {
    inner: Mutex<RingInner>,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Ring {
            inner: Mutex::new(RingInner {
                slots: Vec::with_capacity(capacity),
                capacity: capacity.max(1),
                next_write: 0,
                len: 0,
            }),
        }
    }

    /// Reallocates the ring to a new capacity (spec §4.4: threshold
    /// changes resize the ring). Drops existing samples — a capacity
    /// change only happens between stalls, not mid-window.
    pub fn resize(&self, new_capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.clear();
        inner.capacity = new_capacity.max(1);
        inner.next_write = 0;
        inner.len = 0;
    }

    /// Inserts a newly captured sample, overwriting the oldest slot once
    /// full, and updates the consecutive-top-repeat counter.
    pub fn push(&self, sample: StackSample) {
        let mut inner = self.inner.lock().unwrap();
        let top = sample.top();
        let prev_repeats = if inner.len == 0 {
            0
        } else {
            let prev_index = (inner.next_write + inner.capacity - 1) % inner.capacity;
            inner.slots.get(prev_index).map_or(0, |prev| {
                if prev.sample.top() == top {
                    prev.consecutive_top_repeats
                } else {
                    0
                }
            })
        };
        let slot = Slot {
            sample,
            consecutive_top_repeats: prev_repeats + 1,
        };
        let write_index = inner.next_write;
        if write_index < inner.slots.len() {
            inner.slots[write_index] = slot;
        } else {
            inner.slots.push(slot);
        }
        let capacity = inner.capacity;
        inner.next_write = (write_index + 1) % capacity;
        inner.len = (inner.len + 1).min(capacity);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selects the Point-Stack (spec §4.3): the slot with the maximum
    /// consecutive-top-repeat count, ties broken toward the most recent
    /// slot. For each of its frame addresses, counts how many of all valid
    /// slots (not necessarily consecutively) contain that address anywhere
    /// in their frame list.
    pub fn point_stack(&self) -> Option<PointStack> {
        let inner = self.inner.lock().unwrap();
        if inner.len == 0 {
            return None;
        }

        // Iterate slots oldest-to-newest so that, among ties, the slot
        // visited last (i.e. most recent) wins via `>=`.
        let start = if inner.len < inner.capacity {
            0
        } else {
            inner.next_write
        };
        let mut best_index = start;
        let mut best_repeats = 0u32;
        for i in 0..inner.len {
            let idx = (start + i) % inner.capacity;
            let repeats = inner.slots[idx].consecutive_top_repeats;
            if repeats >= best_repeats {
                best_repeats = repeats;
                best_index = idx;
            }
        }

        let point = &inner.slots[best_index].sample;
        let mut per_frame_counts: FxHashMap<u64, u32> = FxHashMap::default();
        for addr in point.addresses() {
            per_frame_counts.entry(*addr).or_insert(0);
        }
        // Count distinct slots containing the address, not occurrences —
        // a recursive frame repeated within one sample's frame list must
        // not inflate its count past the number of samples it appears in.
        let mut seen_in_slot: rustc_hash::FxHashSet<u64> = rustc_hash::FxHashSet::default();
        for i in 0..inner.len {
            let idx = (start + i) % inner.capacity;
            seen_in_slot.clear();
            for addr in inner.slots[idx].sample.addresses() {
                if per_frame_counts.contains_key(addr) && seen_in_slot.insert(*addr) {
                    *per_frame_counts.get_mut(addr).unwrap() += 1;
                }
            }
        }

        let frame_counts = point
            .addresses()
            .iter()
            .map(|addr| (*addr, per_frame_counts[addr]))
            .collect();

        Some(PointStack {
            sample: point.clone(),
            frame_counts,
        })
    }

    /// Snapshot of every valid sample, oldest-first, for profile export
    /// (spec §4.3 "Profile export") and call-tree construction.
    pub fn samples_snapshot(&self) -> Vec<StackSample> {
        let inner = self.inner.lock().unwrap();
        let start = if inner.len < inner.capacity {
            0
        } else {
            inner.next_write
        };
        (0..inner.len)
            .map(|i| inner.slots[(start + i) % inner.capacity].sample.clone())
            .collect()
    }
}

/// The most-likely-culprit stack for a stall (spec §3/§4.3), plus a
/// per-frame "how many ring samples contain this address" count.
#[derive(Debug, Clone)]
pub struct PointStack {
    pub sample: StackSample,
    pub frame_counts: Vec<(u64, u32)>,
}

impl PointStack {
    pub fn depth(&self) -> usize {
        self.sample.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(top: u64) -> StackSample {
        StackSample::new([top, top + 1000], 0.0, false)
    }

    #[test]
    fn all_samples_share_top_point_stack_has_full_counters() {
        let ring = Ring::new(5);
        for _ in 0..5 {
            ring.push(sample(42));
        }
        let ps = ring.point_stack().unwrap();
        assert_eq!(ps.sample.top(), Some(42));
        for (_, count) in &ps.frame_counts {
            assert_eq!(*count, 5);
        }
    }

    #[test]
    fn all_samples_differ_every_counter_is_one() {
        let ring = Ring::new(5);
        for i in 0..5u64 {
            ring.push(sample(i));
        }
        let ps = ring.point_stack().unwrap();
        for (_, count) in &ps.frame_counts {
            assert_eq!(*count, 1);
        }
    }

    #[test]
    fn ties_broken_toward_most_recent_slot() {
        let ring = Ring::new(4);
        // two independent singleton runs: [1,1] then [2,2]; both runs
        // reach a consecutive-repeat count of 2, most recent wins.
        ring.push(sample(1));
        ring.push(sample(1));
        ring.push(sample(2));
        ring.push(sample(2));
        let ps = ring.point_stack().unwrap();
        assert_eq!(ps.sample.top(), Some(2));
    }

    #[test]
    fn recursive_frame_within_one_sample_is_not_double_counted() {
        let ring = Ring::new(3);
        // Two identical samples, each with a recursive stack where address
        // 7 appears twice. The point stack's per-frame count must reflect
        // "2 samples contain address 7", not "4 occurrences of address 7".
        let recursive = || StackSample::new([5, 7, 7, 9], 0.0, false);
        ring.push(recursive());
        ring.push(recursive());
        let ps = ring.point_stack().unwrap();
        let count_for = |addr: u64| ps.frame_counts.iter().find(|(a, _)| *a == addr).unwrap().1;
        assert_eq!(count_for(7), 2);
        assert_eq!(count_for(5), 2);
        assert_eq!(count_for(9), 2);
    }

    #[test]
    fn overwrites_oldest_slot_when_full() {
        let ring = Ring::new(3);
        ring.push(sample(1));
        ring.push(sample(2));
        ring.push(sample(3));
        ring.push(sample(4));
        let snapshot = ring.samples_snapshot();
        let tops: Vec<_> = snapshot.iter().map(|s| s.top()).collect();
        assert_eq!(tops, vec![Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn resize_clears_existing_samples() {
        let ring = Ring::new(3);
        ring.push(sample(1));
        ring.resize(10);
        assert_eq!(ring.len(), 0);
    }
}
