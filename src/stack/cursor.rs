//! [`StackCursor`] — iterator over the frames of a [`MachineContext`]
//! (spec §3/§4.1).

use super::memory::{read_frame_pair, StackMemory};
use super::symbol::SymbolCache;
use super::{return_address_to_call_site, AddressTagBits, MAX_FRAME_DEPTH};
use crate::platform::SymbolInfo;

/// A single yielded frame. `address` is the raw value found on the stack
/// (a PC for the first frame, a return address thereafter) — callers that
/// want the call-site address for symbolization should use
/// [`StackCursor::symbolize_current`], which applies the de-tag/decrement
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub address: u64,
}

/// Advance's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceResult {
    Frame(Frame),
    NoMoreFrames,
}

pub struct StackCursor<'a> {
    memory: &'a mut dyn StackMemory,
    tag_bits: AddressTagBits,
    max_depth: usize,
    depth: usize,
    given_up: bool,
    /// `None` before the first `advance`; afterwards, `Some(fp)` once we
    /// have a frame pointer to chase, or `None` once the walk has
    /// terminated.
    state: CursorState,
    current: Option<Frame>,
}

enum CursorState {
    NotStarted { pc: u64, fp: u64 },
    Walking { fp: u64 },
    Done,
}

impl<'a> StackCursor<'a> {
    /// Builds a cursor over `memory`, starting from `pc`/`fp` (spec §4.1
    /// invariant 1: the first yielded frame is the PC itself, without
    /// touching memory). `max_depth` is a caller-supplied ceiling on top of
    /// the hard 150-frame ceiling; whichever is smaller governs.
    pub fn new(memory: &'a mut dyn StackMemory, pc: u64, fp: u64, max_depth: usize) -> Self {
        StackCursor {
            memory,
            tag_bits: AddressTagBits::Two,
            max_depth: max_depth.min(MAX_FRAME_DEPTH),
            depth: 0,
            given_up: false,
            state: CursorState::NotStarted { pc, fp },
            current: None,
        }
    }

    pub fn with_tag_bits(mut self, tag_bits: AddressTagBits) -> Self {
        self.tag_bits = tag_bits;
        self
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn given_up(&self) -> bool {
        self.given_up
    }

    pub fn current(&self) -> Option<Frame> {
        self.current
    }

    pub fn reset(&mut self, pc: u64, fp: u64) {
        self.depth = 0;
        self.given_up = false;
        self.current = None;
        self.state = CursorState::NotStarted { pc, fp };
    }

    /// Advances to the next frame. Fails ("no more frames") when FP is
    /// zero, when the 16-byte read at FP would touch an invalid page, when
    /// either field reads as zero, or when depth exceeds the per-walk cap
    /// or the hard 150-frame ceiling (setting `given_up`).
    pub fn advance(&mut self) -> AdvanceResult {
        if self.depth >= self.max_depth {
            if self.depth >= MAX_FRAME_DEPTH {
                self.given_up = true;
            }
            self.state = CursorState::Done;
            self.current = None;
            return AdvanceResult::NoMoreFrames;
        }

        match self.state {
            CursorState::NotStarted { pc, fp } => {
                if pc == 0 {
                    self.state = CursorState::Done;
                    return AdvanceResult::NoMoreFrames;
                }
                self.depth += 1;
                self.state = CursorState::Walking { fp };
                let frame = Frame { address: pc };
                self.current = Some(frame);
                AdvanceResult::Frame(frame)
            }
            CursorState::Walking { fp } => {
                if fp == 0 {
                    self.state = CursorState::Done;
                    self.current = None;
                    return AdvanceResult::NoMoreFrames;
                }
                match read_frame_pair(self.memory, fp) {
                    Some((predecessor_fp, return_address)) if return_address != 0 => {
                        self.depth += 1;
                        self.state = CursorState::Walking {
                            fp: predecessor_fp,
                        };
                        let frame = Frame {
                            address: return_address,
                        };
                        self.current = Some(frame);
                        AdvanceResult::Frame(frame)
                    }
                    _ => {
                        self.state = CursorState::Done;
                        self.current = None;
                        AdvanceResult::NoMoreFrames
                    }
                }
            }
            CursorState::Done => AdvanceResult::NoMoreFrames,
        }
    }

    /// Symbolizes the current frame via `cache`, applying the
    /// tag-strip/decrement address normalization first (spec §4.1).
    pub fn symbolize_current(&self, cache: &mut SymbolCache) -> Option<SymbolInfo> {
        let frame = self.current?;
        let call_site = return_address_to_call_site(frame.address, self.tag_bits);
        cache.symbolize(call_site)
    }

    /// Walks to completion, collecting every frame address (bounded by
    /// [`StackSample`]'s 100-address cap upstream — this just walks).
    pub fn collect_addresses(&mut self) -> Vec<u64> {
        let mut out = Vec::new();
        loop {
            match self.advance() {
                AdvanceResult::Frame(f) => out.push(f.address),
                AdvanceResult::NoMoreFrames => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::memory::SliceMemory;

    fn chain_memory(frames: &[(u64, u64)]) -> (u64, Vec<u8>) {
        // Lay out a chain of (fp, return_address) pairs starting at base.
        let base = 0x1000u64;
        let mut bytes = vec![0u8; frames.len() * 16 + 16];
        for (i, (next_fp, return_address)) in frames.iter().enumerate() {
            let off = i * 16;
            bytes[off..off + 8].copy_from_slice(&next_fp.to_le_bytes());
            bytes[off + 8..off + 16].copy_from_slice(&return_address.to_le_bytes());
        }
        (base, bytes)
    }

    #[test]
    fn first_frame_is_pc_without_touching_memory() {
        let bytes = [0u8; 0];
        let mut mem = SliceMemory::new(0x1000, &bytes);
        let mut cursor = StackCursor::new(&mut mem, 0xAAAA, 0, 10);
        assert_eq!(cursor.advance(), AdvanceResult::Frame(Frame { address: 0xAAAA }));
        assert_eq!(cursor.advance(), AdvanceResult::NoMoreFrames);
    }

    #[test]
    fn walks_a_chain_of_frames() {
        // fp chain: 0x1000 -> 0x1010 -> 0x1020 -> 0 (terminate)
        let (base, bytes) = chain_memory(&[(0x1010, 0x41), (0x1020, 0x42), (0, 0x43)]);
        let mut mem = SliceMemory::new(base, &bytes);
        let mut cursor = StackCursor::new(&mut mem, 0x40, base, 10);
        let mut addrs = Vec::new();
        loop {
            match cursor.advance() {
                AdvanceResult::Frame(f) => addrs.push(f.address),
                AdvanceResult::NoMoreFrames => break,
            }
        }
        assert_eq!(addrs, vec![0x40, 0x41, 0x42, 0x43]);
        assert!(!cursor.given_up());
    }

    #[test]
    fn terminates_on_zero_fp() {
        let bytes = [0u8; 0];
        let mut mem = SliceMemory::new(0x1000, &bytes);
        let mut cursor = StackCursor::new(&mut mem, 0x40, 0, 10);
        cursor.advance();
        assert_eq!(cursor.advance(), AdvanceResult::NoMoreFrames);
    }

    #[test]
    fn stack_walk_termination_bounded_by_hard_ceiling() {
        // Build a very long, valid chain (well past the 150-frame ceiling)
        // all pointing forward, and confirm the walk still terminates and
        // sets `given_up`.
        let n = 1000;
        let base = 0x10000u64;
        let mut bytes = vec![0u8; n * 16 + 16];
        for i in 0..n {
            let off = i * 16;
            let next_fp = base + ((i + 1) * 16) as u64;
            bytes[off..off + 8].copy_from_slice(&next_fp.to_le_bytes());
            bytes[off + 8..off + 16].copy_from_slice(&(0x5000 + i as u64).to_le_bytes());
        }
        let mut mem = SliceMemory::new(base, &bytes);
        let mut cursor = StackCursor::new(&mut mem, 0x1, base, 10_000);
        let mut count = 0;
        loop {
            match cursor.advance() {
                AdvanceResult::Frame(_) => count += 1,
                AdvanceResult::NoMoreFrames => break,
            }
        }
        assert!(count <= super::MAX_FRAME_DEPTH);
        assert!(cursor.given_up());
    }

    #[test]
    fn per_walk_cap_smaller_than_hard_ceiling_does_not_set_given_up() {
        let (base, bytes) = chain_memory(&[(0x1010, 0x41), (0x1020, 0x42), (0x1030, 0x43)]);
        let mut mem = SliceMemory::new(base, &bytes);
        let mut cursor = StackCursor::new(&mut mem, 0x40, base, 2);
        let mut count = 0;
        loop {
            match cursor.advance() {
                AdvanceResult::Frame(_) => count += 1,
                AdvanceResult::NoMoreFrames => break,
            }
        }
        assert_eq!(count, 2);
        assert!(!cursor.given_up());
    }
}
