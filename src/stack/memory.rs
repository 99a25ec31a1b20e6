//! The memory-safe read primitive the walk is built on (spec §4.1,
//! `safe_copy` in §6): reads that tolerate unmapped pages by returning
//! failure instead of faulting, grounded on
//! `perfrecord/src/proc_maps.rs::ForeignMemory::read_u64_at_address` (for a
//! suspended peer thread) and the direct-slice read in
//! `samply-in-process`'s `get_backtrace_in_process` (for the caller's own,
//! currently-running stack).

/// Abstraction over "read 8 bytes at this address without faulting",
/// implemented once per memory source: a suspended peer thread (via
/// `mach_vm_read_overwrite` on macOS) or the calling thread's own stack
/// (a plain bounds-checked slice read, since the thread is executing and
/// its own stack is always mapped).
pub trait StackMemory {
    /// Reads an 8-byte little-endian word at `address`. Returns `None` on
    /// any failure (unmapped page, read error, or address out of the
    /// memory source's known range) rather than panicking or faulting.
    fn read_u64(&mut self, address: u64) -> Option<u64>;
}

/// Reads the predecessor-FP/return-address pair the frame-pointer walk
/// needs (spec §4.1 invariant 2): 16 bytes at `fp`, first 8 the
/// predecessor FP, next 8 the return address.
pub fn read_frame_pair(memory: &mut dyn StackMemory, fp: u64) -> Option<(u64, u64)> {
    if fp == 0 || fp % 8 != 0 {
        return None;
    }
    let predecessor_fp = memory.read_u64(fp)?;
    let return_address = memory.read_u64(fp.checked_add(8)?)?;
    Some((predecessor_fp, return_address))
}

/// A [`StackMemory`] over a plain byte slice, used in tests and for the
/// in-process fast path where the thread's stack is a contiguous region
/// directly addressable by the sampling thread.
pub struct SliceMemory<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> SliceMemory<'a> {
    pub fn new(base: u64, bytes: &'a [u8]) -> Self {
        SliceMemory { base, bytes }
    }
}

impl StackMemory for SliceMemory<'_> {
    fn read_u64(&mut self, address: u64) -> Option<u64> {
        let offset = address.checked_sub(self.base)?;
        let offset = usize::try_from(offset).ok()?;
        let end = offset.checked_add(8)?;
        let slice = self.bytes.get(offset..end)?;
        Some(u64::from_le_bytes(slice.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_frame_pair_rejects_unaligned_and_null_fp() {
        let bytes = [0u8; 32];
        let mut mem = SliceMemory::new(0x1000, &bytes);
        assert!(read_frame_pair(&mut mem, 0).is_none());
        assert!(read_frame_pair(&mut mem, 0x1001).is_none());
    }

    #[test]
    fn read_frame_pair_reads_both_words() {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&0x2000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&0xdead_beefu64.to_le_bytes());
        let mut mem = SliceMemory::new(0x1000, &bytes);
        let (predecessor_fp, return_address) = read_frame_pair(&mut mem, 0x1000).unwrap();
        assert_eq!(predecessor_fp, 0x2000);
        assert_eq!(return_address, 0xdead_beef);
    }

    #[test]
    fn out_of_range_read_fails_safely() {
        let bytes = [0u8; 8];
        let mut mem = SliceMemory::new(0x1000, &bytes);
        assert!(mem.read_u64(0x2000).is_none());
    }
}
