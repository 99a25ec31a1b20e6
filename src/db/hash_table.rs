//! Open-addressed, fixed-width hash table backed by a single mmap'ed file
//! (spec §4.7 "Two mmap-backed files"). Grows by `ftruncate` + re-`mmap`;
//! re-maps invalidate any outstanding pointers, which is fine here since
//! the table owns its storage entirely and hands out owned rows, never
//! references into the map.

use memmap2::MmapMut;
use rustc_hash::FxHasher;
use std::fs::OpenOptions;
use std::hash::Hasher;
use std::io;
use std::path::{Path, PathBuf};

const INITIAL_CAPACITY: u64 = 1024;
const MAX_LOAD_FACTOR_NUM: u64 = 7;
const MAX_LOAD_FACTOR_DEN: u64 = 10;
const HEADER_BYTES: u64 = 16; // capacity: u64, count: u64

/// A fixed-width table cell. `key() == 0` is reserved to mean "empty slot"
/// — every concrete row type's key space excludes zero in practice
/// (address 0 is never a live allocation; a stack hash of exactly 0 is
/// astronomically unlikely and, if it occurs, degrades to an extra
/// collision rather than data loss).
pub trait RowCodec: Copy {
    const SIZE: usize;
    fn key(&self) -> u64;
    fn empty() -> Self;
    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

pub struct HashTable<T: RowCodec> {
    path: PathBuf,
    file: std::fs::File,
    map: MmapMut,
    capacity: u64,
    count: u64,
    _marker: std::marker::PhantomData<T>,
}

fn hash_key(key: u64) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(key);
    hasher.finish()
}

impl<T: RowCodec> HashTable<T> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let needed_len = HEADER_BYTES + INITIAL_CAPACITY * T::SIZE as u64;
        if file.metadata()?.len() < needed_len {
            file.set_len(needed_len)?;
        }
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let capacity = read_u64(&map, 0);
        let count = read_u64(&map, 8);
        let capacity = if capacity == 0 {
            write_u64(&mut map, 0, INITIAL_CAPACITY);
            INITIAL_CAPACITY
        } else {
            capacity
        };

        Ok(HashTable {
            path,
            file,
            map,
            capacity,
            count,
            _marker: std::marker::PhantomData,
        })
    }

    fn cell_offset(&self, index: u64) -> usize {
        (HEADER_BYTES + index * T::SIZE as u64) as usize
    }

    fn read_cell(&self, index: u64) -> T {
        let off = self.cell_offset(index);
        T::decode(&self.map[off..off + T::SIZE])
    }

    fn write_cell(&mut self, index: u64, row: T) {
        let off = self.cell_offset(index);
        row.encode(&mut self.map[off..off + T::SIZE]);
    }

    fn persist_header(&mut self) {
        write_u64(&mut self.map, 0, self.capacity);
        write_u64(&mut self.map, 8, self.count);
    }

    /// Inserts or overwrites the row keyed by `row.key()`.
    pub fn insert(&mut self, row: T) -> io::Result<()> {
        if (self.count + 1) * MAX_LOAD_FACTOR_DEN > self.capacity * MAX_LOAD_FACTOR_NUM {
            self.grow()?;
        }
        let mut index = hash_key(row.key()) % self.capacity;
        loop {
            let existing = self.read_cell(index);
            if existing.key() == 0 || existing.key() == row.key() {
                let was_empty = existing.key() == 0;
                self.write_cell(index, row);
                if was_empty {
                    self.count += 1;
                }
                self.persist_header();
                return Ok(());
            }
            index = (index + 1) % self.capacity;
        }
    }

    pub fn get(&self, key: u64) -> Option<T> {
        if key == 0 || self.capacity == 0 {
            return None;
        }
        let mut index = hash_key(key) % self.capacity;
        let mut probed = 0u64;
        while probed < self.capacity {
            let cell = self.read_cell(index);
            if cell.key() == 0 {
                return None;
            }
            if cell.key() == key {
                return Some(cell);
            }
            index = (index + 1) % self.capacity;
            probed += 1;
        }
        None
    }

    /// Clears the row at `key`, then backward-shifts the rest of its probe
    /// cluster so later lookups for a different key that merely collided
    /// with this one don't stop early at the freshly-emptied slot (no
    /// tombstones are kept — a tombstone that's never reclaimed would
    /// eventually fill the table on a workload with many alloc/free
    /// pairs, exactly the `ALLOC` access pattern this table serves).
    pub fn remove(&mut self, key: u64) -> bool {
        let Some(index) = self.index_of(key) else {
            return false;
        };
        self.write_cell(index, T::empty());
        self.count -= 1;

        let mut hole = index;
        loop {
            let mut probe = hole;
            let next = loop {
                probe = (probe + 1) % self.capacity;
                let cell = self.read_cell(probe);
                if cell.key() == 0 {
                    break None;
                }
                let natural = hash_key(cell.key()) % self.capacity;
                // `natural` must NOT lie in the open interval `(hole, probe]`
                // (cyclically) for this entry to be a candidate to pull back
                // into `hole` — i.e. it's still reachable by its own probe
                // sequence without passing through `hole` first.
                let blocked = if hole <= probe {
                    natural > hole && natural <= probe
                } else {
                    natural <= probe || natural > hole
                };
                if !blocked {
                    break Some(probe);
                }
            };
            match next {
                Some(probe) => {
                    let moved = self.read_cell(probe);
                    self.write_cell(hole, moved);
                    self.write_cell(probe, T::empty());
                    hole = probe;
                }
                None => break,
            }
        }

        self.persist_header();
        true
    }

    fn index_of(&self, key: u64) -> Option<u64> {
        if key == 0 || self.capacity == 0 {
            return None;
        }
        let mut index = hash_key(key) % self.capacity;
        let mut probed = 0u64;
        while probed < self.capacity {
            let cell = self.read_cell(index);
            if cell.key() == 0 {
                return None;
            }
            if cell.key() == key {
                return Some(index);
            }
            index = (index + 1) % self.capacity;
            probed += 1;
        }
        None
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All non-empty rows, for snapshot export (spec §4.9 "a snapshot of
    /// the live-allocation table").
    pub fn snapshot(&self) -> Vec<T> {
        (0..self.capacity)
            .map(|i| self.read_cell(i))
            .filter(|row| row.key() != 0)
            .collect()
    }

    fn grow(&mut self) -> io::Result<()> {
        let old_capacity = self.capacity;
        let new_capacity = old_capacity * 2;
        let old_rows: Vec<T> = (0..old_capacity)
            .map(|i| self.read_cell(i))
            .filter(|row| row.key() != 0)
            .collect();

        let new_len = HEADER_BYTES + new_capacity * T::SIZE as u64;
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_capacity;
        self.count = 0;
        write_u64(&mut self.map, 0, self.capacity);
        write_u64(&mut self.map, 8, 0);

        for row in old_rows {
            self.insert(row)?;
        }
        Ok(())
    }
}

fn read_u64(map: &MmapMut, offset: usize) -> u64 {
    u64::from_le_bytes(map[offset..offset + 8].try_into().unwrap())
}

fn write_u64(map: &mut MmapMut, offset: usize, value: u64) {
    map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// `alloc-table.dat` cell (spec §3 `LiveAllocRow`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocRow {
    pub address: u64,
    pub size: u64,
    pub type_tag: u32,
    pub flags: u32,
    pub stack_id: u64,
    pub timestamp_us: u64,
}

impl RowCodec for AllocRow {
    const SIZE: usize = 40;

    fn key(&self) -> u64 {
        self.address
    }

    fn empty() -> Self {
        AllocRow::default()
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.type_tag.to_le_bytes());
        buf[20..24].copy_from_slice(&self.flags.to_le_bytes());
        buf[24..32].copy_from_slice(&self.stack_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.timestamp_us.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        AllocRow {
            address: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            type_tag: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            stack_id: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            timestamp_us: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}

/// `stack-table.dat` cell (spec §3 `StackFrameRow`), inline frames capped
/// at a fixed width so the cell stays constant-size.
pub const STACK_ROW_MAX_FRAMES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRow {
    pub stack_hash: u64,
    pub frame_count: u32,
    pub frames: [u64; STACK_ROW_MAX_FRAMES],
}

impl Default for StackRow {
    fn default() -> Self {
        StackRow {
            stack_hash: 0,
            frame_count: 0,
            frames: [0; STACK_ROW_MAX_FRAMES],
        }
    }
}

impl StackRow {
    pub fn new(stack_hash: u64, frames: &[u64]) -> Self {
        let mut row = StackRow {
            stack_hash,
            frame_count: frames.len().min(STACK_ROW_MAX_FRAMES) as u32,
            frames: [0; STACK_ROW_MAX_FRAMES],
        };
        let n = row.frame_count as usize;
        row.frames[..n].copy_from_slice(&frames[..n]);
        row
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.frame_count as usize]
    }
}

impl RowCodec for StackRow {
    const SIZE: usize = 8 + 4 + 4 + STACK_ROW_MAX_FRAMES * 8;

    fn key(&self) -> u64 {
        self.stack_hash
    }

    fn empty() -> Self {
        StackRow::default()
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.stack_hash.to_le_bytes());
        buf[8..12].copy_from_slice(&self.frame_count.to_le_bytes());
        // buf[12..16] is padding, kept zeroed.
        for (i, frame) in self.frames.iter().enumerate() {
            let off = 16 + i * 8;
            buf[off..off + 8].copy_from_slice(&frame.to_le_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Self {
        let stack_hash = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let frame_count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let mut frames = [0u64; STACK_ROW_MAX_FRAMES];
        for (i, frame) in frames.iter_mut().enumerate() {
            let off = 16 + i * 8;
            *frame = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        }
        StackRow {
            stack_hash,
            frame_count,
            frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut table: HashTable<AllocRow> = HashTable::open(dir.path().join("alloc-table.dat")).unwrap();
        let row = AllocRow {
            address: 0x1000,
            size: 128,
            type_tag: 0,
            flags: 0,
            stack_id: 42,
            timestamp_us: 9,
        };
        table.insert(row).unwrap();
        assert_eq!(table.get(0x1000), Some(row));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_clears_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut table: HashTable<AllocRow> = HashTable::open(dir.path().join("alloc-table.dat")).unwrap();
        table
            .insert(AllocRow { address: 0x2000, size: 8, type_tag: 0, flags: 0, stack_id: 1, timestamp_us: 0 })
            .unwrap();
        assert!(table.remove(0x2000));
        assert_eq!(table.get(0x2000), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn remove_preserves_lookup_of_a_later_colliding_key() {
        let dir = tempfile::tempdir().unwrap();
        let table: HashTable<AllocRow> = HashTable::open(dir.path().join("alloc-table.dat")).unwrap();
        let capacity = table.capacity;
        drop(table);

        // Find two distinct keys that land in the same initial bucket, so
        // the second is necessarily placed by probing past the first.
        let first = 1u64;
        let first_index = hash_key(first) % capacity;
        let second = (2..100_000u64)
            .find(|&k| k != first && hash_key(k) % capacity == first_index)
            .expect("a colliding key exists within the search range");

        let mut table: HashTable<AllocRow> = HashTable::open(dir.path().join("alloc-table.dat")).unwrap();
        table
            .insert(AllocRow { address: first, size: 8, type_tag: 0, flags: 0, stack_id: 0, timestamp_us: 0 })
            .unwrap();
        table
            .insert(AllocRow { address: second, size: 16, type_tag: 0, flags: 0, stack_id: 0, timestamp_us: 0 })
            .unwrap();

        assert!(table.remove(first));
        assert_eq!(table.len(), 1);
        // `second` probed past `first`'s original slot; without backward
        // shift deletion the now-empty slot would make this a false miss.
        assert_eq!(table.get(second).map(|r| r.size), Some(16));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut table: HashTable<AllocRow> = HashTable::open(dir.path().join("alloc-table.dat")).unwrap();
        for i in 1..2000u64 {
            table
                .insert(AllocRow { address: i, size: 8, type_tag: 0, flags: 0, stack_id: 0, timestamp_us: 0 })
                .unwrap();
        }
        assert_eq!(table.len(), 1999);
        assert!(table.get(1500).is_some());
    }

    #[test]
    fn stack_row_frames_roundtrip_through_encode_decode() {
        let row = StackRow::new(0xdead, &[1, 2, 3]);
        let mut buf = vec![0u8; StackRow::SIZE];
        row.encode(&mut buf);
        let decoded = StackRow::decode(&buf);
        assert_eq!(decoded.frames(), &[1, 2, 3]);
    }
}
