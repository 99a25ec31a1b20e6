//! DB — mmap-backed on-disk tables (spec §4.7): one writer (the drain
//! thread), grow-by-`ftruncate`-then-remap, no in-process reader. Grounded
//! on the drain-thread-is-sole-writer shape of ALLOC (§4.8) and the
//! open-addressed table convention common to on-device forensic stores;
//! `memmap2` supplies the mapping primitive the teacher uses for its own
//! symbol-cache files.

mod hash_table;
mod log_file;
mod pool_file;

pub use hash_table::{AllocRow, HashTable, StackRow};
pub use log_file::AppendLog;
pub use pool_file::BumpPool;

use crate::error::InitError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Written once per run directory (spec §6 "On-disk layout" /
/// "forensic re-open on next launch"): the facts a survivor-reading pass
/// needs that aren't recoverable from the tables themselves — when the
/// run started, and what device/process produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub launch_timestamp_us: u64,
    pub os_version: String,
    pub device_model: String,
    pub process_uuid: [u8; 16],
    pub app_uuid: [u8; 16],
    pub scene: Option<String>,
}

const RUN_METADATA_FILE: &str = "run-metadata.json";

/// One directory per recording run (spec §6 "On-disk layout"), owning the
/// four table/log files plus the bump pool.
pub struct Database {
    pub alloc_table: HashTable<AllocRow>,
    pub stack_table: HashTable<StackRow>,
    pub image_info: AppendLog,
    pub object_types: AppendLog,
    pub dedup_pool: BumpPool,
    run_dir: PathBuf,
}

impl Database {
    /// Opens (or creates) the run directory's table/log files and writes
    /// `metadata` to `run-metadata.json` if that file doesn't already
    /// exist — the drain thread calls this once per run, not per restart
    /// of this in-process `Database` handle.
    pub fn create(run_dir: impl AsRef<Path>, metadata: &RunMetadata) -> Result<Self, InitError> {
        let run_dir = run_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&run_dir).map_err(|_| InitError::MmapFailed)?;

        let metadata_path = run_dir.join(RUN_METADATA_FILE);
        if !metadata_path.exists() {
            let bytes = serde_json::to_vec_pretty(metadata).unwrap_or_default();
            std::fs::write(&metadata_path, bytes).map_err(|_| InitError::MmapFailed)?;
        }

        let alloc_table = HashTable::open(run_dir.join("alloc-table.dat"))
            .map_err(|_| InitError::AllocTableFileOpenFailed)?;
        let stack_table = HashTable::open(run_dir.join("stack-table.dat"))
            .map_err(|_| InitError::StackTableFileOpenFailed)?;
        let image_info = AppendLog::open(run_dir.join("image-info.dat"))
            .map_err(|_| InitError::MmapFailed)?;
        let object_types = AppendLog::open(run_dir.join("object-type.dat"))
            .map_err(|_| InitError::MmapFailed)?;
        let dedup_pool = BumpPool::open(run_dir.join("dedup-pool.dat"))
            .map_err(|_| InitError::MmapFailed)?;

        Ok(Database {
            alloc_table,
            stack_table,
            image_info,
            object_types,
            dedup_pool,
            run_dir,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Reads back the metadata a prior run wrote (spec §1 "the next
    /// launch opens these files to list survivors"). `None` if the run
    /// directory predates this field or the file is unreadable.
    pub fn read_metadata(run_dir: impl AsRef<Path>) -> Option<RunMetadata> {
        let bytes = std::fs::read(run_dir.as_ref().join(RUN_METADATA_FILE)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// A prior run's surviving allocations joined against the stack that
    /// produced each one (spec §4.9 "live_allocations" / §1 survivor
    /// listing). This opens the same files `create` would, so it is safe
    /// to call against a run directory nobody is actively writing to —
    /// calling it concurrently with the drain thread that owns `run_dir`
    /// would race the mmap grow path and is not supported.
    pub fn read_survivors(run_dir: impl AsRef<Path>) -> Result<Vec<(AllocRow, Option<StackRow>)>, InitError> {
        let run_dir = run_dir.as_ref();
        let alloc_table: HashTable<AllocRow> = HashTable::open(run_dir.join("alloc-table.dat"))
            .map_err(|_| InitError::AllocTableFileOpenFailed)?;
        let stack_table: HashTable<StackRow> = HashTable::open(run_dir.join("stack-table.dat"))
            .map_err(|_| InitError::StackTableFileOpenFailed)?;

        Ok(alloc_table
            .snapshot()
            .into_iter()
            .map(|row| {
                let stack = stack_table.get(row.stack_id);
                (row, stack)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata() -> RunMetadata {
        RunMetadata {
            launch_timestamp_us: 123,
            os_version: "test-os".into(),
            device_model: "test-device".into(),
            process_uuid: [1; 16],
            app_uuid: [2; 16],
            scene: None,
        }
    }

    #[test]
    fn create_lays_out_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run-1");
        let db = Database::create(&run_dir, &test_metadata()).unwrap();
        assert!(run_dir.join("alloc-table.dat").exists());
        assert!(run_dir.join("stack-table.dat").exists());
        assert!(run_dir.join("image-info.dat").exists());
        assert!(run_dir.join("object-type.dat").exists());
        assert!(run_dir.join(RUN_METADATA_FILE).exists());
        assert_eq!(db.run_dir(), run_dir);
    }

    #[test]
    fn metadata_round_trips_and_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run-1");
        Database::create(&run_dir, &test_metadata()).unwrap();
        let read_back = Database::read_metadata(&run_dir).unwrap();
        assert_eq!(read_back.os_version, "test-os");

        let mut other = test_metadata();
        other.os_version = "different".into();
        Database::create(&run_dir, &other).unwrap();
        let still_first = Database::read_metadata(&run_dir).unwrap();
        assert_eq!(still_first.os_version, "test-os");
    }

    #[test]
    fn survivors_join_alloc_rows_with_their_stack() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run-1");
        let mut db = Database::create(&run_dir, &test_metadata()).unwrap();
        db.stack_table.insert(StackRow::new(77, &[0x10, 0x20])).unwrap();
        db.alloc_table
            .insert(AllocRow { address: 0x500, size: 16, type_tag: 0, flags: 0, stack_id: 77, timestamp_us: 0 })
            .unwrap();
        drop(db);

        let survivors = Database::read_survivors(&run_dir).unwrap();
        assert_eq!(survivors.len(), 1);
        let (row, stack) = &survivors[0];
        assert_eq!(row.address, 0x500);
        assert_eq!(stack.unwrap().frames(), &[0x10, 0x20]);
    }
}
