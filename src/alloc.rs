//! ALLOC — allocation-event interception pipeline (spec §4.8).
//!
//! The process-wide hook cell is modeled per spec §9 ("Global mutable
//! function-pointer hook... a single process-wide atomic cell") as
//! [`HookCell`]; the platform-specific work of actually pointing the
//! OS-level malloc logger at this crate's dispatcher lives outside this
//! module (the `mac` platform layer), since that part is unsafe FFI glue
//! with no portable shape to generalize.

use crate::buf::{EventRecord, HandoffQueue, SegmentPool};
use crate::config::{CaptureStacksMode, Config};
use crate::db::{AllocRow, Database, RunMetadata, StackRow};
use crate::error::{InitError, RuntimeError};
use rustc_hash::FxHasher;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Raw descriptor shape matching the platform malloc-logger convention
/// (spec §6 "Allocator hook sink"): `(kind_flags, arg1, arg2, arg3,
/// result, frames_to_skip)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookDescriptor {
    pub kind: HookKind,
    pub zone_or_old_ptr: u64,
    pub size_or_new_size: u64,
    pub arg3: u64,
    pub result: u64,
    pub frames_to_skip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Malloc,
    Free,
    Realloc,
    VmAllocate { alias: u32 },
    VmDeallocate,
    MappedFileOrSharedMem,
}

/// The kernel's internal-heap-growth VM aliases (spec §4.8 step 3):
/// traffic in this range is the allocator growing its own arena and will
/// reappear as a user-visible malloc later.
const VM_MEMORY_MALLOC: u32 = 1;
const VM_MEMORY_MALLOC_NANO: u32 = 11;

/// One decoded event, ready for [`AllocPipeline::dispatch`] to route into
/// a buffer (spec §4.8 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedEvent {
    Alloc { address: u64, size: u64 },
    Free { address: u64 },
    /// A `realloc` whose result moved: decoded as free-then-alloc (spec
    /// §4.8 step 5).
    ReallocMoved { old_address: u64, new_address: u64, new_size: u64 },
    Dropped,
}

/// Decodes a raw hook descriptor into the alloc/free shape the pipeline
/// acts on (spec §4.8 steps 3-5). Returns `None` for descriptors that
/// should be silently skipped (steps 3-4).
pub fn decode_event(descriptor: &HookDescriptor) -> Option<DecodedEvent> {
    match descriptor.kind {
        HookKind::VmAllocate { alias } if (VM_MEMORY_MALLOC..=VM_MEMORY_MALLOC_NANO).contains(&alias) => None,
        HookKind::MappedFileOrSharedMem => None,
        HookKind::Malloc => Some(DecodedEvent::Alloc {
            address: descriptor.result,
            size: descriptor.size_or_new_size,
        }),
        HookKind::Free | HookKind::VmDeallocate => {
            if descriptor.zone_or_old_ptr == 0 {
                Some(DecodedEvent::Dropped)
            } else {
                Some(DecodedEvent::Free { address: descriptor.zone_or_old_ptr })
            }
        }
        HookKind::VmAllocate { .. } => Some(DecodedEvent::Alloc {
            address: descriptor.result,
            size: descriptor.size_or_new_size,
        }),
        HookKind::Realloc => {
            let old = descriptor.zone_or_old_ptr;
            let new = descriptor.result;
            if old == 0 {
                Some(DecodedEvent::Alloc {
                    address: new,
                    size: descriptor.size_or_new_size,
                })
            } else if old == new {
                // In-place growth: no address changed, nothing to record
                // beyond what a size-only update would add; treated as a
                // no-op event here since the live row's size is refreshed
                // by the next Alloc-shaped record the caller may choose
                // to emit (callers that care about size drift emit an
                // UpdateType-equivalent themselves).
                Some(DecodedEvent::Dropped)
            } else {
                Some(DecodedEvent::ReallocMoved {
                    old_address: old,
                    new_address: new,
                    new_size: descriptor.size_or_new_size,
                })
            }
        }
    }
}

fn hash_stack(frames: &[u64]) -> u64 {
    let mut hasher = FxHasher::default();
    for addr in frames {
        hasher.write_u64(*addr);
    }
    hasher.finish()
}

thread_local! {
    static IGNORE_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
    static THREAD_BUFFER: RefCell<Option<crate::buf::EventBufferSegment>> = const { RefCell::new(None) };
    static SEEN_STACK_HASHES: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

const SEEN_HASHES_CAP: usize = 4096;

/// Marks the calling thread as exempt from interception for the
/// remainder of the guard's lifetime (spec §4.8 step 2, §9 "per-thread
/// mutable ignore flag"). Settable without allocating.
pub struct IgnoreGuard {
    previous: bool,
}

impl IgnoreGuard {
    pub fn enter() -> Self {
        let previous = IGNORE_THIS_THREAD.with(|flag| flag.replace(true));
        IgnoreGuard { previous }
    }
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        IGNORE_THIS_THREAD.with(|flag| flag.set(self.previous));
    }
}

fn is_ignoring() -> bool {
    IGNORE_THIS_THREAD.with(|flag| flag.get())
}

/// Captures the calling thread's own stack (spec §4.8: "uses the
/// thread's own FP — no thread suspension is needed because the context
/// is self"). Implemented per-platform; the fast path never touches
/// another thread's memory.
pub trait SelfStackCapture: Send + Sync {
    fn capture_self(&self, max_depth: usize) -> Vec<u64>;
}

/// A process-wide atomic cell holding whether the dispatcher is
/// currently installed (spec §9). The actual function-pointer swap into
/// the platform's malloc-logger slot is platform glue; this flag is what
/// the dispatcher checks on every call (spec §4.8 step 1).
pub struct HookCell {
    installed: AtomicBool,
    /// Reserved for a future real function-pointer cell; present so the
    /// "atomic cell of function-pointer type" shape from spec §9 has a
    /// concrete slot even though nothing platform-independent points
    /// through it yet.
    _reserved_fn_ptr: AtomicPtr<()>,
}

impl Default for HookCell {
    fn default() -> Self {
        HookCell {
            installed: AtomicBool::new(false),
            _reserved_fn_ptr: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

impl HookCell {
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::Release);
    }
}

/// Checks the small set of environment-variable probes a competing
/// allocation-instrumentation tool would set (spec §4.8 "Startup
/// gating"), so the two tools don't fight for the hook pointer.
pub fn competing_tool_detected(env: &dyn Fn(&str) -> Option<String>) -> bool {
    const PROBES: &[&str] = &["MallocStackLogging", "MallocStackLoggingNoCompact", "MallocScribble"];
    PROBES.iter().any(|var| env(var).is_some())
}

/// The ALLOC pipeline: dispatcher logic (spec §4.8), the per-thread
/// buffer/pool/handoff plumbing it feeds (§4.6), and the background
/// drain worker (§4.8 "Drain thread").
pub struct AllocPipeline {
    enabled: AtomicBool,
    hook: HookCell,
    pool: SegmentPool,
    queue: Arc<HandoffQueue>,
    capture: Arc<dyn SelfStackCapture>,
    capture_mode: CaptureStacksMode,
    skip_min_alloc_size_bytes: u64,
    skip_max_stack_depth: usize,
}

impl AllocPipeline {
    pub fn new(config: &Config, capture: Arc<dyn SelfStackCapture>, pool_size: usize) -> Self {
        AllocPipeline {
            enabled: AtomicBool::new(false),
            hook: HookCell::default(),
            pool: SegmentPool::new(pool_size),
            queue: Arc::new(HandoffQueue::new()),
            capture,
            capture_mode: config.capture_call_stacks_mode,
            skip_min_alloc_size_bytes: config.skip_min_alloc_size_bytes,
            skip_max_stack_depth: config.skip_max_stack_depth,
        }
    }

    pub fn queue(&self) -> Arc<HandoffQueue> {
        self.queue.clone()
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.hook.set_installed(true);
    }

    /// Disables the pipeline (spec §4.8 "Shutdown"): the hook cell is
    /// cleared first so no new events enter, then `enabled` is dropped.
    pub fn disable(&self) {
        self.hook.set_installed(false);
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn should_capture_stack(&self, size: u64) -> bool {
        match self.capture_mode {
            CaptureStacksMode::None => false,
            CaptureStacksMode::AllAllocations => size >= self.skip_min_alloc_size_bytes,
            CaptureStacksMode::ObjectAllocationsOnly => false,
        }
    }

    /// The dispatcher entry point (spec §4.8 "Dispatcher logic",
    /// thread_id identifies the calling/producing thread).
    pub fn dispatch(&self, thread_id: u32, descriptor: HookDescriptor) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        if is_ignoring() {
            return;
        }
        let Some(decoded) = decode_event(&descriptor) else {
            return;
        };

        match decoded {
            DecodedEvent::Dropped => {}
            DecodedEvent::Alloc { address, size } => self.record_alloc(thread_id, address, size),
            DecodedEvent::Free { address } => self.record_free(thread_id, address),
            DecodedEvent::ReallocMoved { old_address, new_address, new_size } => {
                self.record_free(thread_id, old_address);
                self.record_alloc(thread_id, new_address, new_size);
            }
        }
    }

    fn record_alloc(&self, thread_id: u32, address: u64, size: u64) {
        let (stack_hash, stack_frames) = if self.should_capture_stack(size) {
            let frames = self.capture.capture_self(self.skip_max_stack_depth);
            let hash = hash_stack(&frames);
            let already_seen = SEEN_STACK_HASHES.with(|seen| {
                let mut seen = seen.borrow_mut();
                if seen.len() >= SEEN_HASHES_CAP {
                    seen.clear();
                }
                !seen.insert(hash)
            });
            (hash, if already_seen { None } else { Some(frames) })
        } else {
            (0, None)
        };

        self.with_thread_buffer(thread_id, EventRecord::Alloc {
            address,
            size,
            type_tag: 0,
            flags: 0,
            stack_hash,
            stack_frames,
        });
    }

    fn record_free(&self, thread_id: u32, address: u64) {
        // Peek: if this free would be elided by the segment's compaction
        // rule, the stack this alloc recorded (if new) must un-dedup so a
        // later sighting of the same hash is stored inline again (spec
        // §4.6 "if the Alloc carried a stack, the stack's dedup count is
        // decremented").
        THREAD_BUFFER.with(|cell| {
            if let Some(segment) = cell.borrow().as_ref() {
                if let Some(EventRecord::Alloc { address: a, stack_hash, stack_frames, .. }) = segment.records().last() {
                    if *a == address && stack_frames.is_some() {
                        SEEN_STACK_HASHES.with(|seen| {
                            seen.borrow_mut().remove(stack_hash);
                        });
                    }
                }
            }
        });
        self.with_thread_buffer(thread_id, EventRecord::Free { address, flags: 0 });
    }

    pub fn record_update_type(&self, thread_id: u32, address: u64, new_type_tag: u32) {
        if !self.enabled.load(Ordering::Acquire) || is_ignoring() {
            return;
        }
        self.with_thread_buffer(thread_id, EventRecord::UpdateType { address, new_type_tag });
    }

    /// Obtains (or rotates) the calling thread's buffer and enqueues
    /// `record`, retrying once against a fresh segment if the current one
    /// is full (spec §4.6 "Per-thread buffer acquisition" / "Enqueue").
    fn with_thread_buffer(&self, thread_id: u32, record: EventRecord) {
        THREAD_BUFFER.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.as_ref().map(|s| s.producing_thread) != Some(thread_id) {
                if let Some(old) = slot.take() {
                    self.queue.push(old);
                }
                *slot = Some(self.pool.acquire(thread_id));
            }

            let segment = slot.as_mut().unwrap();
            if !segment.enqueue(record.clone()) {
                let full = slot.take().unwrap();
                self.queue.push(full);
                let mut fresh = self.pool.acquire(thread_id);
                fresh.enqueue(record);
                *slot = Some(fresh);
            }
        });
    }
}

/// Adaptive sleep duration for the drain loop (spec §4.8 step 5): no
/// sleep when there was work, otherwise step the sleep up to a 10 ms
/// cap in 5 ms increments.
pub fn next_drain_sleep(had_work: bool, previous_sleep: Duration) -> Duration {
    if had_work {
        Duration::ZERO
    } else {
        (previous_sleep + Duration::from_millis(5)).min(Duration::from_millis(10))
    }
}

/// Drains all pending segments into `db` once (spec §4.8 "Drain thread"
/// steps 1-3). Returns whether any work was found, for
/// [`next_drain_sleep`].
pub fn drain_once(queue: &HandoffQueue, pool: &SegmentPool, db: &mut Database, now_us: u64) -> Result<bool, RuntimeError> {
    let mut segments = queue.drain_all();
    if segments.is_empty() {
        return Ok(false);
    }
    for segment in &mut segments {
        segment.compact();
        for record in segment.records() {
            apply_record(db, record, now_us)?;
        }
    }
    for segment in segments {
        pool.release(segment);
    }
    Ok(true)
}

fn apply_record(db: &mut Database, record: &EventRecord, now_us: u64) -> Result<(), RuntimeError> {
    match record {
        EventRecord::Alloc { address, size, type_tag, flags, stack_hash, stack_frames } => {
            if let Some(frames) = stack_frames {
                let _ = db.stack_table.insert(StackRow::new(*stack_hash, frames));
            }
            let _ = db.alloc_table.insert(AllocRow {
                address: *address,
                size: *size,
                type_tag: *type_tag,
                flags: *flags,
                stack_id: *stack_hash,
                timestamp_us: now_us,
            });
            Ok(())
        }
        EventRecord::Free { address, .. } => {
            db.alloc_table.remove(*address);
            Ok(())
        }
        EventRecord::UpdateType { address, new_type_tag } => {
            if let Some(mut row) = db.alloc_table.get(*address) {
                row.type_tag = *new_type_tag;
                let _ = db.alloc_table.insert(row);
            }
            Ok(())
        }
        EventRecord::StackProbe { stack_hash, stack_frames } => {
            if db.stack_table.get(*stack_hash).is_none() {
                let _ = db.stack_table.insert(StackRow::new(*stack_hash, stack_frames));
            }
            Ok(())
        }
    }
}

pub fn check_no_competing_tool(env: &dyn Fn(&str) -> Option<String>) -> Result<(), InitError> {
    if competing_tool_detected(env) {
        Err(InitError::AnalysisToolRunning)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedStack(Vec<u64>);
    impl SelfStackCapture for FixedStack {
        fn capture_self(&self, _max_depth: usize) -> Vec<u64> {
            self.0.clone()
        }
    }

    fn pipeline() -> AllocPipeline {
        AllocPipeline::new(&Config::default(), Arc::new(FixedStack(vec![0x10, 0x20])), 4)
    }

    #[test]
    fn vm_allocate_in_malloc_alias_range_is_dropped() {
        let descriptor = HookDescriptor {
            kind: HookKind::VmAllocate { alias: VM_MEMORY_MALLOC },
            zone_or_old_ptr: 0,
            size_or_new_size: 4096,
            arg3: 0,
            result: 0x5000,
            frames_to_skip: 0,
        };
        assert_eq!(decode_event(&descriptor), None);
    }

    #[test]
    fn free_of_null_is_dropped() {
        let descriptor = HookDescriptor {
            kind: HookKind::Free,
            zone_or_old_ptr: 0,
            size_or_new_size: 0,
            arg3: 0,
            result: 0,
            frames_to_skip: 0,
        };
        assert_eq!(decode_event(&descriptor), Some(DecodedEvent::Dropped));
    }

    #[test]
    fn realloc_null_becomes_alloc() {
        let descriptor = HookDescriptor {
            kind: HookKind::Realloc,
            zone_or_old_ptr: 0,
            size_or_new_size: 64,
            arg3: 0,
            result: 0x8000,
            frames_to_skip: 0,
        };
        assert_eq!(
            decode_event(&descriptor),
            Some(DecodedEvent::Alloc { address: 0x8000, size: 64 })
        );
    }

    #[test]
    fn realloc_that_moves_splits_into_free_then_alloc() {
        let descriptor = HookDescriptor {
            kind: HookKind::Realloc,
            zone_or_old_ptr: 0x100,
            size_or_new_size: 256,
            arg3: 0,
            result: 0x200,
            frames_to_skip: 0,
        };
        assert_eq!(
            decode_event(&descriptor),
            Some(DecodedEvent::ReallocMoved { old_address: 0x100, new_address: 0x200, new_size: 256 })
        );
    }

    #[test]
    fn disabled_pipeline_dispatch_is_a_no_op() {
        let p = pipeline();
        p.dispatch(1, HookDescriptor {
            kind: HookKind::Malloc,
            zone_or_old_ptr: 0,
            size_or_new_size: 16,
            arg3: 0,
            result: 0x900,
            frames_to_skip: 0,
        });
        assert_eq!(p.queue.len(), 0);
    }

    #[test]
    fn ignore_guard_suppresses_dispatch_for_its_scope() {
        let p = pipeline();
        p.enable();
        let _guard = IgnoreGuard::enter();
        p.dispatch(1, HookDescriptor {
            kind: HookKind::Malloc,
            zone_or_old_ptr: 0,
            size_or_new_size: 16,
            arg3: 0,
            result: 0x900,
            frames_to_skip: 0,
        });
        assert!(is_ignoring());
        drop(_guard);
        assert!(!is_ignoring());
    }

    #[test]
    fn drain_sleep_steps_up_when_idle_and_resets_on_work() {
        let mut sleep = Duration::ZERO;
        sleep = next_drain_sleep(false, sleep);
        assert_eq!(sleep, Duration::from_millis(5));
        sleep = next_drain_sleep(false, sleep);
        assert_eq!(sleep, Duration::from_millis(10));
        sleep = next_drain_sleep(false, sleep);
        assert_eq!(sleep, Duration::from_millis(10));
        sleep = next_drain_sleep(true, sleep);
        assert_eq!(sleep, Duration::ZERO);
    }

    #[test]
    fn competing_tool_probe_detects_env_var() {
        let env: HashMap<&str, &str> = [("MallocStackLogging", "1")].into_iter().collect();
        let lookup = |k: &str| env.get(k).map(|s| s.to_string());
        assert!(competing_tool_detected(&lookup));
        let empty_lookup = |_: &str| None;
        assert!(!competing_tool_detected(&empty_lookup));
    }

    fn test_run_metadata() -> RunMetadata {
        RunMetadata {
            launch_timestamp_us: 0,
            os_version: "test".into(),
            device_model: "test".into(),
            process_uuid: [0; 16],
            app_uuid: [0; 16],
            scene: None,
        }
    }

    #[test]
    fn drain_applies_alloc_then_free_to_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::create(dir.path(), &test_run_metadata()).unwrap();
        let pool = SegmentPool::new(4);
        let queue = HandoffQueue::new();
        let mut seg = pool.acquire(1);
        seg.enqueue(EventRecord::Alloc {
            address: 0x42,
            size: 8,
            type_tag: 0,
            flags: 0,
            stack_hash: 0,
            stack_frames: None,
        });
        queue.push(seg);
        let worked = drain_once(&queue, &pool, &mut db, 0).unwrap();
        assert!(worked);
        assert_eq!(db.alloc_table.len(), 1);
    }
}
