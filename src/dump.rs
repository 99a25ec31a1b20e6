//! DUMP — artifact materialization (spec §4.9).

use crate::calltree::CallTree;
use crate::cpu::HotStack;
use crate::db::AllocRow;
use crate::platform::{DumpDecisionHost, DumpMetadata, DumpSink};
use crate::ring::{PointStack, Ring};
use crate::stack::SymbolCache;
use crate::stall::StallKind;
use crate::threads::{EnvironmentSuspender, ThreadApi, ThreadHandle};
use serde::Serialize;
use std::time::Duration;

/// The caller-supplied reason a dump was produced (spec §4.9 "Production").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DumpKind {
    MainThreadBlock,
    BackgroundMainThreadBlock,
    CpuBlock,
    LaunchBlock,
    BlockThreadTooMuch,
    BlockAndBeKilled,
    SustainedCpu,
    Fps,
    DiskIo,
    SelfDefined,
    Test,
}

impl From<StallKind> for DumpKind {
    fn from(kind: StallKind) -> Self {
        match kind {
            StallKind::MainThreadBlock => DumpKind::MainThreadBlock,
            StallKind::BackgroundMainThreadBlock => DumpKind::BackgroundMainThreadBlock,
            StallKind::BlockThreadTooMuch => DumpKind::BlockThreadTooMuch,
            StallKind::CpuBlock => DumpKind::CpuBlock,
            StallKind::LaunchBlock => DumpKind::LaunchBlock,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PointStackJson {
    addresses: Vec<u64>,
    frame_counts: Vec<(u64, u32)>,
    cpu_pct: f64,
    backgrounded: bool,
}

impl From<&PointStack> for PointStackJson {
    fn from(ps: &PointStack) -> Self {
        PointStackJson {
            addresses: ps.sample.addresses().to_vec(),
            frame_counts: ps.frame_counts.clone(),
            cpu_pct: ps.sample.cpu_pct,
            backgrounded: ps.sample.backgrounded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HotStackJson {
    thread: u32,
    addresses: Vec<u64>,
    cpu_pct: f64,
}

impl From<&HotStack> for HotStackJson {
    fn from(hot: &HotStack) -> Self {
        HotStackJson {
            thread: hot.thread.0,
            addresses: hot.sample.addresses().to_vec(),
            cpu_pct: hot.sample.cpu_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AllocRowJson {
    address: u64,
    size: u64,
    stack_id: u64,
}

impl From<&AllocRow> for AllocRowJson {
    fn from(row: &AllocRow) -> Self {
        AllocRowJson {
            address: row.address,
            size: row.size,
            stack_id: row.stack_id,
        }
    }
}

/// The assembled artifact (spec §4.9 "A dump is a byte stream assembled
/// from...").
#[derive(Debug, Clone, Serialize)]
pub struct DumpArtifact {
    kind: DumpKind,
    block_duration_us: u64,
    point_stack: Option<PointStackJson>,
    profile: CallTree,
    cpu_hot_stacks: Vec<HotStackJson>,
    cpu_call_tree: Option<CallTree>,
    live_allocations: Vec<AllocRowJson>,
    metadata: DumpMetadata,
    custom_user_info: Option<serde_json::Value>,
}

impl DumpArtifact {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn symbolize(&mut self, cache: &mut SymbolCache) {
        self.profile.symbolize(cache);
        if let Some(tree) = &mut self.cpu_call_tree {
            tree.symbolize(cache);
        }
    }
}

/// Builds a [`DumpArtifact`] from the current state of MAIN's ring,
/// CPU's hot-stack pool, the live-allocation table, and device metadata
/// (spec §4.9 steps 1-4), but does not emit it — that's
/// [`DumpProducer::produce`].
#[allow(clippy::too_many_arguments)]
pub fn build_artifact(
    kind: DumpKind,
    block_duration: Duration,
    ring: &Ring,
    hot_stacks: &[HotStack],
    cpu_call_tree: Option<CallTree>,
    live_allocations: &[AllocRow],
    metadata: DumpMetadata,
    custom_user_info: Option<serde_json::Value>,
) -> DumpArtifact {
    let point_stack = ring.point_stack();
    let profile_tree = CallTree::build(&ring.samples_snapshot());

    DumpArtifact {
        kind,
        block_duration_us: block_duration.as_micros() as u64,
        point_stack: point_stack.as_ref().map(PointStackJson::from),
        profile: profile_tree,
        cpu_hot_stacks: hot_stacks.iter().map(HotStackJson::from).collect(),
        cpu_call_tree,
        live_allocations: live_allocations.iter().map(AllocRowJson::from).collect(),
        metadata,
        custom_user_info,
    }
}

/// Orchestrates the full dump path (spec §4.9 steps 1-5): assembles the
/// artifact, optionally suspends the environment for sharper stacks,
/// hands the bytes to the [`DumpSink`], and notifies the
/// [`DumpDecisionHost`].
pub struct DumpProducer<'a> {
    suspend_on_dump: bool,
    suspender: &'a EnvironmentSuspender,
    thread_api: &'a dyn ThreadApi,
}

impl<'a> DumpProducer<'a> {
    pub fn new(suspend_on_dump: bool, suspender: &'a EnvironmentSuspender, thread_api: &'a dyn ThreadApi) -> Self {
        DumpProducer {
            suspend_on_dump,
            suspender,
            thread_api,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn produce(
        &self,
        kind: DumpKind,
        block_duration: Duration,
        ring: &Ring,
        hot_stacks: &[HotStack],
        cpu_call_tree: Option<CallTree>,
        live_allocations: &[AllocRow],
        metadata: DumpMetadata,
        symbols: &mut SymbolCache,
        host: &dyn DumpDecisionHost,
        sink: &dyn DumpSink,
        allow_list: &[ThreadHandle],
    ) {
        let _guard = if self.suspend_on_dump {
            self.suspender.suspend_environment(self.thread_api, allow_list).ok()
        } else {
            None
        };

        let custom_user_info = host.get_custom_user_info();
        // The exported profile/call-tree addresses are symbolized in
        // place so the artifact never needs a second pass over `symbols`.
        let mut artifact = build_artifact(
            kind,
            block_duration,
            ring,
            hot_stacks,
            cpu_call_tree,
            live_allocations,
            metadata,
            custom_user_info,
        );
        artifact.symbolize(symbols);

        let bytes = artifact.to_bytes();
        sink.emit(kind, &bytes, &artifact.metadata);
        host.on_dump_emitted(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackSample;
    use crate::threads::ThreadCpu;

    struct NullSink;
    impl DumpSink for NullSink {
        fn emit(&self, _kind: DumpKind, _bytes: &[u8], _metadata: &DumpMetadata) {}
    }

    struct NullHost;
    impl DumpDecisionHost for NullHost {
        fn on_dump_emitted(&self, _kind: DumpKind) {}
    }

    struct NoThreadsApi;
    impl ThreadApi for NoThreadsApi {
        fn enumerate(&self) -> Result<Vec<ThreadHandle>, crate::error::SamplingError> {
            Ok(vec![])
        }
        fn suspend(&self, _h: ThreadHandle) -> Result<(), crate::error::SamplingError> {
            Ok(())
        }
        fn resume(&self, _h: ThreadHandle) -> Result<(), crate::error::SamplingError> {
            Ok(())
        }
        fn cpu_usage(&self, handle: ThreadHandle) -> Result<ThreadCpu, crate::error::SamplingError> {
            Ok(ThreadCpu { handle, pct: 0.0, is_idle: false })
        }
        fn current_thread(&self) -> ThreadHandle {
            ThreadHandle(0)
        }
    }

    #[test]
    fn stall_kind_maps_onto_dump_kind() {
        assert_eq!(DumpKind::from(StallKind::LaunchBlock), DumpKind::LaunchBlock);
    }

    #[test]
    fn produce_emits_without_panicking_on_empty_state() {
        let ring = Ring::new(4);
        ring.push(StackSample::new([0x10, 0x20], 5.0, false));
        let suspender = EnvironmentSuspender::new();
        let api = NoThreadsApi;
        let producer = DumpProducer::new(false, &suspender, &api);
        let mut symbols = SymbolCache::new(std::sync::Arc::new(crate::platform::NullSymbolizer));
        producer.produce(
            DumpKind::Test,
            Duration::from_millis(500),
            &ring,
            &[],
            None,
            &[],
            DumpMetadata::default(),
            &mut symbols,
            &NullHost,
            &NullSink,
            &[],
        );
    }
}
