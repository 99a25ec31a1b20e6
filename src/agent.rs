//! Composition root (spec §2): wires THREADS, STACK, RING, MAIN, CPU,
//! ALLOC, DB, and DUMP into one running agent. Grounded on
//! `samply-in-process/src/mac/profiler.rs`'s `RunningProfiler` shape — a
//! command channel feeding a dedicated sampler thread, joined on shutdown
//! — generalized here to carry the full stall/CPU/allocation pipeline
//! rather than just a sampling loop.

use crate::alloc::{drain_once, next_drain_sleep, AllocPipeline};
use crate::calltree::CallTree;
use crate::config::Config;
use crate::cpu::{build_call_tree, BackgroundCpuFloor, CpuDetector, CpuTickResult, HotStack, SamplePool};
use crate::db::{AllocRow, Database, RunMetadata};
use crate::dump::DumpProducer;
use crate::error::InitError;
use crate::platform::{DumpDecisionHost, DumpMetadata, DumpSink, ProcessLifecycle, Symbolizer, ThermalState};
use crate::ring::Ring;
use crate::stack::{SymbolCache, MAX_FRAME_DEPTH};
use crate::stall::{classify_tick, ActivityClock, DumpFilter, RunloopHangDetector, StallKind, TickContext};
use crate::threads::{process_cpu_pct, EnvironmentSuspender, PeerStackCapture, ThreadApi, ThreadHandle};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A one-shot rendezvous for the sampler thread to pull a consistent
/// live-allocation snapshot out of the drain thread's `Database`, which it
/// does not otherwise touch (spec §4.8/§4.9: "a dump's live_allocations
/// come from the table the drain thread alone writes"). The sampler stores
/// a fresh sender before a dump and the drain loop answers it once per
/// iteration; a dump proceeds with an empty snapshot if the drain thread
/// doesn't answer before the timeout rather than blocking indefinitely.
type SnapshotRequest = Arc<Mutex<Option<Sender<Vec<AllocRow>>>>>;

fn request_live_allocations(request: &SnapshotRequest, timeout: Duration) -> Vec<AllocRow> {
    let (tx, rx) = bounded(1);
    *request.lock().unwrap() = Some(tx);
    rx.recv_timeout(timeout).unwrap_or_default()
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn hash_addresses(addresses: &[u64]) -> u64 {
    use std::hash::Hasher;
    let mut hasher = rustc_hash::FxHasher::default();
    for addr in addresses {
        hasher.write_u64(*addr);
    }
    hasher.finish()
}

enum Command {
    ActivityStarting(Instant),
    ActivityEnding(Instant),
    AppWillSuspend(Instant),
    AppDidResume(Instant),
    Backgrounded(bool),
    ThermalStateChanged(ThermalState),
    Shutdown,
}

/// The caller-supplied platform collaborators an [`Agent`] is wired
/// against (spec §6). Bundled together so `Agent::start` takes one
/// argument instead of five.
pub struct AgentHandles {
    pub thread_api: Arc<dyn ThreadApi>,
    pub peer_stack_capture: Arc<dyn PeerStackCapture>,
    pub self_stack_capture: Arc<dyn crate::alloc::SelfStackCapture>,
    pub symbolizer: Arc<dyn Symbolizer>,
    pub dump_sink: Arc<dyn DumpSink>,
    pub dump_host: Arc<dyn DumpDecisionHost>,
}

/// A running agent: a sampler thread ticking MAIN's stall detector and
/// CPU's sustained-usage detector against RING, plus (once enabled) a
/// drain thread applying ALLOC's buffered events to the on-disk tables
/// (spec §2's overall control flow).
pub struct Agent {
    commands: Sender<Command>,
    sampler_thread: Option<JoinHandle<()>>,
    drain_thread: Option<JoinHandle<()>>,
    alloc: Arc<AllocPipeline>,
    shutdown: Arc<AtomicBool>,
    config: Arc<Mutex<Config>>,
    dump_host: Arc<dyn DumpDecisionHost>,
}

impl Agent {
    /// Starts the agent: spawns the sampler thread immediately, and the
    /// drain thread once [`Agent::enable_allocation_tracking`] is called
    /// (spec §4.8 "Startup gating" — ALLOC is opt-in, separate from the
    /// always-on MAIN/CPU sampler).
    pub fn start(
        config: Config,
        run_dir: impl AsRef<Path>,
        run_metadata: RunMetadata,
        handles: AgentHandles,
    ) -> Result<Self, InitError> {
        let main_thread = handles.thread_api.current_thread();
        let config = Arc::new(Mutex::new(config));
        let shutdown = Arc::new(AtomicBool::new(false));
        let dump_host = handles.dump_host.clone();
        let (tx, rx) = unbounded::<Command>();
        let snapshot_request: SnapshotRequest = Arc::new(Mutex::new(None));

        let alloc = Arc::new(AllocPipeline::new(
            &config.lock().unwrap().clone(),
            handles.self_stack_capture.clone(),
            16,
        ));

        let sampler_config = config.clone();
        let sampler_snapshot_request = snapshot_request.clone();
        let sampler_thread = thread::spawn(move || {
            run_sampler_loop(main_thread, handles, sampler_config, rx, sampler_snapshot_request);
        });

        let run_dir = run_dir.as_ref().to_path_buf();
        let drain_alloc = alloc.clone();
        let drain_shutdown = shutdown.clone();
        let drain_thread = thread::spawn(move || {
            let mut db = match Database::create(&run_dir, &run_metadata) {
                Ok(db) => db,
                Err(err) => {
                    log::error!("allocation drain thread: failed to open database: {err}");
                    return;
                }
            };
            let mut sleep = Duration::ZERO;
            while !drain_shutdown.load(Ordering::Acquire) {
                match drain_once(&drain_alloc.queue(), drain_alloc.pool(), &mut db, now_us()) {
                    Ok(had_work) => sleep = next_drain_sleep(had_work, sleep),
                    Err(err) => {
                        log::error!("allocation drain thread: {err}");
                        break;
                    }
                }
                if let Some(sender) = snapshot_request.lock().unwrap().take() {
                    let _ = sender.send(db.alloc_table.snapshot());
                }
                thread::sleep(sleep);
            }
        });

        Ok(Agent {
            commands: tx,
            sampler_thread: Some(sampler_thread),
            drain_thread: Some(drain_thread),
            alloc,
            shutdown,
            config,
            dump_host,
        })
    }

    /// Enables ALLOC's hook dispatch (spec §4.8 "Startup gating": refuses
    /// if a competing instrumentation tool's environment probes are set).
    pub fn enable_allocation_tracking(&self, env: &dyn Fn(&str) -> Option<String>) -> Result<(), InitError> {
        crate::alloc::check_no_competing_tool(env)?;
        self.alloc.enable();
        Ok(())
    }

    pub fn disable_allocation_tracking(&self) {
        self.alloc.disable();
    }

    /// Live-edits the runloop threshold (spec §4.4 "dynamic threshold").
    pub fn set_runloop_threshold_us(&self, threshold_us: u64) -> bool {
        let changed = self.config.lock().unwrap().set_runloop_threshold_us(threshold_us);
        if changed {
            self.dump_host.on_threshold_changed(threshold_us);
        }
        changed
    }

    /// Drops the runloop threshold to its configured low value (spec §4.4
    /// "dynamic threshold... lowers it under e.g. thermal pressure").
    pub fn lower_runloop_threshold(&self) -> bool {
        let mut cfg = self.config.lock().unwrap();
        let changed = cfg.lower_runloop_threshold();
        let new_threshold = cfg.runloop_timeout_us();
        drop(cfg);
        if changed {
            self.dump_host.on_threshold_changed(new_threshold);
        }
        changed
    }

    /// Restores the runloop threshold to `high_value_us` once the
    /// condition that triggered [`Agent::lower_runloop_threshold`] clears.
    pub fn recover_runloop_threshold(&self, high_value_us: u64) -> bool {
        let changed = self.config.lock().unwrap().recover_runloop_threshold(high_value_us);
        if changed {
            self.dump_host.on_threshold_changed(high_value_us);
        }
        changed
    }

    fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

impl ProcessLifecycle for Agent {
    fn app_foregrounded(&self) {
        self.send(Command::Backgrounded(false));
    }

    fn app_backgrounded(&self) {
        self.send(Command::Backgrounded(true));
    }

    fn app_will_suspend(&self) {
        self.send(Command::AppWillSuspend(Instant::now()));
    }

    fn app_did_resume(&self) {
        self.send(Command::AppDidResume(Instant::now()));
    }

    fn thermal_state_changed(&self, state: ThermalState) {
        self.send(Command::ThermalStateChanged(state));
    }

    fn image_loaded(&self, uuid: [u8; 16], load_address: u64, path: &str) {
        log::debug!("image loaded: {path} @ {load_address:#x} ({uuid:02x?})");
    }

    fn image_unloaded(&self, uuid: [u8; 16]) {
        log::debug!("image unloaded: {uuid:02x?}");
    }
}

/// Activity-loop instrumentation (spec §4.4): the caller's event loop
/// calls these at the start/end of each unit of work it processes.
impl Agent {
    pub fn activity_starting(&self) {
        self.send(Command::ActivityStarting(Instant::now()));
    }

    pub fn activity_ending(&self) {
        self.send(Command::ActivityEnding(Instant::now()));
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.send(Command::Shutdown);
        if let Some(handle) = self.sampler_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.drain_thread.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_lines)]
fn run_sampler_loop(
    main_thread: ThreadHandle,
    handles: AgentHandles,
    config: Arc<Mutex<Config>>,
    commands: crossbeam_channel::Receiver<Command>,
    snapshot_request: SnapshotRequest,
) {
    let mut clock = ActivityClock::new();
    let mut backgrounded = false;
    let mut ring = Ring::new(config.lock().unwrap().ring_capacity());
    let mut filter = {
        let cfg = config.lock().unwrap();
        DumpFilter::new(3, Duration::from_secs(30), cfg.daily_dump_quota)
    };
    let (cpu_limit, cpu_window, cpu_cooldown) = {
        let cfg = config.lock().unwrap();
        (cfg.cpu_sustained_limit_pct, cfg.cpu_sustained_window, cfg.cpu_sustained_cooldown)
    };
    let mut cpu_detector = CpuDetector::new(cpu_limit, cpu_window, cpu_cooldown);
    let mut bg_floor = BackgroundCpuFloor::new(Duration::from_secs(300));
    let mut hot_pool = SamplePool::new(100);
    let suspender = EnvironmentSuspender::new();
    let mut symbols = SymbolCache::new(handles.symbolizer.clone());
    let hang_detector = RunloopHangDetector::default();
    let mut last_tick = Instant::now();

    'outer: loop {
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::ActivityStarting(at) => clock.activity_starting(at),
                Command::ActivityEnding(at) => clock.activity_ending(at),
                Command::AppWillSuspend(at) => clock.app_will_suspend(at),
                Command::AppDidResume(at) => clock.app_did_resume(at),
                Command::Backgrounded(bg) => backgrounded = bg,
                Command::ThermalStateChanged(_) => {}
                Command::Shutdown => break 'outer,
            }
        }

        let now = Instant::now();
        let tick_period = now.saturating_duration_since(last_tick);
        last_tick = now;

        if config.lock().unwrap().sensitive_runloop_hang_detection
            && !backgrounded
            && hang_detector.check_iteration(tick_period)
        {
            handles.dump_host.on_stall_detected(crate::dump::DumpKind::MainThreadBlock, tick_period);
        }

        let cpu_samples = handles
            .thread_api
            .enumerate()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|thread| handles.thread_api.cpu_usage(thread).ok())
            .collect::<Vec<_>>();
        let process_cpu = process_cpu_pct(&cpu_samples);
        let main_cpu_pct = cpu_samples
            .iter()
            .find(|sample| sample.handle == main_thread)
            .map_or(0.0, |sample| sample.pct);

        if handles.thread_api.suspend(main_thread).is_ok() {
            let addresses = handles.peer_stack_capture.capture(main_thread, MAX_FRAME_DEPTH);
            let _ = handles.thread_api.resume(main_thread);
            ring.push(crate::stack::StackSample::new(addresses, main_cpu_pct, backgrounded));
        }

        let threshold = Duration::from_micros(config.lock().unwrap().runloop_timeout_us());
        let ctx = TickContext {
            now,
            threshold,
            is_backgrounded: backgrounded,
            thread_count: cpu_samples.len(),
            cpu_block_overlaps: cpu_detector.state() == crate::cpu::CpuState::Tracking,
        };
        if let Some(decision) = classify_tick(&clock, &ctx) {
            if let Some(point_stack) = ring.point_stack() {
                let fingerprint = hash_addresses(point_stack.sample.addresses());
                if filter.check(point_stack.depth(), fingerprint, now).is_ok() {
                    filter.record_emission(fingerprint, now);
                    emit_dump(
                        decision.kind.into(),
                        decision.block_duration,
                        &ring,
                        &[],
                        None,
                        &config,
                        &suspender,
                        &handles,
                        &mut symbols,
                        main_thread,
                        &snapshot_request,
                    );
                }
            }
        }

        let cfg_snapshot = config.lock().unwrap().clone();
        if cfg_snapshot.capture_cpu_hot_stacks && process_cpu > cfg_snapshot.cpu_instant_limit_pct {
            for sample in &cpu_samples {
                if sample.is_idle || sample.handle == main_thread {
                    continue;
                }
                if handles.thread_api.suspend(sample.handle).is_ok() {
                    let addresses = handles.peer_stack_capture.capture(sample.handle, MAX_FRAME_DEPTH);
                    let _ = handles.thread_api.resume(sample.handle);
                    hot_pool.push(crate::stack::StackSample::new(addresses, sample.pct, backgrounded));
                }
            }
        }

        if cfg_snapshot.capture_sustained_cpu_stacks {
            if let CpuTickResult::Fired = cpu_detector.tick(process_cpu, tick_period) {
                let frozen = hot_pool.freeze();
                let tree = build_call_tree(&frozen, &mut symbols);
                let hot_stacks: Vec<HotStack> = Vec::new();
                emit_dump(
                    crate::dump::DumpKind::SustainedCpu,
                    cpu_window,
                    &ring,
                    &hot_stacks,
                    Some(tree),
                    &config,
                    &suspender,
                    &handles,
                    &mut symbols,
                    main_thread,
                    &snapshot_request,
                );
            }
        } else {
            cpu_detector.tick(process_cpu, tick_period);
        }

        bg_floor.accumulate(process_cpu, tick_period);

        thread::sleep(config.lock().unwrap().check_period());
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_dump(
    kind: crate::dump::DumpKind,
    block_duration: Duration,
    ring: &Ring,
    hot_stacks: &[HotStack],
    cpu_call_tree: Option<CallTree>,
    config: &Arc<Mutex<Config>>,
    suspender: &EnvironmentSuspender,
    handles: &AgentHandles,
    symbols: &mut SymbolCache,
    main_thread: ThreadHandle,
    snapshot_request: &SnapshotRequest,
) {
    let suspend_on_dump = config.lock().unwrap().suspend_all_threads_on_dump;
    // A short rendezvous with the drain thread (spec §4.8 step 4, "check
    // for a pending snapshot request"); a dump still goes out with an
    // empty live_allocations section if the drain thread doesn't answer
    // in time rather than blocking the sampler indefinitely.
    let live_allocations = request_live_allocations(snapshot_request, Duration::from_millis(50));
    let producer = DumpProducer::new(suspend_on_dump, suspender, handles.thread_api.as_ref());
    producer.produce(
        kind,
        block_duration,
        ring,
        hot_stacks,
        cpu_call_tree,
        &live_allocations,
        DumpMetadata::default(),
        symbols,
        handles.dump_host.as_ref(),
        handles.dump_sink.as_ref(),
        &[main_thread],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SamplingError;
    use crate::platform::NullSymbolizer;
    use crate::threads::ThreadCpu;
    use std::sync::atomic::AtomicUsize;

    struct FakeThreadApi {
        main: ThreadHandle,
    }

    impl ThreadApi for FakeThreadApi {
        fn enumerate(&self) -> Result<Vec<ThreadHandle>, SamplingError> {
            Ok(vec![self.main])
        }
        fn suspend(&self, _handle: ThreadHandle) -> Result<(), SamplingError> {
            Ok(())
        }
        fn resume(&self, _handle: ThreadHandle) -> Result<(), SamplingError> {
            Ok(())
        }
        fn cpu_usage(&self, handle: ThreadHandle) -> Result<ThreadCpu, SamplingError> {
            Ok(ThreadCpu { handle, pct: 0.0, is_idle: true })
        }
        fn current_thread(&self) -> ThreadHandle {
            self.main
        }
    }

    struct FixedPeerStack;
    impl PeerStackCapture for FixedPeerStack {
        fn capture(&self, _thread: ThreadHandle, _max_depth: usize) -> Vec<u64> {
            vec![0x10, 0x20]
        }
    }

    struct FixedSelfStack;
    impl crate::alloc::SelfStackCapture for FixedSelfStack {
        fn capture_self(&self, _max_depth: usize) -> Vec<u64> {
            vec![0x30]
        }
    }

    struct CountingSink(AtomicUsize);
    impl DumpSink for CountingSink {
        fn emit(&self, _kind: crate::dump::DumpKind, _bytes: &[u8], _metadata: &DumpMetadata) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullHost;
    impl DumpDecisionHost for NullHost {
        fn on_dump_emitted(&self, _kind: crate::dump::DumpKind) {}
    }

    #[test]
    fn start_and_immediate_shutdown_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let handles = AgentHandles {
            thread_api: Arc::new(FakeThreadApi { main: ThreadHandle(1) }),
            peer_stack_capture: Arc::new(FixedPeerStack),
            self_stack_capture: Arc::new(FixedSelfStack),
            symbolizer: Arc::new(NullSymbolizer),
            dump_sink: Arc::new(CountingSink(AtomicUsize::new(0))),
            dump_host: Arc::new(NullHost),
        };
        let metadata = crate::db::RunMetadata {
            launch_timestamp_us: 0,
            os_version: "test".into(),
            device_model: "test".into(),
            process_uuid: [0; 16],
            app_uuid: [0; 16],
            scene: None,
        };
        let agent = Agent::start(Config::default(), dir.path(), metadata, handles).unwrap();
        drop(agent);
    }
}
