//! MAIN — main-thread stall detector and adaptive runloop timeout
//! (spec §4.4).

use crate::error::FilterReason;
use std::time::{Duration, Instant};

/// The two edge hooks the event loop under observation is instrumented
/// with (spec §4.4).
#[derive(Debug, Default)]
pub struct ActivityClock {
    last_activity_start: Option<Instant>,
    last_activity_end: Option<Instant>,
    /// Set once the very first activity has completed since process start
    /// (spec §4.4 `LaunchBlock`: "stall observed before the initial
    /// activity completed since process start").
    initial_activity_completed: bool,
    /// Wall-clock timestamp of the last "platform announced imminent
    /// suspend" notification, used to exclude suspended wall time from
    /// `since_start` (spec §4.4 "Suspend-wake compensation").
    suspended_since: Option<Instant>,
    suspended_total: Duration,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity_starting(&mut self, now: Instant) {
        self.last_activity_start = Some(now);
    }

    pub fn activity_ending(&mut self, now: Instant) {
        self.last_activity_end = Some(now);
        self.initial_activity_completed = true;
    }

    pub fn app_will_suspend(&mut self, now: Instant) {
        self.suspended_since = Some(now);
    }

    pub fn app_did_resume(&mut self, now: Instant) {
        if let Some(since) = self.suspended_since.take() {
            self.suspended_total += now.saturating_duration_since(since);
        }
    }

    /// `(since_start, in_flight)` per spec §4.4 step 2, with suspended
    /// wall time subtracted out so a device sleep doesn't masquerade as a
    /// stall.
    fn since_start(&self, now: Instant) -> (Duration, bool) {
        let (Some(start), end) = (self.last_activity_start, self.last_activity_end) else {
            return (Duration::ZERO, false);
        };
        let in_flight = match end {
            Some(end) => start > end,
            None => true,
        };
        let raw = now.saturating_duration_since(start);
        (raw.saturating_sub(self.suspended_total), in_flight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallKind {
    MainThreadBlock,
    BackgroundMainThreadBlock,
    BlockThreadTooMuch,
    CpuBlock,
    LaunchBlock,
}

/// A main-thread stall decision the sampler tick produced.
#[derive(Debug, Clone, Copy)]
pub struct StallDecision {
    pub kind: StallKind,
    pub block_duration: Duration,
}

/// Tracks the meaningless/annealing/quota filtering state (spec §4.4
/// "Filtering").
pub struct DumpFilter {
    min_point_stack_depth: usize,
    annealing_window: Duration,
    daily_quota: u32,
    emitted_today: u32,
    last_fingerprint: Option<(u64, Instant)>,
}

impl DumpFilter {
    pub fn new(min_point_stack_depth: usize, annealing_window: Duration, daily_quota: u32) -> Self {
        DumpFilter {
            min_point_stack_depth,
            annealing_window,
            daily_quota,
            emitted_today: 0,
            last_fingerprint: None,
        }
    }

    /// `fingerprint` is typically a hash of the Point-Stack's frame
    /// addresses.
    pub fn check(&mut self, depth: usize, fingerprint: u64, now: Instant) -> Result<(), FilterReason> {
        if depth < self.min_point_stack_depth {
            return Err(FilterReason::Meaningless);
        }
        if let Some((last_fp, last_time)) = self.last_fingerprint {
            if last_fp == fingerprint && now.saturating_duration_since(last_time) < self.annealing_window {
                return Err(FilterReason::Annealing);
            }
        }
        if self.emitted_today >= self.daily_quota {
            return Err(FilterReason::TooMuch);
        }
        Ok(())
    }

    pub fn record_emission(&mut self, fingerprint: u64, now: Instant) {
        self.emitted_today += 1;
        self.last_fingerprint = Some((fingerprint, now));
    }

    pub fn reset_daily_quota(&mut self) {
        self.emitted_today = 0;
    }
}

/// The per-tick decision inputs the stall detector needs from its
/// surroundings, gathered independently of this module so that the
/// state-machine logic itself stays free of I/O.
pub struct TickContext {
    pub now: Instant,
    pub threshold: Duration,
    pub is_backgrounded: bool,
    pub thread_count: usize,
    pub cpu_block_overlaps: bool,
}

/// Evaluates one sampler tick against the activity clock (spec §4.4 steps
/// 2-3). Returns the classified stall, if any; does not mutate state or
/// perform filtering — callers combine this with [`DumpFilter`].
pub fn classify_tick(clock: &ActivityClock, ctx: &TickContext) -> Option<StallDecision> {
    let (since_start, in_flight) = clock.since_start(ctx.now);
    if !in_flight || since_start < ctx.threshold {
        return None;
    }

    let kind = if !clock.initial_activity_completed {
        StallKind::LaunchBlock
    } else if ctx.cpu_block_overlaps {
        StallKind::CpuBlock
    } else if ctx.thread_count > 64 {
        StallKind::BlockThreadTooMuch
    } else if ctx.is_backgrounded {
        StallKind::BackgroundMainThreadBlock
    } else {
        StallKind::MainThreadBlock
    };

    Some(StallDecision {
        kind,
        block_duration: since_start,
    })
}

/// Foreground-only single-iteration hang signal (spec §4.4 "sensitive"
/// mode), independent of the multi-sample stall detector above.
pub struct RunloopHangDetector {
    threshold: Duration,
}

impl RunloopHangDetector {
    pub fn new(threshold: Duration) -> Self {
        RunloopHangDetector { threshold }
    }

    pub fn check_iteration(&self, iteration_duration: Duration) -> bool {
        iteration_duration >= self.threshold
    }
}

impl Default for RunloopHangDetector {
    fn default() -> Self {
        RunloopHangDetector::new(Duration::from_millis(250))
    }
}
