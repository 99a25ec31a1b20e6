//! CPU — sustained-CPU detector and call-tree aggregator (spec §4.5).

use crate::calltree::CallTree;
use crate::stack::{StackSample, SymbolCache};
use crate::threads::ThreadHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Idle,
    Tracking,
    Cooldown,
}

/// A bounded pool of CPU-hot stacks, overwriting the oldest once full
/// (spec §4.5 "bounded pool (capacity 100 samples, overwriting oldest)").
pub struct SamplePool {
    capacity: usize,
    samples: Vec<StackSample>,
    next: usize,
}

impl SamplePool {
    pub fn new(capacity: usize) -> Self {
        SamplePool {
            capacity: capacity.max(1),
            samples: Vec::new(),
            next: 0,
        }
    }

    pub fn push(&mut self, sample: StackSample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
            self.next = (self.next + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Swaps in a fresh, empty pool and returns the frozen contents (spec
    /// §4.5 "the current sample pool is frozen... and a new empty pool
    /// replaces it").
    pub fn freeze(&mut self) -> Vec<StackSample> {
        std::mem::take(&mut self.samples)
    }
}

/// Outcome of one [`CpuDetector::tick`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuTickResult {
    NoChange,
    /// Sustained-CPU threshold crossed; caller should freeze the pool,
    /// build a call-tree, and route through DUMP.
    Fired,
}

/// The Idle/Tracking/Cooldown averaging-with-annealing state machine
/// (spec §4.5). Holds no stacks itself — callers feed per-tick CPU/period
/// pairs and separately push hot-thread stacks into a [`SamplePool`].
pub struct CpuDetector {
    limit_pct: f64,
    window: Duration,
    cooldown: Duration,
    state: CpuState,
    total_tracking_secs: f64,
    total_cpu_cost: f64,
    cooldown_elapsed: Duration,
}

impl CpuDetector {
    pub fn new(limit_pct: f64, window: Duration, cooldown: Duration) -> Self {
        CpuDetector {
            limit_pct,
            window,
            cooldown,
            state: CpuState::Idle,
            total_tracking_secs: 0.0,
            total_cpu_cost: 0.0,
            cooldown_elapsed: Duration::ZERO,
        }
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    /// Feeds one sampler tick. `tick_period` outside `[0, 5s]` is
    /// discarded (spec §4.5 "tick-period sanity") without affecting state.
    pub fn tick(&mut self, process_cpu_pct: f64, tick_period: Duration) -> CpuTickResult {
        if tick_period > Duration::from_secs(5) {
            return CpuTickResult::NoChange;
        }

        match self.state {
            CpuState::Idle => {
                if process_cpu_pct > self.limit_pct {
                    self.state = CpuState::Tracking;
                    self.total_tracking_secs = 0.0;
                    self.total_cpu_cost = 0.0;
                    self.accumulate(process_cpu_pct, tick_period);
                }
                CpuTickResult::NoChange
            }
            CpuState::Tracking => {
                self.accumulate(process_cpu_pct, tick_period);

                if self.total_cpu_cost < self.limit_pct * self.total_tracking_secs / 2.0 {
                    self.state = CpuState::Idle;
                    return CpuTickResult::NoChange;
                }

                if self.total_tracking_secs >= self.window.as_secs_f64()
                    && self.total_cpu_cost > self.limit_pct * self.total_tracking_secs
                {
                    self.state = CpuState::Cooldown;
                    self.cooldown_elapsed = Duration::ZERO;
                    return CpuTickResult::Fired;
                }
                CpuTickResult::NoChange
            }
            CpuState::Cooldown => {
                self.cooldown_elapsed += tick_period;
                if self.cooldown_elapsed >= self.cooldown {
                    self.state = CpuState::Idle;
                }
                CpuTickResult::NoChange
            }
        }
    }

    fn accumulate(&mut self, process_cpu_pct: f64, tick_period: Duration) {
        self.total_tracking_secs += tick_period.as_secs_f64();
        self.total_cpu_cost += process_cpu_pct * tick_period.as_secs_f64();
    }
}

/// "Is background CPU suspiciously low" probe (spec §4.5 "Background-CPU
/// floor"): a simple windowed average compared against a fixed 6% floor,
/// independent of the Idle/Tracking/Cooldown machine above.
pub struct BackgroundCpuFloor {
    window: Duration,
    elapsed: Duration,
    accumulated_cost: f64,
}

const BACKGROUND_CPU_FLOOR_PCT: f64 = 6.0;

impl BackgroundCpuFloor {
    pub fn new(window: Duration) -> Self {
        BackgroundCpuFloor {
            window,
            elapsed: Duration::ZERO,
            accumulated_cost: 0.0,
        }
    }

    pub fn accumulate(&mut self, process_cpu_pct: f64, tick_period: Duration) {
        self.elapsed += tick_period;
        self.accumulated_cost += process_cpu_pct * tick_period.as_secs_f64();
        if self.elapsed > self.window {
            // Roll the window forward by simple decay rather than a full
            // sample history, since only the steady-state average matters.
            let ratio = self.window.as_secs_f64() / self.elapsed.as_secs_f64();
            self.accumulated_cost *= ratio;
            self.elapsed = self.window;
        }
    }

    pub fn is_suspiciously_low(&self) -> bool {
        if self.elapsed < self.window {
            return false;
        }
        self.accumulated_cost / self.elapsed.as_secs_f64() < BACKGROUND_CPU_FLOOR_PCT
    }
}

/// A single thread's CPU-hot stack, paired with its share at capture time
/// (spec §4.9 "current-CPU-high stacks with per-stack CPU share").
#[derive(Debug, Clone)]
pub struct HotStack {
    pub thread: ThreadHandle,
    pub sample: StackSample,
}

/// Builds a [`CallTree`] from a frozen pool off the sampler thread (spec
/// §4.5 "handed off to an asynchronous builder"). The actual thread
/// handoff is the caller's responsibility (typically via
/// `crossbeam_channel`, matching the drain-thread handoff idiom used
/// elsewhere in this crate); this function is the synchronous unit of
/// work a worker thread runs per handoff.
pub fn build_call_tree(samples: &[StackSample], symbols: &mut SymbolCache) -> CallTree {
    let mut tree = CallTree::build(samples);
    tree.symbolize(symbols);
    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_limit_80() -> CpuDetector {
        CpuDetector::new(80.0, Duration::from_secs(60), Duration::from_secs(60))
    }

    #[test]
    fn idle_stays_idle_below_limit() {
        let mut d = cpu_limit_80();
        assert_eq!(d.tick(50.0, Duration::from_secs(1)), CpuTickResult::NoChange);
        assert_eq!(d.state(), CpuState::Idle);
    }

    #[test]
    fn crossing_limit_enters_tracking() {
        let mut d = cpu_limit_80();
        d.tick(90.0, Duration::from_secs(1));
        assert_eq!(d.state(), CpuState::Tracking);
    }

    #[test]
    fn half_zone_abort_at_39_pct() {
        let mut d = cpu_limit_80();
        d.tick(90.0, Duration::from_secs(1)); // enter tracking
        // Drive the running average down to 39%, below half of 80.
        for _ in 0..5 {
            d.tick(39.0, Duration::from_secs(1));
            if d.state() == CpuState::Idle {
                break;
            }
        }
        assert_eq!(d.state(), CpuState::Idle);
    }

    #[test]
    fn average_at_41_pct_does_not_half_zone_abort() {
        let mut d = cpu_limit_80();
        d.tick(90.0, Duration::from_secs(1));
        for _ in 0..10 {
            d.tick(41.0, Duration::from_secs(1));
        }
        assert_ne!(d.state(), CpuState::Idle);
    }

    #[test]
    fn sustained_high_cpu_fires_after_window() {
        let mut d = cpu_limit_80();
        let mut fired = false;
        for _ in 0..61 {
            if d.tick(90.0, Duration::from_secs(1)) == CpuTickResult::Fired {
                fired = true;
                break;
            }
        }
        assert!(fired);
        assert_eq!(d.state(), CpuState::Cooldown);
    }

    #[test]
    fn cooldown_exclusivity_no_second_fire_within_cooldown() {
        let mut d = cpu_limit_80();
        for _ in 0..61 {
            d.tick(90.0, Duration::from_secs(1));
        }
        assert_eq!(d.state(), CpuState::Cooldown);
        for _ in 0..59 {
            let r = d.tick(90.0, Duration::from_secs(1));
            assert_ne!(r, CpuTickResult::Fired);
        }
        assert_eq!(d.state(), CpuState::Idle);
    }

    #[test]
    fn out_of_range_tick_period_is_discarded() {
        let mut d = cpu_limit_80();
        d.tick(90.0, Duration::from_secs(1));
        let secs_before = d.total_tracking_secs;
        d.tick(90.0, Duration::from_secs(6));
        assert_eq!(d.total_tracking_secs, secs_before);
    }

    #[test]
    fn sample_pool_overwrites_oldest_past_capacity() {
        let mut pool = SamplePool::new(2);
        pool.push(StackSample::new([1], 0.0, false));
        pool.push(StackSample::new([2], 0.0, false));
        pool.push(StackSample::new([3], 0.0, false));
        let frozen = pool.freeze();
        let tops: Vec<_> = frozen.iter().map(|s| s.top()).collect();
        assert_eq!(tops, vec![Some(3), Some(2)]);
    }

    #[test]
    fn background_floor_detects_low_sustained_average() {
        let mut floor = BackgroundCpuFloor::new(Duration::from_secs(10));
        for _ in 0..10 {
            floor.accumulate(2.0, Duration::from_secs(1));
        }
        assert!(floor.is_suspiciously_low());
    }

    #[test]
    fn background_floor_not_low_above_6_pct() {
        let mut floor = BackgroundCpuFloor::new(Duration::from_secs(10));
        for _ in 0..10 {
            floor.accumulate(20.0, Duration::from_secs(1));
        }
        assert!(!floor.is_suspiciously_low());
    }
}
