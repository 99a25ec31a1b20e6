//! Configuration surface (spec §6). One struct, validated setters where the
//! field has a non-trivial domain, `Default` carrying the documented
//! defaults.

use std::time::Duration;

/// Mode for allocation stack-capture (spec §6 `capture_call_stacks_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureStacksMode {
    None,
    #[default]
    AllAllocations,
    ObjectAllocationsOnly,
}

#[derive(Debug, Clone)]
pub struct Config {
    runloop_timeout_us: u64,
    pub runloop_low_threshold_us: u64,
    pub dynamic_threshold_enabled: bool,
    pub sample_interval_us: u64,
    pub cpu_instant_limit_pct: f64,
    pub cpu_sustained_limit_pct: f64,
    pub cpu_sustained_window: Duration,
    pub cpu_sustained_cooldown: Duration,
    pub capture_cpu_hot_stacks: bool,
    pub capture_sustained_cpu_stacks: bool,
    pub daily_dump_quota: u32,
    pub memory_warning_threshold_mb: u64,
    pub suspend_all_threads_on_dump: bool,
    pub sensitive_runloop_hang_detection: bool,
    pub capture_call_stacks_mode: CaptureStacksMode,
    pub skip_min_alloc_size_bytes: u64,
    pub skip_max_stack_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runloop_timeout_us: 2_000_000,
            runloop_low_threshold_us: 600_000,
            dynamic_threshold_enabled: true,
            sample_interval_us: 50_000,
            cpu_instant_limit_pct: 80.0,
            cpu_sustained_limit_pct: 80.0,
            cpu_sustained_window: Duration::from_secs(60),
            cpu_sustained_cooldown: Duration::from_secs(60),
            capture_cpu_hot_stacks: true,
            capture_sustained_cpu_stacks: false,
            daily_dump_quota: 100,
            memory_warning_threshold_mb: 1024,
            suspend_all_threads_on_dump: false,
            sensitive_runloop_hang_detection: false,
            capture_call_stacks_mode: CaptureStacksMode::AllAllocations,
            skip_min_alloc_size_bytes: 0,
            skip_max_stack_depth: 150,
        }
    }
}

/// Lower and upper bound (inclusive) for `runloop_timeout_us`, in
/// microseconds. Values outside this range, or not a multiple of 100ms,
/// are refused (spec §4.4, testable property "threshold setter domain").
pub const RUNLOOP_TIMEOUT_MIN_US: u64 = 400_000;
pub const RUNLOOP_TIMEOUT_MAX_US: u64 = 2_000_000;
const RUNLOOP_TIMEOUT_STEP_US: u64 = 100_000;

impl Config {
    pub fn runloop_timeout_us(&self) -> u64 {
        self.runloop_timeout_us
    }

    /// Set the runloop stall threshold. Accepts only values in
    /// `[400_000, 2_000_000]` that are a multiple of `100_000`; refuses (and
    /// leaves the current threshold untouched) otherwise, or if dynamic
    /// thresholds are disabled.
    pub fn set_runloop_threshold_us(&mut self, threshold_us: u64) -> bool {
        if !self.dynamic_threshold_enabled {
            return false;
        }
        if !is_valid_runloop_threshold(threshold_us) {
            return false;
        }
        self.runloop_timeout_us = threshold_us;
        true
    }

    pub fn lower_runloop_threshold(&mut self) -> bool {
        self.set_runloop_threshold_force(self.runloop_low_threshold_us)
    }

    pub fn recover_runloop_threshold(&mut self, high_value_us: u64) -> bool {
        self.set_runloop_threshold_force(high_value_us)
    }

    /// Internal: lower/recover bypass the dynamic-threshold gate's *domain*
    /// check state (they use caller-configured, already-validated bounds)
    /// but still honor `dynamic_threshold_enabled`.
    fn set_runloop_threshold_force(&mut self, threshold_us: u64) -> bool {
        if !self.dynamic_threshold_enabled || !is_valid_runloop_threshold(threshold_us) {
            return false;
        }
        self.runloop_timeout_us = threshold_us;
        true
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_micros(self.runloop_timeout_us / 2)
    }

    pub fn ring_capacity(&self) -> usize {
        (self.runloop_timeout_us / self.sample_interval_us).max(1) as usize
    }
}

fn is_valid_runloop_threshold(threshold_us: u64) -> bool {
    (RUNLOOP_TIMEOUT_MIN_US..=RUNLOOP_TIMEOUT_MAX_US).contains(&threshold_us)
        && threshold_us % RUNLOOP_TIMEOUT_STEP_US == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_setter_domain() {
        let mut cfg = Config::default();
        assert!(cfg.set_runloop_threshold_us(400_000));
        assert!(cfg.set_runloop_threshold_us(2_000_000));
        assert!(cfg.set_runloop_threshold_us(1_500_000));
        assert!(!cfg.set_runloop_threshold_us(399_999));
        assert!(!cfg.set_runloop_threshold_us(2_000_001));
        assert!(!cfg.set_runloop_threshold_us(1_050_000));
        assert_eq!(cfg.runloop_timeout_us(), 1_500_000);
    }

    #[test]
    fn dynamic_thresholds_disabled_refuses_any_change() {
        let mut cfg = Config::default();
        cfg.dynamic_threshold_enabled = false;
        assert!(!cfg.set_runloop_threshold_us(1_000_000));
        assert!(!cfg.lower_runloop_threshold());
    }

    #[test]
    fn ring_capacity_derives_from_threshold_and_interval() {
        let cfg = Config::default();
        assert_eq!(cfg.ring_capacity(), 40); // 2_000_000 / 50_000
    }
}
