//! External collaborators (spec §6). The core never assumes a concrete
//! platform, transport, or host — it calls through these trait objects.
//! Out of scope for this crate: symbol resolution, report upload, process
//! lifecycle wiring, and the plugin host all live on the caller's side of
//! these seams.

use crate::dump::DumpKind;
use serde::Serialize;
use std::time::Duration;

/// `address -> {module_base, module_path, symbol_addr, symbol_name}`.
/// Pure and expected to be cached by the caller (STACK keeps its own small
/// cache over this, see `stack::symbol::SymbolCache`).
pub trait Symbolizer: Send + Sync {
    fn symbolize(&self, address: u64) -> Option<SymbolInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolInfo {
    pub module_base: Option<u64>,
    pub module_name: Option<String>,
    pub symbol_addr: Option<u64>,
    pub symbol_name: Option<String>,
}

/// A symbolizer that never resolves anything; useful as a default and in
/// tests where addresses are synthetic.
pub struct NullSymbolizer;

impl Symbolizer for NullSymbolizer {
    fn symbolize(&self, _address: u64) -> Option<SymbolInfo> {
        None
    }
}

/// Persist an artifact and hand it to upload transport (spec §4.9, §6).
pub trait DumpSink: Send + Sync {
    fn emit(&self, kind: DumpKind, bytes: &[u8], metadata: &DumpMetadata);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DumpMetadata {
    pub os_version: String,
    pub cpu_architecture: String,
    pub physical_memory_bytes: u64,
    pub thermal_state: ThermalState,
    pub cpu_pct_at_capture: f64,
    pub scene: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// The small capability-set a caller-owned object graph exposes back to
/// the core (spec §9, "delegate / observer callbacks for dump decisions").
/// The core never calls back into an owning object graph — only into this
/// interface.
pub trait DumpDecisionHost: Send + Sync {
    fn on_dump_emitted(&self, kind: DumpKind);
    fn get_custom_user_info(&self) -> Option<serde_json::Value> {
        None
    }
    fn on_threshold_changed(&self, new_threshold_us: u64) {
        let _ = new_threshold_us;
    }
    fn on_stall_detected(&self, kind: DumpKind, block_duration: Duration) {
        let _ = (kind, block_duration);
    }
}

/// Process lifecycle hooks (spec §6). The caller drives these from
/// whatever platform notifications it observes; the core only reacts.
pub trait ProcessLifecycle {
    fn app_foregrounded(&self);
    fn app_backgrounded(&self);
    fn app_will_suspend(&self);
    fn app_did_resume(&self);
    fn thermal_state_changed(&self, state: ThermalState);
    fn image_loaded(&self, uuid: [u8; 16], load_address: u64, path: &str);
    fn image_unloaded(&self, uuid: [u8; 16]);
}
