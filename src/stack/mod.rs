//! STACK — register-walking stack unwinder (spec §4.1).
//!
//! This is the load-bearing primitive every other subsystem depends on.
//! Grounded on `perfrecord/src/proc_maps.rs::get_backtrace` /
//! `do_frame_pointer_stackwalk` (the mach-suspend, read-16-bytes-at-FP
//! shape) and `samply-in-process/src/mac/thread_profiler_in_process.rs`'s
//! in-process variant, which reads the sampled thread's own stack memory
//! directly instead of going through `mach_vm_read`.

pub mod cursor;
mod memory;
pub mod sample;
pub mod symbol;

pub use memory::{read_frame_pair, SliceMemory, StackMemory};

pub use cursor::StackCursor;
pub use sample::StackSample;
pub use symbol::{SymbolCache, SymbolizedFrame};

use crate::threads::{ThreadHandle, ThreadSet};

/// Hard ceiling on walked frames (spec §3/§4.1): past this depth a walk is
/// assumed to have wandered into corrupted memory and is abandoned with
/// `given_up` set, rather than walked indefinitely.
pub const MAX_FRAME_DEPTH: usize = 150;

/// Architecture-specific pointer-authentication / alignment de-tag applied
/// before a return address is treated as a memory address (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTagBits {
    /// Strip the low bit (e.g. Thumb-mode tagging).
    One,
    /// Strip the low two bits (e.g. pointer-authentication / alignment).
    Two,
}

pub fn strip_tag_bits(address: u64, bits: AddressTagBits) -> u64 {
    match bits {
        AddressTagBits::One => address & !0x1,
        AddressTagBits::Two => address & !0x3,
    }
}

/// Converts a yielded return address into the call-site address used for
/// symbol lookup (spec §3/§4.1: "subtracts 1 to convert a return address
/// to its originating call-site address").
pub fn return_address_to_call_site(address: u64, tag_bits: AddressTagBits) -> u64 {
    strip_tag_bits(address, tag_bits).wrapping_sub(1)
}

/// The register set captured at the moment of a `MachineContext` snapshot.
/// Meaningful only when the owning context is [`MachineContext::observable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSet {
    pub pc: u64,
    pub fp: u64,
    pub sp: u64,
    pub lr: u64,
    pub gprs: [u64; 29],
    pub exception: Option<ExceptionRegisters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionRegisters {
    pub exception_type: u32,
    pub far: u64,
    pub esr: u32,
}

/// Per-thread capability record (spec §3). Created empty, populated once,
/// consumed by zero or more [`StackCursor`]s, and dropped. Storage is
/// caller-owned — this struct is meant to live on the use site's stack.
pub struct MachineContext {
    pub thread: ThreadHandle,
    /// False when the context was captured for the caller's own thread
    /// outside of a signal frame — its register set is meaningless and was
    /// never populated.
    observable: bool,
    pub crashed: bool,
    registers: RegisterSet,
    /// Meaningful only for a crashed/signal-captured context.
    peer_threads: Option<ThreadSet>,
}

impl MachineContext {
    /// An empty context for `thread`, not yet populated.
    pub fn empty(thread: ThreadHandle) -> Self {
        MachineContext {
            thread,
            observable: false,
            crashed: false,
            registers: RegisterSet::default(),
            peer_threads: None,
        }
    }

    /// Populate from a suspended peer thread's register snapshot.
    pub fn populate_from_peer(&mut self, registers: RegisterSet) {
        self.registers = registers;
        self.observable = true;
    }

    /// Populate from a signal handler's saved context. Unlike a peer
    /// snapshot, a signal-derived context may legitimately describe the
    /// calling thread itself and is still observable (spec §4.1 exception
    /// clause), and it additionally carries the peer-thread set valid at
    /// capture time.
    pub fn populate_from_signal(&mut self, registers: RegisterSet, peers: ThreadSet) {
        self.registers = registers;
        self.observable = true;
        self.crashed = true;
        self.peer_threads = Some(peers);
    }

    pub fn observable(&self) -> bool {
        self.observable
    }

    pub fn registers(&self) -> Option<&RegisterSet> {
        self.observable.then_some(&self.registers)
    }

    pub fn peer_threads(&self) -> Option<&ThreadSet> {
        if self.crashed {
            self.peer_threads.as_ref()
        } else {
            None
        }
    }
}
