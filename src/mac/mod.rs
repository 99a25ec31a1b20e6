//! Darwin platform glue: the only place in the crate that calls into Mach
//! directly. Everything above this module talks to the portable traits in
//! `platform.rs`/`threads.rs`/`alloc.rs`.

mod kernel_result;
mod stack_capture;
mod thread_api;

pub use kernel_result::into_kernel_error;
pub use stack_capture::{capture_peer_registers, MacPeerStackCapture, MacSelfStackCapture, PeerStackMemory};
pub use thread_api::MacThreadApi;
