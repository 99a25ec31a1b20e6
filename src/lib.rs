//! Core of an on-device performance-monitoring agent: the register-walking
//! unwinder (STACK), the main-thread stall detector (MAIN), the
//! sustained-CPU detector (CPU), and the allocation-provenance pipeline
//! (ALLOC), wired together by [`agent::Agent`].
//!
//! Everything outside this crate — symbolization, report upload, process
//! lifecycle plumbing, the plugin host — is a caller-supplied collaborator
//! behind the traits in [`platform`].

pub mod agent;
pub mod alloc;
pub mod buf;
pub mod calltree;
pub mod config;
pub mod cpu;
pub mod db;
pub mod dump;
pub mod error;
pub mod platform;
pub mod ring;
pub mod stack;
pub mod stall;
pub mod threads;

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(not(target_os = "macos"))]
pub mod unsupported;

pub use agent::{Agent, AgentHandles};
pub use config::Config;
pub use error::{FilterReason, InitError, KernelError, RuntimeError, SamplingError};
