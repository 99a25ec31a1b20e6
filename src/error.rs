//! Error taxonomy (spec §7): init errors abort subsystem setup, runtime soft
//! errors degrade to an absent result, runtime hard errors disable a
//! subsystem and surface a code. No panics on these paths.

use thiserror::Error;

/// Failures that can occur while standing up a subsystem. All of these
/// leave the subsystem inert; the caller gets a bool/code back, never a
/// panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("failed to spawn a working thread")]
    WorkingThreadCreateFailed,
    #[error("failed to open the stack-frames table file")]
    StackTableFileOpenFailed,
    #[error("failed to open the live-allocation table file")]
    AllocTableFileOpenFailed,
    #[error("an external allocation-instrumentation tool is already attached")]
    AnalysisToolRunning,
    #[error("mmap of a database file failed")]
    MmapFailed,
    #[error("ftruncate of a database file failed")]
    FtruncateFailed,
}

/// Soft failures encountered while sampling a single thread or stack.
/// These never abort the sampler loop; the caller gets `Ok(false)` (thread
/// gone) or the sample is shortened to "no data".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplingError {
    #[error("{0}: thread has terminated ({1})")]
    ThreadTerminated(&'static str, KernelError),
    #[error("{0}: ignorable kernel error ({1})")]
    Ignorable(&'static str, KernelError),
    #[error("{0}: fatal kernel error ({1})")]
    Fatal(&'static str, KernelError),
    #[error("environment suspension is already in progress")]
    SuspendAlreadyInProgress,
    #[error("this platform does not support native stack capture")]
    Unsupported,
}

/// A minimal mirror of the Mach `kern_return_t` space, widened to cover
/// any platform's thread/register-query failures without leaking the
/// platform type into callers that don't care which OS they're on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("specified address is not currently valid")]
    InvalidAddress,
    #[error("the function requested was not applicable, or an argument is invalid")]
    InvalidArgument,
    #[error("the operation could not be performed")]
    Failure,
    #[error("a system resource could not be allocated")]
    ResourceShortage,
    #[error("the destination port for a send is invalid: target has likely exited")]
    MachSendInvalidDest,
    #[error("target task or thread is not active (already terminated)")]
    Terminated,
    #[error("unrecognized low-level error code {0}")]
    Other(i32),
}

/// Hard errors: the owning subsystem (currently only ALLOC can hit this at
/// runtime) disables itself and all further calls become no-ops returning
/// this code, until an explicit shutdown + re-enable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("drain thread encountered a corrupted event record (unknown kind {0})")]
    DataCorrupted(u8),
    #[error("subsystem is disabled after a previous hard error")]
    Disabled,
}

/// Why a dump decision was filtered instead of producing an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// Point-Stack depth below the meaningful-stack minimum.
    Meaningless,
    /// Same stack fingerprint fired within the annealing cooldown window.
    Annealing,
    /// The daily dump quota has been exhausted.
    TooMuch,
}
