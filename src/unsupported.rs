//! Stub platform glue for builds targeting anything other than Darwin
//! (spec §6 "Non-goals": no Linux/Android/Windows backend is implemented,
//! but the crate must still build and degrade cleanly there instead of
//! failing to compile).

use crate::alloc::SelfStackCapture;
use crate::error::SamplingError;
use crate::threads::{PeerStackCapture, ThreadApi, ThreadCpu, ThreadHandle};

#[derive(Default)]
pub struct UnsupportedThreadApi;

impl UnsupportedThreadApi {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadApi for UnsupportedThreadApi {
    fn enumerate(&self) -> Result<Vec<ThreadHandle>, SamplingError> {
        Err(SamplingError::Unsupported)
    }

    fn suspend(&self, _handle: ThreadHandle) -> Result<(), SamplingError> {
        Err(SamplingError::Unsupported)
    }

    fn resume(&self, _handle: ThreadHandle) -> Result<(), SamplingError> {
        Err(SamplingError::Unsupported)
    }

    fn cpu_usage(&self, _handle: ThreadHandle) -> Result<ThreadCpu, SamplingError> {
        Err(SamplingError::Unsupported)
    }

    fn current_thread(&self) -> ThreadHandle {
        ThreadHandle(0)
    }
}

#[derive(Default)]
pub struct UnsupportedSelfStackCapture;

impl UnsupportedSelfStackCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelfStackCapture for UnsupportedSelfStackCapture {
    fn capture_self(&self, _max_depth: usize) -> Vec<u64> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct UnsupportedPeerStackCapture;

impl UnsupportedPeerStackCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStackCapture for UnsupportedPeerStackCapture {
    fn capture(&self, _thread: ThreadHandle, _max_depth: usize) -> Vec<u64> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_api_reports_unsupported() {
        let api = UnsupportedThreadApi::new();
        assert_eq!(api.enumerate().unwrap_err(), SamplingError::Unsupported);
    }

    #[test]
    fn self_stack_capture_yields_nothing() {
        let cap = UnsupportedSelfStackCapture::new();
        assert!(cap.capture_self(50).is_empty());
    }

    #[test]
    fn peer_stack_capture_yields_nothing() {
        let cap = UnsupportedPeerStackCapture::new();
        assert!(cap.capture(ThreadHandle(0), 50).is_empty());
    }
}
