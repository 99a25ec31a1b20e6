//! THREADS — enumeration, suspend/resume, and per-thread CPU (spec §4.2).

use crate::error::SamplingError;
use std::sync::Mutex;

/// Opaque thread handle (a Mach thread port on macOS). Never dereferenced
/// by this module directly — platform code maps it to the real handle
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub u32);

#[derive(Debug, Clone, Default)]
pub struct ThreadSet(pub Vec<ThreadHandle>);

impl ThreadSet {
    pub fn contains(&self, handle: ThreadHandle) -> bool {
        self.0.contains(&handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadCpu {
    pub handle: ThreadHandle,
    /// 0-100 per thread; idle-flagged threads are clamped to 0. The sum
    /// across threads approximates process CPU and can exceed 100 on a
    /// multi-core device (spec §4.2).
    pub pct: f64,
    pub is_idle: bool,
}

/// The platform seam THREADS is built on: enumerate the owning process's
/// threads, suspend/resume an individual one, and read its CPU share.
/// Implemented by `mac::platform_impl::MacThreadApi` on Darwin and by a
/// stub everywhere else (spec §6).
pub trait ThreadApi: Send + Sync {
    fn enumerate(&self) -> Result<Vec<ThreadHandle>, SamplingError>;
    fn suspend(&self, handle: ThreadHandle) -> Result<(), SamplingError>;
    fn resume(&self, handle: ThreadHandle) -> Result<(), SamplingError>;
    fn cpu_usage(&self, handle: ThreadHandle) -> Result<ThreadCpu, SamplingError>;
    fn current_thread(&self) -> ThreadHandle;
    /// OS-reported single-core device-wide CPU percentage, used only as
    /// report context (spec §4.2 "device CPU").
    fn device_cpu_pct(&self) -> Option<f64> {
        None
    }
}

/// Sum of all enumerated threads' CPU percentages — the metric the
/// detectors react to (spec §4.2 "process CPU").
pub fn process_cpu_pct(samples: &[ThreadCpu]) -> f64 {
    samples.iter().map(|t| if t.is_idle { 0.0 } else { t.pct }).sum()
}

/// Captures a suspended peer thread's stack (spec §4.1's peer path, as
/// opposed to ALLOC's self-capture fast path). Callers are responsible for
/// suspending `thread` first; implementations only read registers/memory.
pub trait PeerStackCapture: Send + Sync {
    fn capture(&self, thread: ThreadHandle, max_depth: usize) -> Vec<u64>;
}

/// Guards the process-wide "suspend every peer thread but the caller and
/// an allow-list" critical section (spec §4.1). Internally serialized by a
/// single mutex; nesting a second suspend without an intervening resume is
/// refused rather than silently corrupting bookkeeping.
pub struct EnvironmentSuspendGuard<'a> {
    api: &'a dyn ThreadApi,
    suspended: Vec<ThreadHandle>,
    lock: &'a Mutex<bool>,
}

/// Owns the single mutex serializing suspend/resume regions across
/// callers (spec §5 "Env-suspend mutex").
pub struct EnvironmentSuspender {
    lock: Mutex<bool>,
}

impl Default for EnvironmentSuspender {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentSuspender {
    pub fn new() -> Self {
        EnvironmentSuspender {
            lock: Mutex::new(false),
        }
    }

    /// Suspends every thread in `api.enumerate()` except the caller and
    /// `allow_list`. A peer thread that fails to suspend (e.g.
    /// kernel-blocked) is logged and skipped, not treated as fatal (spec
    /// §5 "Cancellation and timeouts").
    pub fn suspend_environment<'a>(
        &'a self,
        api: &'a dyn ThreadApi,
        allow_list: &[ThreadHandle],
    ) -> Result<EnvironmentSuspendGuard<'a>, SamplingError> {
        let mut in_progress = self.lock.lock().unwrap();
        if *in_progress {
            return Err(SamplingError::SuspendAlreadyInProgress);
        }
        *in_progress = true;
        drop(in_progress);

        let caller = api.current_thread();
        let mut suspended = Vec::new();
        let threads = api.enumerate().unwrap_or_default();
        for thread in threads {
            if thread == caller || allow_list.contains(&thread) {
                continue;
            }
            match api.suspend(thread) {
                Ok(()) => suspended.push(thread),
                Err(err) => {
                    log::warn!("suspend_environment: failed to suspend {thread:?}: {err}");
                }
            }
        }

        Ok(EnvironmentSuspendGuard {
            api,
            suspended,
            lock: &self.lock,
        })
    }
}

impl Drop for EnvironmentSuspendGuard<'_> {
    fn drop(&mut self) {
        for thread in self.suspended.drain(..) {
            if let Err(err) = self.api.resume(thread) {
                log::warn!("resume_environment: failed to resume {thread:?}: {err}");
            }
        }
        *self.lock.lock().unwrap() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeThreadApi {
        threads: Vec<ThreadHandle>,
        caller: ThreadHandle,
        suspend_calls: AtomicUsize,
        resume_calls: AtomicUsize,
        fail_suspend_for: StdMutex<Vec<ThreadHandle>>,
    }

    impl ThreadApi for FakeThreadApi {
        fn enumerate(&self) -> Result<Vec<ThreadHandle>, SamplingError> {
            Ok(self.threads.clone())
        }
        fn suspend(&self, handle: ThreadHandle) -> Result<(), SamplingError> {
            self.suspend_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_suspend_for.lock().unwrap().contains(&handle) {
                return Err(SamplingError::Ignorable("test", crate::error::KernelError::Failure));
            }
            Ok(())
        }
        fn resume(&self, _handle: ThreadHandle) -> Result<(), SamplingError> {
            self.resume_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn cpu_usage(&self, handle: ThreadHandle) -> Result<ThreadCpu, SamplingError> {
            Ok(ThreadCpu { handle, pct: 0.0, is_idle: false })
        }
        fn current_thread(&self) -> ThreadHandle {
            self.caller
        }
    }

    #[test]
    fn suspend_skips_caller_and_allow_list() {
        let api = FakeThreadApi {
            threads: vec![ThreadHandle(1), ThreadHandle(2), ThreadHandle(3)],
            caller: ThreadHandle(1),
            suspend_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            fail_suspend_for: StdMutex::new(Vec::new()),
        };
        let suspender = EnvironmentSuspender::new();
        let guard = suspender
            .suspend_environment(&api, &[ThreadHandle(2)])
            .unwrap();
        assert_eq!(api.suspend_calls.load(Ordering::SeqCst), 1); // only thread 3
        drop(guard);
        assert_eq!(api.resume_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_suspend_is_refused() {
        let api = FakeThreadApi {
            threads: vec![ThreadHandle(1)],
            caller: ThreadHandle(99),
            suspend_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            fail_suspend_for: StdMutex::new(Vec::new()),
        };
        let suspender = EnvironmentSuspender::new();
        let _guard = suspender.suspend_environment(&api, &[]).unwrap();
        let err = suspender.suspend_environment(&api, &[]).unwrap_err();
        assert_eq!(err, SamplingError::SuspendAlreadyInProgress);
    }

    #[test]
    fn a_thread_that_fails_to_suspend_is_skipped_not_fatal() {
        let api = FakeThreadApi {
            threads: vec![ThreadHandle(1), ThreadHandle(2)],
            caller: ThreadHandle(99),
            suspend_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            fail_suspend_for: StdMutex::new(vec![ThreadHandle(1)]),
        };
        let suspender = EnvironmentSuspender::new();
        let guard = suspender.suspend_environment(&api, &[]).unwrap();
        assert_eq!(guard.suspended.len(), 1);
        assert_eq!(guard.suspended[0], ThreadHandle(2));
    }

    #[test]
    fn process_cpu_sums_non_idle_threads() {
        let samples = vec![
            ThreadCpu { handle: ThreadHandle(1), pct: 80.0, is_idle: false },
            ThreadCpu { handle: ThreadHandle(2), pct: 50.0, is_idle: true },
            ThreadCpu { handle: ThreadHandle(3), pct: 20.0, is_idle: false },
        ];
        assert_eq!(process_cpu_pct(&samples), 100.0);
    }
}
