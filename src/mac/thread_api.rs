//! [`MacThreadApi`] — THREADS' `ThreadApi` on Darwin (spec §4.2), grounded
//! on `task_threads`/`thread_suspend`/`thread_resume` in
//! `perfrecord/src/proc_maps.rs` and the `THREAD_BASIC_INFO` CPU-time
//! query bindgen'd in `samply-in-process/src/mac/thread_info.rs`.

use super::kernel_result::into_kernel_error;
use crate::error::{KernelError, SamplingError};
use crate::threads::{ThreadApi, ThreadCpu, ThreadHandle};
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_port::mach_port_deallocate;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::thread_act::{thread_info, thread_resume, thread_suspend};
use mach2::traps::{mach_task_self, mach_thread_self};
use mach2::vm::mach_vm_deallocate;
use mach2::vm_types::integer_t;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

const THREAD_BASIC_INFO: u32 = 3;

#[repr(C)]
#[derive(Default)]
struct TimeValue {
    seconds: integer_t,
    microseconds: integer_t,
}

#[repr(C)]
#[derive(Default)]
struct ThreadBasicInfo {
    user_time: TimeValue,
    system_time: TimeValue,
    cpu_usage: integer_t,
    policy: integer_t,
    run_state: integer_t,
    flags: integer_t,
    suspend_count: integer_t,
    sleep_time: integer_t,
}

const THREAD_BASIC_INFO_COUNT: mach_msg_type_number_t =
    (std::mem::size_of::<ThreadBasicInfo>() / std::mem::size_of::<integer_t>()) as mach_msg_type_number_t;

fn map_call_error(call: &'static str, kr: kern_return_t) -> SamplingError {
    let err = into_kernel_error(kr);
    match err {
        KernelError::MachSendInvalidDest | KernelError::Terminated | KernelError::InvalidArgument => {
            SamplingError::ThreadTerminated(call, err)
        }
        _ => SamplingError::Ignorable(call, err),
    }
}

/// Darwin `ThreadApi`. Keeps a small map of each thread's last observed
/// cumulative CPU time so [`ThreadApi::cpu_usage`] can report a percentage
/// over the interval since the previous call, rather than a cumulative
/// total (spec §4.2 "process CPU... per-thread delta over the sampler's
/// own tick period").
pub struct MacThreadApi {
    last_cpu_us: Mutex<HashMap<u32, (u64, Instant)>>,
}

impl Default for MacThreadApi {
    fn default() -> Self {
        MacThreadApi {
            last_cpu_us: Mutex::new(HashMap::new()),
        }
    }
}

impl MacThreadApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn raw_cpu_time_us(handle: ThreadHandle) -> Result<u64, SamplingError> {
        let mut info = ThreadBasicInfo::default();
        let mut count = THREAD_BASIC_INFO_COUNT;
        let kr = unsafe {
            thread_info(
                handle.0 as mach_port_t,
                THREAD_BASIC_INFO,
                &mut info as *mut _ as *mut integer_t,
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(map_call_error("thread_info", kr));
        }
        let user_us = info.user_time.seconds as u64 * 1_000_000 + info.user_time.microseconds as u64;
        let system_us = info.system_time.seconds as u64 * 1_000_000 + info.system_time.microseconds as u64;
        Ok(user_us + system_us)
    }

    /// Drops bookkeeping for threads that are no longer being sampled, so
    /// the map doesn't grow unboundedly across a process's lifetime.
    pub fn forget(&self, handle: ThreadHandle) {
        self.last_cpu_us.lock().unwrap().remove(&handle.0);
    }
}

impl ThreadApi for MacThreadApi {
    fn enumerate(&self) -> Result<Vec<ThreadHandle>, SamplingError> {
        let mut list: *mut mach_port_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        let kr = unsafe { task_threads(mach_task_self(), &mut list, &mut count) };
        if kr != KERN_SUCCESS {
            return Err(map_call_error("task_threads", kr));
        }

        let handles: Vec<ThreadHandle> = (0..count as isize)
            .map(|i| ThreadHandle(unsafe { *list.offset(i) }))
            .collect();

        unsafe {
            mach_vm_deallocate(
                mach_task_self(),
                list as u64,
                (count as usize * std::mem::size_of::<mach_port_t>()) as u64,
            );
        }

        Ok(handles)
    }

    fn suspend(&self, handle: ThreadHandle) -> Result<(), SamplingError> {
        let kr = unsafe { thread_suspend(handle.0 as mach_port_t) };
        if kr != KERN_SUCCESS {
            return Err(map_call_error("thread_suspend", kr));
        }
        Ok(())
    }

    fn resume(&self, handle: ThreadHandle) -> Result<(), SamplingError> {
        let kr = unsafe { thread_resume(handle.0 as mach_port_t) };
        if kr != KERN_SUCCESS {
            return Err(map_call_error("thread_resume", kr));
        }
        Ok(())
    }

    fn cpu_usage(&self, handle: ThreadHandle) -> Result<ThreadCpu, SamplingError> {
        let now = Instant::now();
        let total_us = Self::raw_cpu_time_us(handle)?;
        let mut last = self.last_cpu_us.lock().unwrap();
        let pct = match last.get(&handle.0) {
            Some((prev_us, prev_time)) => {
                let elapsed_us = now.duration_since(*prev_time).as_micros().max(1) as u64;
                let delta_us = total_us.saturating_sub(*prev_us);
                (delta_us as f64 / elapsed_us as f64) * 100.0
            }
            None => 0.0,
        };
        last.insert(handle.0, (total_us, now));
        Ok(ThreadCpu {
            handle,
            pct,
            is_idle: pct == 0.0,
        })
    }

    fn current_thread(&self) -> ThreadHandle {
        // mach_thread_self hands back a send right the caller owns; this API
        // only ever compares the port name for identity (suspend_environment
        // skips the caller), so drop the extra ref immediately instead of
        // leaking one per call.
        let port = unsafe { mach_thread_self() };
        unsafe {
            mach_port_deallocate(mach_task_self(), port);
        }
        ThreadHandle(port)
    }
}
