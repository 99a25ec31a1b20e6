//! Stack memory access on Darwin (spec §4.1): a suspended peer thread's
//! registers and memory via Mach calls, and the calling thread's own stack
//! read directly through a bounds-checked pointer. Grounded on
//! `perfrecord/src/proc_maps.rs::{get_backtrace, ForeignMemory}` for the
//! peer path and `samply-in-process/src/mac/thread_profiler_in_process.rs`
//! for the self path.

use super::kernel_result::into_kernel_error;
use crate::alloc::SelfStackCapture;
use crate::error::{KernelError, SamplingError};
use crate::stack::{RegisterSet, StackCursor, StackMemory};
use crate::threads::{PeerStackCapture, ThreadHandle};
use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_deallocate, mach_vm_read};
use mach2::vm_types::mach_vm_address_t;

#[cfg(target_arch = "aarch64")]
mod registers {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_types::thread_act_t;
    use mach2::message::mach_msg_type_number_t;

    const ARM_THREAD_STATE64: i32 = 6;

    #[repr(C)]
    #[derive(Default)]
    struct Arm64ThreadState {
        x: [u64; 29],
        fp: u64,
        lr: u64,
        sp: u64,
        pc: u64,
        cpsr: u32,
        _pad: u32,
    }

    const COUNT: mach_msg_type_number_t =
        (std::mem::size_of::<Arm64ThreadState>() / std::mem::size_of::<u32>()) as mach_msg_type_number_t;

    extern "C" {
        fn thread_get_state(
            thread: thread_act_t,
            flavor: i32,
            state: *mut u32,
            state_count: *mut mach_msg_type_number_t,
        ) -> i32;
    }

    pub fn get_registers(thread: thread_act_t) -> Result<super::RegisterSet, i32> {
        let mut state = Arm64ThreadState::default();
        let mut count = COUNT;
        let kr = unsafe { thread_get_state(thread, ARM_THREAD_STATE64, &mut state as *mut _ as *mut u32, &mut count) };
        if kr != KERN_SUCCESS {
            return Err(kr);
        }
        let mut gprs = [0u64; 29];
        gprs.copy_from_slice(&state.x);
        Ok(super::RegisterSet {
            pc: state.pc,
            fp: state.fp,
            sp: state.sp,
            lr: state.lr,
            gprs,
            exception: None,
        })
    }
}

#[cfg(target_arch = "x86_64")]
mod registers {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_types::thread_act_t;
    use mach2::message::mach_msg_type_number_t;
    use mach2::structs::x86_thread_state64_t;
    use mach2::thread_status::x86_THREAD_STATE64;

    const COUNT: mach_msg_type_number_t =
        (std::mem::size_of::<x86_thread_state64_t>() / std::mem::size_of::<u32>()) as mach_msg_type_number_t;

    extern "C" {
        fn thread_get_state(
            thread: thread_act_t,
            flavor: i32,
            state: *mut u32,
            state_count: *mut mach_msg_type_number_t,
        ) -> i32;
    }

    pub fn get_registers(thread: thread_act_t) -> Result<super::RegisterSet, i32> {
        let mut state: x86_thread_state64_t = unsafe { std::mem::zeroed() };
        let mut count = COUNT;
        let kr = unsafe {
            thread_get_state(thread, x86_THREAD_STATE64 as i32, &mut state as *mut _ as *mut u32, &mut count)
        };
        if kr != KERN_SUCCESS {
            return Err(kr);
        }
        let mut gprs = [0u64; 29];
        gprs[0] = state.__rax;
        gprs[1] = state.__rbx;
        gprs[2] = state.__rcx;
        gprs[3] = state.__rdx;
        Ok(super::RegisterSet {
            pc: state.__rip,
            fp: state.__rbp,
            sp: state.__rsp,
            lr: 0,
            gprs,
            exception: None,
        })
    }
}

/// Reads a suspended peer thread's register snapshot (spec §4.1: "the
/// thread must already be suspended"). Callers are expected to hold an
/// `EnvironmentSuspendGuard` or have suspended `thread` individually first.
pub fn capture_peer_registers(thread: ThreadHandle) -> Result<RegisterSet, SamplingError> {
    registers::get_registers(thread.0 as mach2::mach_types::thread_act_t).map_err(|kr| {
        let err = into_kernel_error(kr);
        match err {
            KernelError::MachSendInvalidDest | KernelError::Terminated | KernelError::InvalidArgument => {
                SamplingError::ThreadTerminated("thread_get_state", err)
            }
            _ => SamplingError::Ignorable("thread_get_state", err),
        }
    })
}

/// A single-page cache over `mach_vm_read` reads, so a multi-frame walk
/// over a suspended peer's stack doesn't round-trip to the kernel per
/// 8-byte word (spec §4.1 "reads are page-granularity cached").
pub struct PeerStackMemory {
    task: mach_port_t,
    page: Option<(u64, Vec<u8>)>,
}

const PAGE_SIZE: u64 = 4096;

impl PeerStackMemory {
    pub fn new(task: mach_port_t) -> Self {
        PeerStackMemory { task, page: None }
    }

    fn ensure_page(&mut self, address: u64) -> Option<()> {
        let page_base = address & !(PAGE_SIZE - 1);
        if let Some((base, _)) = &self.page {
            if *base == page_base {
                return Some(());
            }
        }
        let mut data: *mut u8 = std::ptr::null_mut();
        let mut data_size: usize = 0;
        let kr = unsafe {
            mach_vm_read(
                self.task,
                page_base as mach_vm_address_t,
                PAGE_SIZE,
                &mut data as *mut _ as *mut usize,
                &mut data_size as *mut _ as *mut u32,
            )
        };
        if kr != KERN_SUCCESS || data.is_null() {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(data, data_size) }.to_vec();
        unsafe {
            mach_vm_deallocate(self.task, data as u64, data_size as u64);
        }
        self.page = Some((page_base, bytes));
        Some(())
    }
}

impl StackMemory for PeerStackMemory {
    fn read_u64(&mut self, address: u64) -> Option<u64> {
        self.ensure_page(address)?;
        let (base, bytes) = self.page.as_ref()?;
        let offset = (address - base) as usize;
        let slice = bytes.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(slice.try_into().ok()?))
    }
}

/// Bounds-checked read of the calling thread's own stack (spec §4.1
/// in-process fast path: "no suspension, a plain slice read").
struct SelfStackMemory {
    low: u64,
    high: u64,
}

impl SelfStackMemory {
    fn for_current_thread() -> Option<Self> {
        unsafe {
            let pthread = libc::pthread_self();
            let high = libc::pthread_get_stackaddr_np(pthread) as u64;
            let size = libc::pthread_get_stacksize_np(pthread) as u64;
            if high == 0 || size == 0 {
                return None;
            }
            Some(SelfStackMemory {
                low: high.saturating_sub(size),
                high,
            })
        }
    }
}

impl StackMemory for SelfStackMemory {
    fn read_u64(&mut self, address: u64) -> Option<u64> {
        if address < self.low || address.checked_add(8)? > self.high {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(address as *const u64) })
    }
}

#[cfg(target_arch = "aarch64")]
fn current_pc_fp() -> (u64, u64) {
    let pc: u64;
    let fp: u64;
    unsafe {
        std::arch::asm!(
            "adr {pc}, .",
            "mov {fp}, x29",
            pc = out(reg) pc,
            fp = out(reg) fp,
        );
    }
    (pc, fp)
}

#[cfg(target_arch = "x86_64")]
fn current_pc_fp() -> (u64, u64) {
    let pc: u64;
    let fp: u64;
    unsafe {
        std::arch::asm!(
            "lea {pc}, [rip]",
            "mov {fp}, rbp",
            pc = out(reg) pc,
            fp = out(reg) fp,
        );
    }
    (pc, fp)
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
fn current_pc_fp() -> (u64, u64) {
    (0, 0)
}

/// [`SelfStackCapture`] for ALLOC's fast path (spec §4.8): walks the
/// calling thread's own stack with no suspension.
pub struct MacSelfStackCapture;

impl SelfStackCapture for MacSelfStackCapture {
    fn capture_self(&self, max_depth: usize) -> Vec<u64> {
        let (pc, fp) = current_pc_fp();
        if fp == 0 {
            return Vec::new();
        }
        let Some(mut mem) = SelfStackMemory::for_current_thread() else {
            return Vec::new();
        };
        let mut cursor = StackCursor::new(&mut mem, pc, fp, max_depth);
        cursor.collect_addresses()
    }
}

/// [`PeerStackCapture`] for MAIN/CPU's sampler (spec §4.1 peer path): reads
/// a suspended thread's registers, then walks its stack through
/// `mach_vm_read`. The caller must have the thread already suspended.
pub struct MacPeerStackCapture;

impl PeerStackCapture for MacPeerStackCapture {
    fn capture(&self, thread: ThreadHandle, max_depth: usize) -> Vec<u64> {
        let Ok(registers) = capture_peer_registers(thread) else {
            return Vec::new();
        };
        if registers.fp == 0 {
            return vec![registers.pc];
        }
        let mut mem = PeerStackMemory::new(unsafe { mach_task_self() });
        let mut cursor = StackCursor::new(&mut mem, registers.pc, registers.fp, max_depth);
        cursor.collect_addresses()
    }
}
