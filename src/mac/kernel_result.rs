//! Maps a Mach `kern_return_t` onto [`crate::error::KernelError`], grounded
//! on `samply/src/mac/thread_act.rs`'s `IntoResult` conversion.

use crate::error::KernelError;
use mach2::kern_return::{
    kern_return_t, KERN_FAILURE, KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT,
    KERN_RESOURCE_SHORTAGE, KERN_TERMINATED,
};
use mach2::message::MACH_SEND_INVALID_DEST;

pub fn into_kernel_error(kr: kern_return_t) -> KernelError {
    match kr {
        KERN_INVALID_ADDRESS => KernelError::InvalidAddress,
        KERN_INVALID_ARGUMENT => KernelError::InvalidArgument,
        KERN_FAILURE => KernelError::Failure,
        KERN_RESOURCE_SHORTAGE => KernelError::ResourceShortage,
        KERN_TERMINATED => KernelError::Terminated,
        code if code == MACH_SEND_INVALID_DEST as kern_return_t => KernelError::MachSendInvalidDest,
        other => KernelError::Other(other),
    }
}
