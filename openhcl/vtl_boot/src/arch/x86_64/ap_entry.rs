// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The first code a secondary processor runs.
//!
//! Secondary processors start in long mode directly at [`vtl_ap_entry`], on
//! their idle stack, with no real mode trampoline. The entry point forwards
//! to the kernel's 64-bit secondary startup routine.

use super::intrinsics::fault;
use core::ffi::c_void;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering;

/// The kernel's 64-bit secondary startup routine. It receives the boot
/// parameters block as both of its arguments.
pub type SecondaryStartupFn = unsafe extern "C" fn(*mut c_void, *mut c_void);

static SECONDARY_STARTUP: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static BOOT_PARAMS: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());

/// Sets the routine secondary processors jump to.
///
/// # Safety
/// `startup` must be safe to call on a freshly started secondary processor
/// with `boot_params`, and `boot_params` must stay valid for as long as
/// processors may be started.
pub unsafe fn register_secondary_startup(startup: SecondaryStartupFn, boot_params: *mut c_void) {
    BOOT_PARAMS.store(boot_params, Ordering::Relaxed);
    SECONDARY_STARTUP.store(startup as *mut (), Ordering::Release);
}

/// The entry point of a secondary processor.
pub extern "C" fn vtl_ap_entry() -> ! {
    let startup = SECONDARY_STARTUP.load(Ordering::Acquire);
    if startup.is_null() {
        fault();
    }
    let boot_params = BOOT_PARAMS.load(Ordering::Relaxed);

    // SAFETY: the pointer was stored from a `SecondaryStartupFn` by
    // `register_secondary_startup`.
    let startup = unsafe { core::mem::transmute::<*mut (), SecondaryStartupFn>(startup) };
    // SAFETY: the registrant guarantees the routine can run here with the
    // boot parameters.
    unsafe { startup(boot_params, boot_params) };

    // The startup routine does not return.
    fault()
}

/// The address secondary processors start executing at.
pub fn ap_entry_address() -> u64 {
    vtl_ap_entry as *const () as usize as u64
}
