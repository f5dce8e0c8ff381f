// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Early VTL2 setup: restart hooks, precondition checks and the secondary
//! processor wakeup callback.

use crate::bringup::ApicOps;
use crate::bringup::WakeupSecondaryCpu;
use crate::restart::MachineOps;
use thiserror::Error;

/// Processor features the kernel has enabled.
pub trait CpuFeatures {
    /// Whether the kernel uses XSAVE.
    fn xsave_enabled(&self) -> bool;
}

/// A precondition for running in VTL2 is not met.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EarlyInitError {
    /// XSAVE is in use.
    #[error(
        "XSAVE has to be disabled as it is not supported by this module.\nPlease add 'noxsave' to the kernel command line."
    )]
    XsaveEnabled,
}

/// Fails if the kernel uses XSAVE, which the VTL2 environment does not
/// support.
pub fn check_xsave_disabled(features: &impl CpuFeatures) -> Result<(), EarlyInitError> {
    if features.xsave_enabled() {
        return Err(EarlyInitError::XsaveEnabled);
    }
    Ok(())
}

/// Installs the VTL2 restart hooks and secondary processor wakeup callback.
///
/// The restart hooks go in first so that they are in place if the XSAVE
/// check fails.
///
/// No real mode header is installed. Secondary processors start in long mode
/// at [`crate::arch::ap_entry_address`], so the real mode trampoline and its
/// setup hooks are never used.
///
/// # Panics
/// Panics if XSAVE is enabled.
pub fn vtl_early_init<'a>(
    features: &impl CpuFeatures,
    machine: &mut MachineOps,
    apic: &mut ApicOps<'a>,
    wakeup: &'a mut dyn WakeupSecondaryCpu,
) {
    *machine = MachineOps::vtl();

    if let Err(err) = check_xsave_disabled(features) {
        panic!("{err}");
    }

    apic.update_callback(wakeup);
}
