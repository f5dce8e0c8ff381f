// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform support for a kernel running as the firmware of a Hyper-V Virtual
//! Trust Level.
//!
//! Inside VTL2 there is no BIOS underneath the kernel, so the usual x86
//! platform assumptions do not hold:
//!
//! * Legacy devices (PIC timer, RTC, i8042, BIOS ROMs, MP tables) do not
//!   exist. [`platform::PlatformPolicy::apply_vtl_overrides`] removes them
//!   from the platform hook table.
//! * Secondary processors cannot be started with INIT/SIPI into a real-mode
//!   trampoline. Instead [`bringup::SecondaryCpuBringup`] maps the APIC ID to
//!   a VP index, snapshots the boot processor's long mode state into an
//!   initial VP context, and asks the hypervisor to enable VTL2 on the target
//!   VP and start it directly at the 64-bit entry point.
//! * Restarting through the firmware reset path is unsafe, since the
//!   conventional reset-type marker in low memory may overlap guest memory.
//!   [`restart::emergency_restart`] triple faults instead.
//!
//! [`early_init::vtl_early_init`] wires all of this into the registration
//! tables handed over by the surrounding kernel.

#![no_std]
// UNSAFETY: Reading processor state and issuing hypercalls.
#![expect(unsafe_code)]
#![warn(missing_docs)]

pub mod activate;
pub mod arch;
pub mod bringup;
pub mod context;
pub mod early_init;
pub mod hypercall;
pub mod interrupts;
pub mod platform;
pub mod resolver;
pub mod restart;

#[cfg(test)]
mod test_support;

/// The errno value the wakeup callback reports for every failure.
pub const EINVAL: i32 = 22;
