// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(target_arch = "x86_64")]

//! x86_64 processor and hypervisor access.

mod ap_entry;
mod cpu;
mod hypercall;
mod intrinsics;
mod msr;

pub use ap_entry::SecondaryStartupFn;
pub use ap_entry::ap_entry_address;
pub use ap_entry::register_secondary_startup;
pub use ap_entry::vtl_ap_entry;
pub use cpu::X64CpuFeatures;
pub use cpu::X64CpuState;
pub use cpu::X64LocalInterrupts;
pub use cpu::hv_implementation_limits;
pub use hypercall::X64HypercallIo;
pub use intrinsics::X64FaultTrigger;
