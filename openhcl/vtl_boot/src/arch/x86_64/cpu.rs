// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Current processor state.

use super::msr::read_msr;
use crate::context::CpuState;
use crate::early_init::CpuFeatures;
use crate::interrupts::IrqFlags;
use crate::interrupts::LocalInterrupts;
use crate::resolver::HvImplementationLimits;
use core::arch::asm;
use core::arch::x86_64::CpuidResult;
use x86_descriptors::DescriptorTablePointer;
use x86_descriptors::RFlags;

#[allow(unused_unsafe, reason = "__cpuid_count is a safe fn on newer toolchains")]
fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    // SAFETY: this instruction is always safe to invoke. If the instruction is
    // for some reason not supported, the process will fault in an OS-specific
    // way, but this will not cause memory safety violations.
    unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) }
}

/// Reads the hypervisor's processor limits from CPUID.
pub fn hv_implementation_limits() -> HvImplementationLimits {
    let result = cpuid(hv_abi::HV_CPUID_FUNCTION_MS_HV_IMPLEMENTATION_LIMITS, 0);
    HvImplementationLimits::from_cpuid(result.eax)
}

/// The architectural state of the processor this runs on.
#[derive(Debug, Default)]
pub struct X64CpuState;

impl CpuState for X64CpuState {
    fn gdtr(&self) -> DescriptorTablePointer {
        let mut gdtr = DescriptorTablePointer::default();
        // SAFETY: sgdt only writes the 10-byte operand.
        unsafe {
            asm!("sgdt [{0}]", in(reg) &raw mut gdtr, options(nostack, preserves_flags));
        }
        gdtr
    }

    fn idtr(&self) -> DescriptorTablePointer {
        let mut idtr = DescriptorTablePointer::default();
        // SAFETY: sidt only writes the 10-byte operand.
        unsafe {
            asm!("sidt [{0}]", in(reg) &raw mut idtr, options(nostack, preserves_flags));
        }
        idtr
    }

    fn descriptor_table(&self, table: &DescriptorTablePointer) -> &[u8] {
        // SAFETY: the table is loaded into the processor, so it is mapped
        // for its full limit and stays valid for the lifetime of the kernel.
        unsafe { core::slice::from_raw_parts(table.base as *const u8, table.len()) }
    }

    fn cr0(&self) -> u64 {
        let cr0: u64;
        // SAFETY: reading CR0 has no side effects.
        unsafe {
            asm!("mov {0}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        cr0
    }

    fn cr3(&self) -> u64 {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            asm!("mov {0}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        cr3
    }

    fn cr4(&self) -> u64 {
        let cr4: u64;
        // SAFETY: reading CR4 has no side effects.
        unsafe {
            asm!("mov {0}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        cr4
    }

    fn efer(&self) -> u64 {
        // SAFETY: EFER is an architectural MSR and reading it has no side
        // effects.
        unsafe { read_msr(x86_descriptors::X86X_MSR_EFER) }
    }

    fn pat(&self) -> u64 {
        // SAFETY: PAT is an architectural MSR and reading it has no side
        // effects.
        unsafe { read_msr(x86_descriptors::X86X_MSR_CR_PAT) }
    }
}

/// Interrupt masking through RFLAGS.IF.
#[derive(Debug, Default)]
pub struct X64LocalInterrupts;

impl LocalInterrupts for X64LocalInterrupts {
    fn save_and_disable(&self) -> IrqFlags {
        let flags: u64;
        // SAFETY: the flags are popped right back off the stack, and masking
        // interrupts is undone when the caller restores the saved state.
        unsafe {
            asm!("pushfq", "pop {0}", "cli", out(reg) flags);
        }
        IrqFlags(flags)
    }

    fn restore(&self, flags: IrqFlags) {
        if RFlags::from(flags.0).interrupt_enable() {
            // SAFETY: interrupts were enabled when the flags were saved.
            unsafe {
                asm!("sti", options(nostack));
            }
        }
    }
}

/// XSAVE support as seen by the kernel.
#[derive(Debug)]
pub struct X64CpuFeatures {
    noxsave: bool,
}

impl X64CpuFeatures {
    /// `noxsave` is whether XSAVE was disabled on the kernel command line.
    pub fn new(noxsave: bool) -> Self {
        Self { noxsave }
    }
}

impl CpuFeatures for X64CpuFeatures {
    fn xsave_enabled(&self) -> bool {
        !self.noxsave && cpuid(1, 0).ecx & x86_descriptors::CPUID_1_ECX_XSAVE != 0
    }
}
