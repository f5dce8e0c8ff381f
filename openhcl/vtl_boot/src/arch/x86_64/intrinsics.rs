// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Processor faults.

use crate::restart::FaultTrigger;
use core::arch::asm;
use x86_descriptors::DescriptorTablePointer;

/// Causes a processor fault.
pub fn fault() -> ! {
    // SAFETY: ud2 is always safe, and will cause the function to diverge.
    unsafe {
        asm!("ud2");
        core::hint::unreachable_unchecked()
    }
}

/// Triple faults the current processor through an empty IDT.
#[derive(Debug, Default)]
pub struct X64FaultTrigger;

impl FaultTrigger for X64FaultTrigger {
    fn invalidate_idt(&mut self) {
        let idt = DescriptorTablePointer::default();
        // SAFETY: loading a zero-limit IDT only affects how later exceptions
        // are delivered, which is the intent. Nothing runs after this except
        // the fault.
        unsafe {
            asm!("lidt [{0}]", in(reg) &raw const idt, options(readonly, nostack, preserves_flags));
        }
    }

    fn trigger_fault(&mut self) {
        // SAFETY: the breakpoint cannot be delivered without an IDT, which
        // escalates to a triple fault and resets the processor.
        unsafe {
            asm!("int3");
        }
    }
}
