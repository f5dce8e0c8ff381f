// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine restart without firmware.
//!
//! The usual emergency restart path writes a reset-type marker to low
//! physical memory for the firmware, which in VTL2 may belong to someone else.
//! There is no firmware to honor it anyway, so the only way out is a triple
//! fault.

/// Primitives used to triple fault the current processor.
pub trait FaultTrigger {
    /// Loads an empty interrupt descriptor table.
    fn invalidate_idt(&mut self);
    /// Raises an exception, which cannot be delivered without an IDT.
    fn trigger_fault(&mut self);
}

/// Resets the machine with a triple fault.
///
/// If the fault somehow does not reset the machine, this keeps trying
/// forever, leaving the processor state intact for a debugger.
pub fn emergency_restart(trigger: &mut impl FaultTrigger) -> ! {
    loop {
        trigger.invalidate_idt();
        trigger.trigger_fault();
    }
}

/// The machine control hooks.
#[derive(Copy, Clone)]
pub struct MachineOps {
    /// Orderly restart. The argument is the restart command, if any.
    pub restart: fn(Option<&str>) -> !,
    /// Restart after a fatal error.
    pub emergency_restart: fn() -> !,
}

impl core::fmt::Debug for MachineOps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachineOps")
            .field("restart", &(self.restart as *const ()))
            .field("emergency_restart", &(self.emergency_restart as *const ()))
            .finish()
    }
}

impl MachineOps {
    /// The restart hooks for a kernel running in VTL2.
    pub fn vtl() -> Self {
        Self {
            restart: vtl_restart,
            emergency_restart: vtl_emergency_restart,
        }
    }
}

/// Restarts the machine. The restart command is ignored.
pub fn vtl_restart(_cmd: Option<&str>) -> ! {
    vtl_emergency_restart()
}

/// Restarts the machine by triple faulting the current processor.
pub fn vtl_emergency_restart() -> ! {
    emergency_restart(&mut crate::arch::X64FaultTrigger)
}
