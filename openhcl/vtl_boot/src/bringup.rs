// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Secondary processor bring-up in VTL2.

use crate::EINVAL;
use crate::activate::ActivateError;
use crate::activate::activate_vp;
use crate::context::ApStart;
use crate::context::ContextError;
use crate::context::CpuState;
use crate::context::build_vp_context;
use crate::hypercall::HypercallIo;
use crate::interrupts::LocalInterrupts;
use crate::resolver::CpuTopology;
use crate::resolver::ResolveError;
use crate::resolver::ResolvedCpu;
use crate::resolver::VpIndexMap;
use crate::resolver::VpIndexResolver;
use thiserror::Error;

/// Error bringing up a secondary processor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BringupError {
    /// The APIC ID did not resolve to a usable processor.
    #[error("failed to resolve apic id")]
    Resolve(#[from] ResolveError),
    /// The initial context could not be built.
    #[error("failed to build the initial vp context")]
    Context(#[from] ContextError),
    /// The hypervisor refused to start the processor.
    #[error("failed to activate the vp")]
    Activate(#[from] ActivateError),
}

/// The wakeup callback the interrupt controller code uses to start a
/// secondary processor.
pub trait WakeupSecondaryCpu {
    /// Starts the processor with `apic_id`. Returns 0 on success or a
    /// negative errno.
    ///
    /// `start_eip` is the real mode trampoline address, which is unused when
    /// the processor starts directly in long mode.
    fn wakeup_secondary_cpu(&mut self, apic_id: u32, start_eip: u64) -> i32;
}

/// The interrupt controller's callback slots.
#[derive(Default)]
pub struct ApicOps<'a> {
    /// Starts a secondary processor in 64-bit mode.
    pub wakeup_secondary_cpu_64: Option<&'a mut dyn WakeupSecondaryCpu>,
}

impl<'a> ApicOps<'a> {
    /// Replaces the 64-bit wakeup callback.
    pub fn update_callback(&mut self, wakeup: &'a mut dyn WakeupSecondaryCpu) {
        self.wakeup_secondary_cpu_64 = Some(wakeup);
    }

    /// Invokes the 64-bit wakeup callback, if one is installed.
    pub fn wakeup_secondary_cpu(&mut self, apic_id: u32, start_eip: u64) -> Option<i32> {
        self.wakeup_secondary_cpu_64
            .as_mut()
            .map(|wakeup| wakeup.wakeup_secondary_cpu(apic_id, start_eip))
    }
}

/// Starts secondary processors through the hypervisor.
pub struct SecondaryCpuBringup<T, M, C, H, I> {
    topology: T,
    map: M,
    cpu_state: C,
    hv: H,
    irq: I,
    resolver: VpIndexResolver,
    entry: u64,
}

impl<T, M, C, H, I> SecondaryCpuBringup<T, M, C, H, I>
where
    T: CpuTopology,
    M: VpIndexMap,
    C: CpuState,
    H: HypercallIo,
    I: LocalInterrupts,
{
    /// Creates the bring-up state.
    ///
    /// `entry` is the address secondary processors start executing at.
    pub fn new(
        topology: T,
        map: M,
        cpu_state: C,
        hv: H,
        irq: I,
        resolver: VpIndexResolver,
        entry: u64,
    ) -> Self {
        Self {
            topology,
            map,
            cpu_state,
            hv,
            irq,
            resolver,
            entry,
        }
    }

    /// The hypercall pages used for activation.
    pub fn hypercall_io(&self) -> &H {
        &self.hv
    }

    /// Starts the processor with `apic_id` in VTL2.
    pub fn bring_up(&mut self, apic_id: u32) -> Result<ResolvedCpu, BringupError> {
        tracing::debug!(apic_id, "bringing up cpu in vtl2");

        let resolved = self
            .resolver
            .resolve(
                &self.topology,
                &mut self.map,
                &mut self.hv,
                &self.irq,
                apic_id,
            )
            .inspect_err(|err| {
                tracing::error!(apic_id, error = %err, "couldn't find cpu");
            })?;

        let start = ApStart {
            rip: self.entry,
            rsp: self.topology.idle_stack_top(resolved.cpu),
        };
        let context = build_vp_context(&self.cpu_state, start).inspect_err(|err| {
            tracing::error!(apic_id, error = %err, "bad gdt");
        })?;

        activate_vp(&mut self.hv, &self.irq, resolved.vp_index, &context)?;
        Ok(resolved)
    }
}

impl<T, M, C, H, I> WakeupSecondaryCpu for SecondaryCpuBringup<T, M, C, H, I>
where
    T: CpuTopology,
    M: VpIndexMap,
    C: CpuState,
    H: HypercallIo,
    I: LocalInterrupts,
{
    fn wakeup_secondary_cpu(&mut self, apic_id: u32, _start_eip: u64) -> i32 {
        match self.bring_up(apic_id) {
            Ok(_) => 0,
            Err(_) => -EINVAL,
        }
    }
}
