// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping from APIC IDs to logical CPUs and hypervisor VP indices.

use crate::hypercall::HvCall;
use crate::hypercall::HypercallIo;
use crate::interrupts::LocalInterrupts;
use thiserror::Error;

/// The kernel's view of the processors in the system.
pub trait CpuTopology {
    /// The logical CPU numbers that are present.
    fn present_cpus(&self) -> impl Iterator<Item = u32> + '_;
    /// The APIC ID of logical CPU `cpu`.
    fn apic_id(&self, cpu: u32) -> u32;
    /// The top of the idle stack of logical CPU `cpu`.
    fn idle_stack_top(&self, cpu: u32) -> u64;
}

/// A source of hypervisor VP indices.
///
/// Lookups that need the hypervisor borrow the caller's hypercall pages, so
/// resolving and activating a processor share the one per-CPU page pair.
pub trait VpIndexMap {
    /// Returns the VP index for `apic_id`, or `None` if there is none.
    fn vp_index<H, I>(&mut self, hv: &mut H, irq: &I, apic_id: u32) -> Option<u32>
    where
        H: HypercallIo + ?Sized,
        I: LocalInterrupts + ?Sized;
}

/// A fixed table of `(apic_id, vp_index)` pairs.
#[derive(Debug, Copy, Clone)]
pub struct VpIndexTable<'a>(pub &'a [(u32, u32)]);

impl VpIndexMap for VpIndexTable<'_> {
    fn vp_index<H, I>(&mut self, _hv: &mut H, _irq: &I, apic_id: u32) -> Option<u32>
    where
        H: HypercallIo + ?Sized,
        I: LocalInterrupts + ?Sized,
    {
        self.0
            .iter()
            .find_map(|&(id, vp_index)| (id == apic_id).then_some(vp_index))
    }
}

/// Looks up VP indices with `HvCallGetVpIndexFromApicId`.
#[derive(Debug, Copy, Clone, Default)]
pub struct HypercallVpIndexMap;

impl VpIndexMap for HypercallVpIndexMap {
    fn vp_index<H, I>(&mut self, hv: &mut H, irq: &I, apic_id: u32) -> Option<u32>
    where
        H: HypercallIo + ?Sized,
        I: LocalInterrupts + ?Sized,
    {
        match HvCall::new(hv, irq).get_vp_index_from_apic_id(apic_id) {
            Ok(vp_index) => Some(vp_index),
            Err(err) => {
                tracing::debug!(apic_id, status = ?err, "no vp index for apic id");
                None
            }
        }
    }
}

/// Processor counts advertised by the hypervisor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HvImplementationLimits {
    /// The maximum VP index the host uses.
    pub max_vp_index: u32,
}

impl HvImplementationLimits {
    /// Parses the `eax` output of the implementation limits CPUID leaf.
    pub fn from_cpuid(eax: u32) -> Self {
        Self { max_vp_index: eax }
    }
}

/// A processor located by [`VpIndexResolver::resolve`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResolvedCpu {
    /// The logical CPU number.
    pub cpu: u32,
    /// The hypervisor VP index.
    pub vp_index: u32,
}

/// Error resolving an APIC ID.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No present CPU has the APIC ID.
    #[error("no present cpu has apic id {apic_id}")]
    NoCpu {
        /// The APIC ID.
        apic_id: u32,
    },
    /// The mapping source has no VP index for the APIC ID.
    #[error("no vp index for apic id {apic_id}")]
    NoVpIndex {
        /// The APIC ID.
        apic_id: u32,
    },
    /// The VP index is larger than the hypervisor supports.
    #[error("vp index {vp_index} for apic id {apic_id} exceeds maximum {max_vp_index}")]
    VpIndexOutOfRange {
        /// The APIC ID.
        apic_id: u32,
        /// The VP index the mapping returned.
        vp_index: u32,
        /// The largest valid VP index.
        max_vp_index: u32,
    },
}

/// Resolves APIC IDs, bounded by the hypervisor's maximum VP index.
#[derive(Debug, Copy, Clone)]
pub struct VpIndexResolver {
    max_vp_index: u32,
}

impl VpIndexResolver {
    /// Creates a resolver that rejects VP indices above `max_vp_index`.
    pub fn new(max_vp_index: u32) -> Self {
        Self { max_vp_index }
    }

    /// Finds the logical CPU and VP index for `apic_id`.
    ///
    /// `hv` and `irq` are lent to `map` for lookups through the hypervisor.
    pub fn resolve<H, I>(
        &self,
        topology: &impl CpuTopology,
        map: &mut impl VpIndexMap,
        hv: &mut H,
        irq: &I,
        apic_id: u32,
    ) -> Result<ResolvedCpu, ResolveError>
    where
        H: HypercallIo + ?Sized,
        I: LocalInterrupts + ?Sized,
    {
        let cpu = topology
            .present_cpus()
            .find(|&cpu| topology.apic_id(cpu) == apic_id)
            .ok_or(ResolveError::NoCpu { apic_id })?;

        let vp_index = map
            .vp_index(hv, irq, apic_id)
            .ok_or(ResolveError::NoVpIndex { apic_id })?;

        if vp_index > self.max_vp_index {
            return Err(ResolveError::VpIndexOutOfRange {
                apic_id,
                vp_index,
                max_vp_index: self.max_vp_index,
            });
        }

        Ok(ResolvedCpu { cpu, vp_index })
    }
}
