// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction of the initial VP context for a secondary processor.
//!
//! The new processor starts directly in long mode with the boot processor's
//! paging, descriptor tables and feature enables, so the context is a snapshot
//! of the current CPU plus a new instruction and stack pointer.

use hv_abi::HvX64SegmentRegister;
use hv_abi::HvX64TableRegister;
use hv_abi::hypercall::InitialVpContextX64;
use thiserror::Error;
use x86_descriptors::DescriptorTablePointer;
use x86_descriptors::GDT_ENTRY_LDT;
use x86_descriptors::GDT_ENTRY_TSS;
use x86_descriptors::KERNEL_CS;
use x86_descriptors::KERNEL_DS;
use x86_descriptors::SystemDescriptor;
use zerocopy::FromZeros;

/// The limit of the flat long mode code and stack segments.
const FLAT_SEGMENT_LIMIT: u32 = 0xffffffff;

/// Read access to the architectural state of the current processor.
pub trait CpuState {
    /// The GDT register.
    fn gdtr(&self) -> DescriptorTablePointer;
    /// The IDT register.
    fn idtr(&self) -> DescriptorTablePointer;
    /// The bytes of the descriptor table described by `table`.
    fn descriptor_table(&self, table: &DescriptorTablePointer) -> &[u8];
    /// CR0.
    fn cr0(&self) -> u64;
    /// CR3.
    fn cr3(&self) -> u64;
    /// CR4.
    fn cr4(&self) -> u64;
    /// The EFER MSR.
    fn efer(&self) -> u64;
    /// The PAT MSR.
    fn pat(&self) -> u64;
}

/// Where a secondary processor begins executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ApStart {
    /// Instruction pointer, the AP entry trampoline.
    pub rip: u64,
    /// Stack pointer, the top of the target's idle stack.
    pub rsp: u64,
}

/// Error building a VP context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// The GDT ends before a system descriptor the context needs.
    #[error("GDT limit {limit:#x} does not cover system descriptor slot {slot}")]
    GdtTooSmall {
        /// The GDT limit.
        limit: u16,
        /// The first of the two slots holding the descriptor.
        slot: u16,
    },
}

fn system_segment(
    cpu: &impl CpuState,
    gdtr: &DescriptorTablePointer,
    slot: u16,
) -> Result<SystemDescriptor, ContextError> {
    SystemDescriptor::read_from_table(cpu.descriptor_table(gdtr), slot).ok_or(
        ContextError::GdtTooSmall {
            limit: gdtr.limit,
            slot,
        },
    )
}

fn table_register(table: DescriptorTablePointer) -> HvX64TableRegister {
    HvX64TableRegister {
        pad: [0; 3],
        limit: table.limit,
        base: table.base,
    }
}

/// Builds the context a secondary processor starts with.
///
/// The result depends only on `cpu` and `start`, so the same snapshot always
/// produces a byte-identical context.
pub fn build_vp_context(
    cpu: &impl CpuState,
    start: ApStart,
) -> Result<InitialVpContextX64, ContextError> {
    let gdtr = cpu.gdtr();
    let idtr = cpu.idtr();
    let tss = system_segment(cpu, &gdtr, GDT_ENTRY_TSS)?;
    let ldt = system_segment(cpu, &gdtr, GDT_ENTRY_LDT)?;

    let mut context = InitialVpContextX64::new_zeroed();
    context.rip = start.rip;
    context.rsp = start.rsp;
    context.rflags = x86_descriptors::RFlags::default().into();
    context.efer = cpu.efer();
    context.cr0 = cpu.cr0();
    context.cr3 = cpu.cr3();
    context.cr4 = cpu.cr4();
    context.msr_cr_pat = cpu.pat();
    context.idtr = table_register(idtr);
    context.gdtr = table_register(gdtr);

    context.cs = HvX64SegmentRegister {
        base: 0,
        limit: FLAT_SEGMENT_LIMIT,
        selector: KERNEL_CS,
        attributes: x86_descriptors::X64_DEFAULT_CODE_SEGMENT_ATTRIBUTES.as_bits(),
    };
    context.ss = HvX64SegmentRegister {
        base: 0,
        limit: FLAT_SEGMENT_LIMIT,
        selector: KERNEL_DS,
        attributes: x86_descriptors::X64_DEFAULT_DATA_SEGMENT_ATTRIBUTES.as_bits(),
    };
    // ds, es, fs and gs stay null.
    context.ldtr = HvX64SegmentRegister {
        base: ldt.base(),
        limit: ldt.limit(),
        selector: x86_descriptors::gdt_selector(GDT_ENTRY_LDT),
        attributes: x86_descriptors::X64_LDT_SEGMENT_ATTRIBUTES.as_bits(),
    };
    context.tr = HvX64SegmentRegister {
        base: tss.base(),
        limit: tss.limit(),
        selector: x86_descriptors::gdt_selector(GDT_ENTRY_TSS),
        attributes: x86_descriptors::X64_BUSY_TSS_SEGMENT_ATTRIBUTES.as_bits(),
    };

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCpuState;
    use zerocopy::IntoBytes;

    const START: ApStart = ApStart {
        rip: 0xffffffff81000120,
        rsp: 0xffffc90000024000,
    };

    #[test]
    fn snapshot_of_current_cpu() {
        let cpu = FakeCpuState::new();
        let context = build_vp_context(&cpu, START).unwrap();

        assert_eq!(context.rip, START.rip);
        assert_eq!(context.rsp, START.rsp);
        assert_eq!(context.rflags, 2);
        assert_eq!(context.efer, cpu.efer);
        assert_eq!(context.cr0, cpu.cr0);
        assert_eq!(context.cr3, cpu.cr3);
        assert_eq!(context.cr4, cpu.cr4);
        assert_eq!(context.msr_cr_pat, cpu.pat);
        assert_eq!(context.gdtr.limit, { cpu.gdtr.limit });
        assert_eq!(context.gdtr.base, { cpu.gdtr.base });
        assert_eq!(context.idtr.limit, { cpu.idtr.limit });
        assert_eq!(context.idtr.base, { cpu.idtr.base });
    }

    #[test]
    fn segment_registers() {
        let cpu = FakeCpuState::new();
        let context = build_vp_context(&cpu, START).unwrap();

        assert_eq!(
            context.cs,
            HvX64SegmentRegister {
                base: 0,
                limit: 0xffffffff,
                selector: 0x10,
                attributes: 0xa09b,
            }
        );
        assert_eq!(
            context.ss,
            HvX64SegmentRegister {
                base: 0,
                limit: 0xffffffff,
                selector: 0x18,
                attributes: 0xc093,
            }
        );
        for null in [context.ds, context.es, context.fs, context.gs] {
            assert_eq!(null.as_bytes(), &[0; 16]);
        }
        assert_eq!(
            context.tr,
            HvX64SegmentRegister {
                base: FakeCpuState::TSS_BASE,
                limit: FakeCpuState::TSS_LIMIT,
                selector: 0x40,
                attributes: 0x8b,
            }
        );
        assert_eq!(
            context.ldtr,
            HvX64SegmentRegister {
                base: FakeCpuState::LDT_BASE,
                limit: FakeCpuState::LDT_LIMIT,
                selector: 0x50,
                attributes: 0x82,
            }
        );
    }

    #[test]
    fn repeated_builds_are_identical() {
        let cpu = FakeCpuState::new();
        let first = build_vp_context(&cpu, START).unwrap();
        let second = build_vp_context(&cpu, START).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn short_gdt() {
        let mut cpu = FakeCpuState::new();
        // Covers the TSS slot pair but ends before the LDT.
        cpu.gdtr.limit = 10 * 8 - 1;
        assert_eq!(
            build_vp_context(&cpu, START),
            Err(ContextError::GdtTooSmall {
                limit: 10 * 8 - 1,
                slot: GDT_ENTRY_LDT,
            })
        );

        cpu.gdtr.limit = 8 * 8 + 7;
        assert_eq!(
            build_vp_context(&cpu, START),
            Err(ContextError::GdtTooSmall {
                limit: 8 * 8 + 7,
                slot: GDT_ENTRY_TSS,
            })
        );
    }
}
