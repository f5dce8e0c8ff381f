// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions of the x86-64 segment and system descriptor formats, and the
//! handful of control register and MSR values needed to describe a processor
//! that starts directly in long mode.
//!
//! The layouts here are bit-exact: they are read straight out of a live GDT
//! and handed to the hypervisor as part of an initial VP context.

#![no_std]
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use core::mem::size_of;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const X64_CR0_PE: u64 = 0x0000000000000001; // protection enable
pub const X64_CR0_NE: u64 = 0x0000000000000020; // numeric error
pub const X64_CR0_WP: u64 = 0x0000000000010000; // write protect
pub const X64_CR0_PG: u64 = 0x0000000080000000; // paging

pub const X64_CR4_PAE: u64 = 0x0000000000000020; // Physical address extensions
pub const X64_CR4_PGE: u64 = 0x0000000000000080; // Page global enable

pub const X64_EFER_SCE: u64 = 0x0000000000000001; // Syscall Enable
pub const X64_EFER_LME: u64 = 0x0000000000000100; // Long Mode Enabled
pub const X64_EFER_LMA: u64 = 0x0000000000000400; // Long Mode Active
pub const X64_EFER_NXE: u64 = 0x0000000000000800; // No-execute Enable

pub const X86X_MSR_CR_PAT: u32 = 0x277;
pub const X86X_MSR_EFER: u32 = 0xC0000080;

pub const X86X_MSR_DEFAULT_PAT: u64 = 0x0007040600070406;

/// CPUID leaf 1, ECX: processor supports XSAVE/XRSTOR.
pub const CPUID_1_ECX_XSAVE: u32 = 1 << 26;

/// GDT slots of the kernel's flat segments and of its system descriptors.
///
/// The TSS and LDT descriptors are 16 bytes each in long mode and so occupy
/// two slots apiece.
pub const GDT_ENTRY_KERNEL_CS: u16 = 2;
pub const GDT_ENTRY_KERNEL_DS: u16 = 3;
pub const GDT_ENTRY_TSS: u16 = 8;
pub const GDT_ENTRY_LDT: u16 = 10;

/// Returns the ring 0 selector for GDT slot `index`.
pub const fn gdt_selector(index: u16) -> u16 {
    index * size_of::<GdtEntry>() as u16
}

pub const KERNEL_CS: u16 = gdt_selector(GDT_ENTRY_KERNEL_CS);
pub const KERNEL_DS: u16 = gdt_selector(GDT_ENTRY_KERNEL_DS);

/// Non-system, long, code, present: `0xa09b`.
pub const X64_DEFAULT_CODE_SEGMENT_ATTRIBUTES: SegmentAttributes = SegmentAttributes::new()
    .with_granularity(true)
    .with_long(true)
    .with_present(true)
    .with_non_system_segment(true)
    .with_segment_type(0xb);
/// Non-system, data, present, granularity, default: `0xc093`.
pub const X64_DEFAULT_DATA_SEGMENT_ATTRIBUTES: SegmentAttributes = SegmentAttributes::new()
    .with_granularity(true)
    .with_default(true)
    .with_present(true)
    .with_non_system_segment(true)
    .with_segment_type(0x3);
/// System, present, LDT: `0x82`.
pub const X64_LDT_SEGMENT_ATTRIBUTES: SegmentAttributes = SegmentAttributes::new()
    .with_present(true)
    .with_segment_type(0x2);
/// System, present, busy 64-bit TSS: `0x8b`.
pub const X64_BUSY_TSS_SEGMENT_ATTRIBUTES: SegmentAttributes = SegmentAttributes::new()
    .with_present(true)
    .with_segment_type(0xb);

/// The segment attributes in the packed 16-bit form used by the hypervisor.
///
/// Bits 0-7 are the descriptor access byte and bits 12-15 are the descriptor
/// flags nibble. Bits 8-11, where the descriptor keeps the top of the limit,
/// are always zero.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct SegmentAttributes {
    #[bits(4)]
    pub segment_type: u8,
    pub non_system_segment: bool,
    #[bits(2)]
    pub descriptor_privilege_level: u8,
    pub present: bool,
    #[bits(4)]
    _reserved: u8,
    pub available: bool,
    pub long: bool,
    pub default: bool,
    pub granularity: bool,
}

impl SegmentAttributes {
    pub const fn as_bits(&self) -> u16 {
        self.0
    }

    const fn access_byte(&self) -> u8 {
        self.0 as u8
    }

    const fn flags_nibble(&self) -> u8 {
        (self.0 >> 8) as u8 & 0xf0
    }

    const fn from_descriptor(attr_low: u8, attr_high: u8) -> Self {
        Self::from_bits(attr_low as u16 | ((attr_high & 0xf0) as u16) << 8)
    }
}

#[bitfield(u64, default = false)]
#[derive(PartialEq, Eq)]
pub struct RFlags {
    // FLAGS
    pub carry: bool,
    _reserved0: bool,
    pub parity: bool,
    _reserved1: bool,
    pub adjust: bool,
    _reserved2: bool,
    pub zero: bool,
    pub sign: bool,
    pub trap: bool,
    pub interrupt_enable: bool,
    pub direction: bool,
    pub overflow: bool,
    #[bits(2)]
    pub io_privilege_level: u8,
    pub nested_task: bool,
    pub mode: bool,

    // EFLAGS
    pub resume: bool,
    pub virtual_8086_mode: bool,
    pub alignment_check: bool,
    pub virtual_interrupt: bool,
    pub virtual_interrupt_pending: bool,
    pub cpuid_allowed: bool,
    #[bits(10)]
    _reserved3: u16,

    // RFLAGS
    _reserved4: u32,
}

impl Default for RFlags {
    /// Only the always-one bit 1 set.
    fn default() -> Self {
        Self(2)
    }
}

/// An 8-byte code or data segment descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GdtEntry {
    pub limit_low: u16,
    pub base_low: u16,
    pub base_middle: u8,
    pub attr_low: u8,
    pub attr_high: u8,
    pub base_high: u8,
}

const_assert_eq!(size_of::<GdtEntry>(), 8);

impl GdtEntry {
    /// Packs a descriptor. Only the low 32 bits of `base` and the low 20 bits
    /// of `limit` are representable.
    pub const fn new(base: u32, limit: u32, attributes: SegmentAttributes) -> Self {
        Self {
            limit_low: limit as u16,
            base_low: base as u16,
            base_middle: (base >> 16) as u8,
            attr_low: attributes.access_byte(),
            attr_high: attributes.flags_nibble() | ((limit >> 16) as u8 & 0xf),
            base_high: (base >> 24) as u8,
        }
    }

    pub const fn base(&self) -> u32 {
        self.base_low as u32 | (self.base_middle as u32) << 16 | (self.base_high as u32) << 24
    }

    pub const fn limit(&self) -> u32 {
        self.limit_low as u32 | ((self.attr_high & 0xf) as u32) << 16
    }

    pub const fn attributes(&self) -> SegmentAttributes {
        SegmentAttributes::from_descriptor(self.attr_low, self.attr_high)
    }
}

/// A 16-byte long mode system descriptor (LDT or TSS).
///
/// Same as [`GdtEntry`] in its first eight bytes, followed by the top 32 bits
/// of the base and a must-be-zero dword.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SystemDescriptor {
    pub limit_low: u16,
    pub base_low: u16,
    pub base_middle: u8,
    pub attr_low: u8,
    pub attr_high: u8,
    pub base_high: u8,
    pub base_upper: u32,
    pub mbz: u32,
}

const_assert_eq!(size_of::<SystemDescriptor>(), 2 * size_of::<GdtEntry>());

impl SystemDescriptor {
    pub const fn new(base: u64, limit: u32, attributes: SegmentAttributes) -> Self {
        let low = GdtEntry::new(base as u32, limit, attributes);
        Self {
            limit_low: low.limit_low,
            base_low: low.base_low,
            base_middle: low.base_middle,
            attr_low: low.attr_low,
            attr_high: low.attr_high,
            base_high: low.base_high,
            base_upper: (base >> 32) as u32,
            mbz: 0,
        }
    }

    /// The full 64-bit base, reassembled from its four split fields.
    pub const fn base(&self) -> u64 {
        (self.base_upper as u64) << 32
            | (self.base_high as u64) << 24
            | (self.base_middle as u64) << 16
            | self.base_low as u64
    }

    /// The 20-bit limit, reassembled from its two split fields.
    pub const fn limit(&self) -> u32 {
        ((self.attr_high & 0xf) as u32) << 16 | self.limit_low as u32
    }

    pub const fn attributes(&self) -> SegmentAttributes {
        SegmentAttributes::from_descriptor(self.attr_low, self.attr_high)
    }

    /// Reads the descriptor occupying slots `index` and `index + 1` of the
    /// descriptor table `gdt`. Returns `None` if the table is too short.
    pub fn read_from_table(gdt: &[u8], index: u16) -> Option<Self> {
        let offset = usize::from(index) * size_of::<GdtEntry>();
        let (descriptor, _) = Self::read_from_prefix(gdt.get(offset..)?).ok()?;
        Some(descriptor)
    }
}

/// The 10-byte operand of `sgdt`/`sidt`/`lgdt`/`lidt`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u64,
}

const_assert_eq!(size_of::<DescriptorTablePointer>(), 10);

impl DescriptorTablePointer {
    /// The size of the table in bytes.
    pub fn len(&self) -> usize {
        usize::from({ self.limit }) + 1
    }
}
