// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Microsoft hypervisor definitions used to bring up virtual processors from
//! inside a VTL.

#![no_std]

use bitfield_struct::bitfield;
use core::fmt::Debug;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const HV_PAGE_SIZE: u64 = 4096;
pub const HV_PAGE_SIZE_USIZE: usize = 4096;

pub const HV_PARTITION_ID_SELF: u64 = u64::MAX;

pub const HV_CPUID_FUNCTION_MS_HV_IMPLEMENTATION_LIMITS: u32 = 0x40000005;

/// A hypercall code, as placed in the low 16 bits of the hypercall control
/// value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct HypercallCode(pub u16);

#[allow(non_upper_case_globals, reason = "names match the TLFS")]
impl HypercallCode {
    pub const HvCallEnableVpVtl: Self = Self(0x000f);
    pub const HvCallStartVirtualProcessor: Self = Self(0x0099);
    pub const HvCallGetVpIndexFromApicId: Self = Self(0x009A);

    fn debug_name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::HvCallEnableVpVtl => "HvCallEnableVpVtl",
            Self::HvCallStartVirtualProcessor => "HvCallStartVirtualProcessor",
            Self::HvCallGetVpIndexFromApicId => "HvCallGetVpIndexFromApicId",
            _ => return None,
        })
    }
}

impl Debug for HypercallCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.debug_name() {
            Some(name) => f.pad(name),
            None => write!(f, "{:#06x}", self.0),
        }
    }
}

/// A hypervisor status code.
///
/// The non-success status codes are defined in [`HvError`].
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct HvStatus(pub u16);

impl HvStatus {
    /// The success status code.
    pub const SUCCESS: Self = Self(0);

    /// Returns `Ok(())` if this is `HvStatus::SUCCESS`, otherwise returns an
    /// `Err(err)` where `err` is the corresponding `HvError`.
    pub fn result(self) -> HvResult<()> {
        if let Ok(err) = self.0.try_into() {
            Err(HvError(err))
        } else {
            Ok(())
        }
    }

    const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    const fn into_bits(self) -> u16 {
        self.0
    }
}

impl From<Result<(), HvError>> for HvStatus {
    fn from(err: Result<(), HvError>) -> Self {
        err.err().map_or(Self::SUCCESS, |err| Self(err.0.get()))
    }
}

impl Debug for HvStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.result() {
            Ok(()) => f.write_str("Success"),
            Err(err) => Debug::fmt(&err, f),
        }
    }
}

/// An [`HvStatus`] value representing an error.
//
// DEVNOTE: use `NonZeroU16` to get a niche optimization, since 0 is reserved
// for success.
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct HvError(core::num::NonZeroU16);

impl HvError {
    /// The raw status code.
    pub fn code(&self) -> u16 {
        self.0.get()
    }
}

impl From<core::num::NonZeroU16> for HvError {
    fn from(err: core::num::NonZeroU16) -> Self {
        Self(err)
    }
}

impl Debug for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.debug_name() {
            Some(name) => f.pad(name),
            None => Debug::fmt(&self.0.get(), f),
        }
    }
}

impl core::fmt::Display for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.doc_str() {
            Some(s) => f.write_str(s.trim_start()),
            None => write!(f, "Hypervisor error {:#06x}", self.0),
        }
    }
}

impl core::error::Error for HvError {}

macro_rules! hv_error {
    ($ty:ty, $(#[doc = $doc:expr] $ident:ident = $val:expr),* $(,)?) => {

        #[allow(non_upper_case_globals, reason = "names match the TLFS")]
        impl $ty {
            $(
                #[doc = $doc]
                pub const $ident: Self = Self(core::num::NonZeroU16::new($val).unwrap());
            )*

            fn debug_name(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => stringify!($ident),
                    )*
                    _ => return None,
                })
            }

            fn doc_str(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => $doc,
                    )*
                    _ => return None,
                })
            }
        }
    };
}

// DEVNOTE: the doc comments here are also used as the runtime error strings.
hv_error! {
    HvError,
    /// Invalid hypercall code
    InvalidHypercallCode = 0x0002,
    /// Invalid hypercall input
    InvalidHypercallInput = 0x0003,
    /// Invalid alignment
    InvalidAlignment = 0x0004,
    /// Invalid parameter
    InvalidParameter = 0x0005,
    /// Access denied
    AccessDenied = 0x0006,
    /// Invalid partition state
    InvalidPartitionState = 0x0007,
    /// Operation denied
    OperationDenied = 0x0008,
    /// Insufficient memory
    InsufficientMemory = 0x000B,
    /// Invalid partition ID
    InvalidPartitionId = 0x000D,
    /// Invalid VP index
    InvalidVpIndex = 0x000E,
    /// Not found
    NotFound = 0x0010,
    /// Invalid VP state
    InvalidVpState = 0x0015,
    /// Processor startup timeout
    ProcessorStartupTimeout = 0x003E,
    /// Invalid register value
    InvalidRegisterValue = 0x0050,
    /// Invalid VTL state
    InvalidVtlState = 0x0051,
    /// Operation failed
    OperationFailed = 0x0071,
    /// The specified timeout expired before the operation completed.
    Timeout = 0x0078,
    /// The VTL specified for the operation is already in an enabled state.
    VtlAlreadyEnabled = 0x0086,
    /// Unknown register name
    UnknownRegisterName = 0x0087,
}

/// A useful result type for hypervisor operations.
pub type HvResult<T> = Result<T, HvError>;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Vtl {
    Vtl0 = 0,
    Vtl1 = 1,
    Vtl2 = 2,
}

impl Vtl {
    /// The management VTL, into which secondary processors are started.
    pub const MGMT: Self = Self::Vtl2;
}

impl TryFrom<u8> for Vtl {
    type Error = HvError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Vtl0,
            1 => Self::Vtl1,
            2 => Self::Vtl2,
            _ => return Err(HvError::InvalidParameter),
        })
    }
}

impl From<Vtl> for u8 {
    fn from(value: Vtl) -> Self {
        value as u8
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64TableRegister {
    pub pad: [u16; 3],
    pub limit: u16,
    pub base: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64SegmentRegister {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: u16,
}

const_assert_eq!(size_of::<HvX64TableRegister>(), 16);
const_assert_eq!(size_of::<HvX64SegmentRegister>(), 16);

pub mod hypercall {
    use super::*;
    use core::mem::offset_of;

    /// The hypercall input value.
    #[bitfield(u64)]
    pub struct Control {
        /// The hypercall code.
        pub code: u16,
        /// If this hypercall is a fast hypercall.
        pub fast: bool,
        /// The variable header size, in qwords.
        #[bits(10)]
        pub variable_header_size: usize,
        #[bits(4)]
        _rsvd0: u8,
        /// Specifies that the hypercall should be handled by the L0 hypervisor in a nested environment.
        pub nested: bool,
        /// The element count for rep hypercalls.
        #[bits(12)]
        pub rep_count: usize,
        #[bits(4)]
        _rsvd1: u8,
        /// The first element to start processing in a rep hypercall.
        #[bits(12)]
        pub rep_start: usize,
        #[bits(4)]
        _rsvd2: u8,
    }

    /// The hypercall output value returned to the guest.
    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[must_use]
    pub struct HypercallOutput {
        #[bits(16)]
        pub call_status: HvStatus,
        pub rsvd: u16,
        #[bits(12)]
        pub elements_processed: usize,
        #[bits(20)]
        pub rsvd2: u32,
    }

    impl From<HvError> for HypercallOutput {
        fn from(e: HvError) -> Self {
            Self::new().with_call_status(Err(e).into())
        }
    }

    impl HypercallOutput {
        /// A success output with zero elements processed.
        pub const SUCCESS: Self = Self::new();

        pub fn result(&self) -> Result<(), HvError> {
            self.call_status().result()
        }
    }

    /// The architectural state a VP starts executing with.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct InitialVpContextX64 {
        pub rip: u64,
        pub rsp: u64,
        pub rflags: u64,
        pub cs: HvX64SegmentRegister,
        pub ds: HvX64SegmentRegister,
        pub es: HvX64SegmentRegister,
        pub fs: HvX64SegmentRegister,
        pub gs: HvX64SegmentRegister,
        pub ss: HvX64SegmentRegister,
        pub tr: HvX64SegmentRegister,
        pub ldtr: HvX64SegmentRegister,
        pub idtr: HvX64TableRegister,
        pub gdtr: HvX64TableRegister,
        pub efer: u64,
        pub cr0: u64,
        pub cr3: u64,
        pub cr4: u64,
        pub msr_cr_pat: u64,
    }

    const_assert_eq!(size_of::<InitialVpContextX64>(), 0xe0);

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct EnableVpVtlX64 {
        pub partition_id: u64,
        pub vp_index: u32,
        pub target_vtl: u8,
        pub reserved: [u8; 3],
        pub vp_vtl_context: InitialVpContextX64,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct StartVirtualProcessorX64 {
        pub partition_id: u64,
        pub vp_index: u32,
        pub target_vtl: u8,
        pub rsvd0: u8,
        pub rsvd1: u16,
        pub vp_context: InitialVpContextX64,
    }

    // The two inputs share a layout, so one populated buffer serves both calls.
    const_assert_eq!(
        size_of::<EnableVpVtlX64>(),
        size_of::<StartVirtualProcessorX64>()
    );
    const_assert_eq!(
        offset_of!(EnableVpVtlX64, target_vtl),
        offset_of!(StartVirtualProcessorX64, target_vtl)
    );
    const_assert_eq!(
        offset_of!(EnableVpVtlX64, vp_vtl_context),
        offset_of!(StartVirtualProcessorX64, vp_context)
    );

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GetVpIndexFromApicId {
        pub partition_id: u64,
        pub target_vtl: u8,
        pub reserved: [u8; 7],
    }

    const_assert_eq!(size_of::<GetVpIndexFromApicId>(), 16);
}
