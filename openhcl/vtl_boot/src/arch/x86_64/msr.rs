// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MSR access.

use core::arch::asm;

/// Reads a value from an MSR.
///
/// # Safety
/// The caller must guarantee that this is a safe operation, based on the
/// behavior of the specified MSR.
#[inline]
pub unsafe fn read_msr(msr: u32) -> u64 {
    let mut low: u32;
    let mut high: u32;
    // SAFETY: Using the `rdmsr` instruction as described in the processor
    // vendors Software Development Manuals.
    unsafe {
        asm!(r#"
        rdmsr
        "#,
        out("eax") low,
        out("edx") high,
        in("ecx") msr,
        options(nostack, preserves_flags));
    }
    (u64::from(high) << 32) | u64::from(low)
}
