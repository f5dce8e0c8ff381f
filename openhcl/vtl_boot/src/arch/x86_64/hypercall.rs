// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypercall architecture-dependent infrastructure.
//!
//! The hypercall ABI for x64 is well documented in the TLFS.

use crate::hypercall::HvcallPage;
use crate::hypercall::HypercallIo;
use core::ptr::NonNull;
use hv_abi::hypercall::Control;
use hv_abi::hypercall::HypercallOutput;

/// The current processor's hypercall pages, as set up by the kernel.
pub struct X64HypercallIo {
    input: NonNull<HvcallPage>,
    input_gpa: u64,
    output: NonNull<HvcallPage>,
    output_gpa: u64,
    hypercall_page: NonNull<u8>,
}

impl X64HypercallIo {
    /// Wraps the current processor's hypercall input and output pages.
    ///
    /// # Safety
    /// `input` and `output` must be valid, distinct, page-aligned pages at
    /// guest physical addresses `input_gpa` and `output_gpa`, used by nothing
    /// else while this object exists. `hypercall_page` must be the mapped
    /// hypercall code page.
    pub unsafe fn new(
        input: NonNull<HvcallPage>,
        input_gpa: u64,
        output: NonNull<HvcallPage>,
        output_gpa: u64,
        hypercall_page: NonNull<u8>,
    ) -> Self {
        Self {
            input,
            input_gpa,
            output,
            output_gpa,
            hypercall_page,
        }
    }
}

impl HypercallIo for X64HypercallIo {
    fn input_page(&mut self) -> &mut HvcallPage {
        // SAFETY: the page is valid and exclusively ours, per the
        // constructor's contract.
        unsafe { self.input.as_mut() }
    }

    fn output_page(&self) -> &HvcallPage {
        // SAFETY: the page is valid and exclusively ours, per the
        // constructor's contract.
        unsafe { self.output.as_ref() }
    }

    fn invoke(&mut self, control: Control) -> HypercallOutput {
        let output: u64;
        // SAFETY: the hypercall page is mapped and the input and output pages
        // are not being concurrently used elsewhere. The hypervisor only
        // writes the output page.
        unsafe {
            core::arch::asm! {
                "call {hypercall_page}",
                hypercall_page = in(reg) self.hypercall_page.as_ptr(),
                inout("rcx") u64::from(control) => _,
                inout("rdx") self.input_gpa => _,
                inout("r8") self.output_gpa => _,
                out("r9") _,
                out("r10") _,
                out("r11") _,
                out("rax") output,
            }
        }
        output.into()
    }
}
