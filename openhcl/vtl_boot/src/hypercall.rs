// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypercall infrastructure.

use crate::interrupts::IrqSaveGuard;
use crate::interrupts::LocalInterrupts;
use arrayvec::ArrayVec;
use hv_abi::HV_PAGE_SIZE_USIZE;
use hv_abi::HvError;
use hv_abi::HvResult;
use hv_abi::HypercallCode;
use hv_abi::Vtl;
use hv_abi::hypercall::Control;
use hv_abi::hypercall::EnableVpVtlX64;
use hv_abi::hypercall::HypercallOutput;
use hv_abi::hypercall::InitialVpContextX64;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Page-aligned, page-sized buffer for use with hypercalls
#[repr(C, align(4096))]
pub struct HvcallPage {
    /// The page contents.
    pub buffer: [u8; HV_PAGE_SIZE_USIZE],
}

impl HvcallPage {
    /// Returns a zeroed page.
    pub const fn new() -> Self {
        HvcallPage {
            buffer: [0; HV_PAGE_SIZE_USIZE],
        }
    }
}

impl Default for HvcallPage {
    fn default() -> Self {
        Self::new()
    }
}

/// Access to the current processor's hypercall input and output pages.
///
/// The pages are per logical CPU. Implementations must only be used with
/// local interrupts disabled, which [`HvCall`] guarantees.
pub trait HypercallIo {
    /// The input page.
    fn input_page(&mut self) -> &mut HvcallPage;
    /// The output page.
    fn output_page(&self) -> &HvcallPage;
    /// Issues a hypercall against the input and output pages.
    fn invoke(&mut self, control: Control) -> HypercallOutput;
}

/// Exclusive use of the current processor's hypercall pages.
///
/// Local interrupts stay disabled for as long as this exists, so an interrupt
/// handler on the same processor cannot reuse the pages underneath a
/// hypercall sequence.
pub struct HvCall<'a, H: ?Sized, I: LocalInterrupts + ?Sized> {
    io: &'a mut H,
    _irq: IrqSaveGuard<'a, I>,
}

impl<'a, H: HypercallIo + ?Sized, I: LocalInterrupts + ?Sized> HvCall<'a, H, I> {
    /// Disables interrupts and takes the hypercall pages.
    pub fn new(io: &'a mut H, irq: &'a I) -> Self {
        let irq = IrqSaveGuard::new(irq);
        Self { io, _irq: irq }
    }

    /// Makes a hypercall.
    /// rep_count is Some for rep hypercalls
    fn dispatch_hvcall(
        &mut self,
        code: HypercallCode,
        rep_count: Option<usize>,
    ) -> HypercallOutput {
        let control = Control::new()
            .with_code(code.0)
            .with_rep_count(rep_count.unwrap_or_default());

        self.io.invoke(control)
    }

    /// Writes the VP activation request into the input page.
    ///
    /// The request is fully rewritten, so nothing from a previous hypercall
    /// leaks into it. It is consumed by both [`Self::enable_vp_vtl`] and
    /// [`Self::start_virtual_processor`], whose inputs share one layout.
    pub fn prepare_vp_activation(
        &mut self,
        vp_index: u32,
        target_vtl: Vtl,
        context: &InitialVpContextX64,
    ) {
        let request = EnableVpVtlX64 {
            partition_id: hv_abi::HV_PARTITION_ID_SELF,
            vp_index,
            target_vtl: target_vtl.into(),
            reserved: [0; 3],
            vp_vtl_context: *context,
        };

        // PANIC: Infallable, since the request is less than the size of a page
        request
            .write_to_prefix(self.io.input_page().buffer.as_mut_slice())
            .unwrap();
    }

    /// Hypercall to enable the target VTL on the VP in the prepared request.
    ///
    /// A VTL that is already enabled is not an error.
    pub fn enable_vp_vtl(&mut self) -> HvResult<()> {
        let output = self.dispatch_hvcall(HypercallCode::HvCallEnableVpVtl, None);
        match output.result() {
            Ok(()) | Err(HvError::VtlAlreadyEnabled) => Ok(()),
            err => err,
        }
    }

    /// Hypercall to start the VP in the prepared request.
    pub fn start_virtual_processor(&mut self) -> HvResult<()> {
        self.dispatch_hvcall(HypercallCode::HvCallStartVirtualProcessor, None)
            .result()
    }

    /// Gets the VP indices for a list of APIC IDs.
    ///
    /// This always queries VTL0, since the hardware IDs are the same across
    /// the VTLs in practice, and the hypercall only succeeds for VTL2 once VTL2
    /// has been enabled (which it might not be at this point).
    pub fn get_vp_indices_from_apic_ids<const N: usize>(
        &mut self,
        apic_ids: &[u32],
        output: &mut ArrayVec<u32, N>,
    ) -> HvResult<()> {
        let header = hv_abi::hypercall::GetVpIndexFromApicId {
            partition_id: hv_abi::HV_PARTITION_ID_SELF,
            target_vtl: 0,
            reserved: [0; 7],
        };

        // Split the call up to avoid exceeding the hypercall input/output size limits.
        const MAX_PER_CALL: usize = 512;

        for apic_ids in apic_ids.chunks(MAX_PER_CALL) {
            // PANIC: Infallable, since the hypercall header is less than the size of a page
            header
                .write_to_prefix(self.io.input_page().buffer.as_mut_slice())
                .unwrap();
            // PANIC: Infallable, since the hypercall parameters are chunked to be less
            // than the remaining size (after the header) of the input page.
            apic_ids
                .write_to_prefix(&mut self.io.input_page().buffer[header.as_bytes().len()..])
                .unwrap();

            let r = self.dispatch_hvcall(
                HypercallCode::HvCallGetVpIndexFromApicId,
                Some(apic_ids.len()),
            );

            // The hypervisor never reports more elements than were asked for.
            let n = r.elements_processed().min(apic_ids.len());
            if output.remaining_capacity() < n {
                return Err(HvError::InsufficientMemory);
            }
            output.extend(
                // PANIC: Infallable, since n elements fit in the output page.
                <[u32]>::ref_from_bytes(&self.io.output_page().buffer[..n * 4])
                    .unwrap()
                    .iter()
                    .copied(),
            );
            r.result()?;
            if n != apic_ids.len() {
                return Err(HvError::InvalidHypercallInput);
            }
        }

        Ok(())
    }

    /// Gets the VP index for a single APIC ID.
    pub fn get_vp_index_from_apic_id(&mut self, apic_id: u32) -> HvResult<u32> {
        let mut output = ArrayVec::<u32, 1>::new();
        self.get_vp_indices_from_apic_ids(&[apic_id], &mut output)?;
        output.first().copied().ok_or(HvError::InvalidHypercallInput)
    }
}
