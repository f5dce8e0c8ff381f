// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Starting a secondary processor in VTL2.

use crate::hypercall::HvCall;
use crate::hypercall::HypercallIo;
use crate::interrupts::LocalInterrupts;
use hv_abi::HvError;
use hv_abi::Vtl;
use hv_abi::hypercall::InitialVpContextX64;
use thiserror::Error;

/// Error activating a VP.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActivateError {
    /// `HvCallEnableVpVtl` failed.
    #[error("failed to enable vtl2 on vp {vp_index}")]
    EnableVpVtl {
        /// The target VP.
        vp_index: u32,
        /// The hypervisor status.
        #[source]
        err: HvError,
    },
    /// `HvCallStartVirtualProcessor` failed.
    #[error("failed to start vp {vp_index}")]
    StartVp {
        /// The target VP.
        vp_index: u32,
        /// The hypervisor status.
        #[source]
        err: HvError,
    },
}

impl ActivateError {
    /// The hypervisor status of the failed call.
    pub fn status(&self) -> HvError {
        match *self {
            ActivateError::EnableVpVtl { err, .. } | ActivateError::StartVp { err, .. } => err,
        }
    }
}

/// Enables VTL2 on `vp_index` and starts it with `context`.
///
/// Local interrupts are disabled for the whole sequence and restored on
/// return. The start call is not issued if enabling VTL2 fails, and neither
/// call is retried.
pub fn activate_vp(
    hv: &mut (impl HypercallIo + ?Sized),
    irq: &(impl LocalInterrupts + ?Sized),
    vp_index: u32,
    context: &InitialVpContextX64,
) -> Result<(), ActivateError> {
    let mut call = HvCall::new(hv, irq);
    call.prepare_vp_activation(vp_index, Vtl::MGMT, context);

    call.enable_vp_vtl().map_err(|err| {
        tracing::error!(vp_index, status = ?err, "failed to enable vtl2");
        ActivateError::EnableVpVtl { vp_index, err }
    })?;

    call.start_virtual_processor().map_err(|err| {
        tracing::error!(vp_index, status = ?err, "failed to start vp");
        ActivateError::StartVp { vp_index, err }
    })?;

    Ok(())
}
