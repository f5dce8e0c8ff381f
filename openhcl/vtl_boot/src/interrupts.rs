// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Local interrupt masking around per-CPU state.

/// The interrupt state saved by [`LocalInterrupts::save_and_disable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IrqFlags(pub u64);

/// Masks and unmasks interrupts on the current processor.
pub trait LocalInterrupts {
    /// Saves the current interrupt state and disables interrupts.
    fn save_and_disable(&self) -> IrqFlags;
    /// Restores the interrupt state saved by `save_and_disable`.
    fn restore(&self, flags: IrqFlags);
}

/// Keeps local interrupts disabled until dropped, then restores whatever
/// state was in effect when it was created.
#[must_use]
pub struct IrqSaveGuard<'a, I: LocalInterrupts + ?Sized> {
    irq: &'a I,
    flags: IrqFlags,
}

impl<'a, I: LocalInterrupts + ?Sized> IrqSaveGuard<'a, I> {
    /// Disables interrupts.
    pub fn new(irq: &'a I) -> Self {
        let flags = irq.save_and_disable();
        Self { irq, flags }
    }
}

impl<I: LocalInterrupts + ?Sized> Drop for IrqSaveGuard<'_, I> {
    fn drop(&mut self) {
        self.irq.restore(self.flags);
    }
}
