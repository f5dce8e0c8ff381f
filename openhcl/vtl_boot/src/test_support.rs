// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fakes of the host seams for unit tests.

extern crate std;

use crate::bringup::WakeupSecondaryCpu;
use crate::context::CpuState;
use crate::hypercall::HvcallPage;
use crate::hypercall::HypercallIo;
use crate::interrupts::IrqFlags;
use crate::interrupts::LocalInterrupts;
use crate::resolver::CpuTopology;
use crate::restart::FaultTrigger;
use core::cell::Cell;
use hv_abi::HvError;
use hv_abi::HvStatus;
use hv_abi::HypercallCode;
use hv_abi::hypercall::Control;
use hv_abi::hypercall::HypercallOutput;
use std::boxed::Box;
use std::fmt::Write;
use std::string::String;
use std::sync::Arc;
use std::sync::Mutex;
use std::vec::Vec;
use tracing::Event;
use tracing::Subscriber;
use tracing::field::Field;
use tracing::field::Visit;
use tracing_subscriber::layer::Context;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::layer::SubscriberExt;
use x86_descriptors::DescriptorTablePointer;
use x86_descriptors::GdtEntry;
use x86_descriptors::SystemDescriptor;
use zerocopy::IntoBytes;

const RFLAGS_IF: u64 = 0x200;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Tracks the interrupt flag of the test thread.
pub struct FakeInterrupts {
    depth: Cell<u32>,
    max_depth: Cell<u32>,
}

impl FakeInterrupts {
    pub fn new(enabled: bool) -> Self {
        INTERRUPTS_ENABLED.set(enabled);
        Self {
            depth: Cell::new(0),
            max_depth: Cell::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        INTERRUPTS_ENABLED.get()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth.get()
    }
}

impl LocalInterrupts for FakeInterrupts {
    fn save_and_disable(&self) -> IrqFlags {
        let flags = if INTERRUPTS_ENABLED.replace(false) {
            IrqFlags(0x2 | RFLAGS_IF)
        } else {
            IrqFlags(0x2)
        };
        self.depth.set(self.depth.get() + 1);
        self.max_depth
            .set(self.max_depth.get().max(self.depth.get()));
        flags
    }

    fn restore(&self, flags: IrqFlags) {
        self.depth.set(self.depth.get() - 1);
        INTERRUPTS_ENABLED.set(flags.0 & RFLAGS_IF != 0);
    }
}

/// A hypercall as the fake hypervisor saw it.
pub struct RecordedCall {
    pub code: HypercallCode,
    pub rep_count: usize,
    pub input: Vec<u8>,
    pub interrupts_enabled: bool,
}

/// A hypervisor that records hypercalls and answers with scripted statuses.
pub struct FakeHypervisor {
    input: Box<HvcallPage>,
    output: Box<HvcallPage>,
    calls: Vec<RecordedCall>,
    enable_status: HvStatus,
    start_status: HvStatus,
    apic_map: Vec<(u32, u32)>,
    elements_processed: Option<usize>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            input: Box::new(HvcallPage::new()),
            output: Box::new(HvcallPage::new()),
            calls: Vec::new(),
            enable_status: HvStatus::SUCCESS,
            start_status: HvStatus::SUCCESS,
            apic_map: Vec::new(),
            elements_processed: None,
        }
    }

    pub fn fail_enable(&mut self, err: HvError) {
        self.enable_status = Err(err).into();
    }

    pub fn fail_start(&mut self, err: HvError) {
        self.start_status = Err(err).into();
    }

    pub fn map_apic_id(&mut self, apic_id: u32, vp_index: u32) {
        self.apic_map.push((apic_id, vp_index));
    }

    /// Makes successful VP index lookups report `count` elements processed,
    /// whatever was asked for.
    pub fn report_elements_processed(&mut self, count: usize) {
        self.elements_processed = Some(count);
    }

    pub fn calls(&self) -> &[RecordedCall] {
        &self.calls
    }

    fn lookup_vp_indices(&mut self, count: usize) -> HypercallOutput {
        const HEADER_SIZE: usize = 16;
        for i in 0..count {
            let offset = HEADER_SIZE + i * 4;
            let apic_id =
                u32::from_le_bytes(self.input.buffer[offset..offset + 4].try_into().unwrap());
            let Some(&(_, vp_index)) = self.apic_map.iter().find(|(id, _)| *id == apic_id) else {
                return HypercallOutput::from(HvError::InvalidParameter).with_elements_processed(i);
            };
            self.output.buffer[i * 4..i * 4 + 4].copy_from_slice(vp_index.as_bytes());
        }
        HypercallOutput::SUCCESS
            .with_elements_processed(self.elements_processed.unwrap_or(count))
    }
}

impl HypercallIo for FakeHypervisor {
    fn input_page(&mut self) -> &mut HvcallPage {
        &mut self.input
    }

    fn output_page(&self) -> &HvcallPage {
        &self.output
    }

    fn invoke(&mut self, control: Control) -> HypercallOutput {
        let code = HypercallCode(control.code());
        self.calls.push(RecordedCall {
            code,
            rep_count: control.rep_count(),
            input: self.input.buffer.to_vec(),
            interrupts_enabled: INTERRUPTS_ENABLED.get(),
        });

        match code {
            HypercallCode::HvCallEnableVpVtl => {
                HypercallOutput::new().with_call_status(self.enable_status)
            }
            HypercallCode::HvCallStartVirtualProcessor => {
                HypercallOutput::new().with_call_status(self.start_status)
            }
            HypercallCode::HvCallGetVpIndexFromApicId => {
                self.lookup_vp_indices(control.rep_count())
            }
            _ => HvError::InvalidHypercallCode.into(),
        }
    }
}

/// Present CPUs numbered in order, with the given APIC IDs.
pub struct FakeTopology {
    apic_ids: Vec<u32>,
}

impl FakeTopology {
    pub fn new(apic_ids: &[u32]) -> Self {
        Self {
            apic_ids: apic_ids.to_vec(),
        }
    }

    pub fn stack_top(cpu: u32) -> u64 {
        0xffffc90000000000 + (u64::from(cpu) + 1) * 0x4000
    }
}

impl CpuTopology for FakeTopology {
    fn present_cpus(&self) -> impl Iterator<Item = u32> + '_ {
        0..self.apic_ids.len() as u32
    }

    fn apic_id(&self, cpu: u32) -> u32 {
        self.apic_ids[cpu as usize]
    }

    fn idle_stack_top(&self, cpu: u32) -> u64 {
        Self::stack_top(cpu)
    }
}

/// A boot processor snapshot with a 16-entry GDT laid out like the kernel's.
pub struct FakeCpuState {
    pub gdtr: DescriptorTablePointer,
    pub idtr: DescriptorTablePointer,
    pub gdt: [u8; 128],
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub pat: u64,
}

impl FakeCpuState {
    pub const TSS_BASE: u64 = 0xfffffe0000003000;
    pub const TSS_LIMIT: u32 = 0x4087;
    pub const LDT_BASE: u64 = 0xffff888100020000;
    pub const LDT_LIMIT: u32 = 0xffff;

    pub fn new() -> Self {
        let mut gdt = [0; 128];
        let mut put = |index: u16, bytes: &[u8]| {
            let offset = usize::from(index) * 8;
            gdt[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        put(
            x86_descriptors::GDT_ENTRY_KERNEL_CS,
            GdtEntry::new(
                0,
                0xfffff,
                x86_descriptors::X64_DEFAULT_CODE_SEGMENT_ATTRIBUTES,
            )
            .as_bytes(),
        );
        put(
            x86_descriptors::GDT_ENTRY_KERNEL_DS,
            GdtEntry::new(
                0,
                0xfffff,
                x86_descriptors::X64_DEFAULT_DATA_SEGMENT_ATTRIBUTES,
            )
            .as_bytes(),
        );
        put(
            x86_descriptors::GDT_ENTRY_TSS,
            SystemDescriptor::new(
                Self::TSS_BASE,
                Self::TSS_LIMIT,
                x86_descriptors::X64_BUSY_TSS_SEGMENT_ATTRIBUTES,
            )
            .as_bytes(),
        );
        put(
            x86_descriptors::GDT_ENTRY_LDT,
            SystemDescriptor::new(
                Self::LDT_BASE,
                Self::LDT_LIMIT,
                x86_descriptors::X64_LDT_SEGMENT_ATTRIBUTES,
            )
            .as_bytes(),
        );

        Self {
            gdtr: DescriptorTablePointer {
                limit: 127,
                base: 0xfffffe0000001000,
            },
            idtr: DescriptorTablePointer {
                limit: 0xfff,
                base: 0xfffffe0000000000,
            },
            gdt,
            cr0: x86_descriptors::X64_CR0_PG
                | x86_descriptors::X64_CR0_WP
                | x86_descriptors::X64_CR0_NE
                | x86_descriptors::X64_CR0_PE,
            cr3: 0x10c0a000,
            cr4: x86_descriptors::X64_CR4_PAE | x86_descriptors::X64_CR4_PGE,
            efer: x86_descriptors::X64_EFER_NXE
                | x86_descriptors::X64_EFER_LMA
                | x86_descriptors::X64_EFER_LME
                | x86_descriptors::X64_EFER_SCE,
            pat: x86_descriptors::X86X_MSR_DEFAULT_PAT,
        }
    }
}

impl CpuState for FakeCpuState {
    fn gdtr(&self) -> DescriptorTablePointer {
        self.gdtr
    }

    fn idtr(&self) -> DescriptorTablePointer {
        self.idtr
    }

    fn descriptor_table(&self, table: &DescriptorTablePointer) -> &[u8] {
        &self.gdt[..table.len().min(self.gdt.len())]
    }

    fn cr0(&self) -> u64 {
        self.cr0
    }

    fn cr3(&self) -> u64 {
        self.cr3
    }

    fn cr4(&self) -> u64 {
        self.cr4
    }

    fn efer(&self) -> u64 {
        self.efer
    }

    fn pat(&self) -> u64 {
        self.pat
    }
}

/// Counts restart attempts and panics after `limit` of them.
pub struct PanickingFaultTrigger {
    limit: u32,
    pub invalidations: u32,
    pub faults: u32,
}

impl PanickingFaultTrigger {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            invalidations: 0,
            faults: 0,
        }
    }
}

impl FaultTrigger for PanickingFaultTrigger {
    fn invalidate_idt(&mut self) {
        self.invalidations += 1;
    }

    fn trigger_fault(&mut self) {
        assert_eq!(self.invalidations, self.faults + 1, "fault with a valid idt");
        self.faults += 1;
        if self.faults == self.limit {
            panic!("triple fault");
        }
    }
}

/// Records wakeup requests and reports success.
#[derive(Default)]
pub struct RecordingWakeup {
    pub calls: Vec<(u32, u64)>,
}

impl WakeupSecondaryCpu for RecordingWakeup {
    fn wakeup_secondary_cpu(&mut self, apic_id: u32, start_eip: u64) -> i32 {
        self.calls.push((apic_id, start_eip));
        0
    }
}

/// Collects the events logged on the current thread while [`Self::capture`]
/// runs, each formatted as `LEVEL name=value ...`.
#[derive(Clone, Default)]
pub struct EventRecorder(Arc<Mutex<Vec<String>>>);

impl EventRecorder {
    pub fn capture<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl<S: Subscriber> Layer<S> for EventRecorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldWriter(String::new());
        write!(fields.0, "{}", event.metadata().level()).unwrap();
        event.record(&mut fields);
        self.0.lock().unwrap().push(fields.0);
    }
}

struct FieldWriter(String);

impl Visit for FieldWriter {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        write!(self.0, " {}={:?}", field.name(), value).unwrap();
    }
}
