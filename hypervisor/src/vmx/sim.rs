//! A software model of a VMX capable processor for the unit tests.
//!
//! It keeps every register, MSR and VMCS field in memory, checks the
//! preconditions of the VMX instructions that matter for bring-up and records
//! privileged operations so tests can assert on their order.

use crate::{
    utils::processor::ProcessorExecutor,
    vmx::cpu::{
        ControlRegister, CpuidResult, Processor, SegmentSelectors, TableRegister, VmcsAccess,
    },
};
use std::{collections::HashMap, vec::Vec};
use x86::{
    msr,
    vmx::{vmcs::ro, Result, VmFail},
};

const CR4_VMXE: u64 = 1 << 13;
const RFLAGS_IF: u64 = 1 << 9;

/// The VMCS that [`SimulatedProcessor::enter_vmx_with_current_vmcs`] loads.
pub const SCRATCH_VMCS: u64 = 0x7_F000;

const EXIT_ENTRY_POINT: u64 = 0xFFFF_F800_0DEA_D000;
const INTERRUPT_ENTRY_POINTS: u64 = 0xFFFF_F800_0BEE_F000;

const GDT_BASE: u64 = 0xFFFF_F800_0010_0000;
const IDT_BASE: u64 = 0xFFFF_F800_0010_1000;

/// Flat 64-bit code at 0x08, flat data at 0x10 and a TSS at 0x20.
const GDT: [u64; 6] = [
    0,
    0x00AF_9B00_0000_FFFF,
    0x00CF_9300_0000_FFFF,
    0,
    0x0100_8B20_0000_0067,
    0x0000_0000_FFFF_F800,
];

/// A privileged operation that changed processor state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    WriteMsr(u32, u64),
    WriteCr(ControlRegister, u64),
    DisableInterrupts,
    EnableInterrupts,
    Vmxon(u64),
    Vmxoff,
    Vmclear(u64),
    Vmptrld(u64),
    InveptAllContexts,
    Vmlaunch,
}

pub struct SimulatedProcessor {
    msrs: HashMap<u32, u64>,
    cpuid: HashMap<u32, CpuidResult>,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    rflags: u64,
    selectors: SegmentSelectors,
    physical_offset: u64,

    vmx_operation: bool,
    current_vmcs: Option<u64>,
    vmcs_fields: HashMap<u32, u64>,
    launch_error: Option<u32>,
    launched: bool,

    events: Vec<Event>,
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProcessor {
    /// A processor with VMX support, firmware-enabled VMX and capability MSRs
    /// resembling a recent Intel core.
    pub fn new() -> Self {
        let msrs = HashMap::from([
            (msr::IA32_FEATURE_CONTROL, 0b101),
            (msr::IA32_VMX_BASIC, (1 << 55) | (6 << 50) | (0x1000 << 32) | 0x4),
            (msr::IA32_VMX_PINBASED_CTLS, 0x0000_00FF_0000_0016),
            (msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_00FF_0000_0016),
            (msr::IA32_VMX_PROCBASED_CTLS, 0xFFF9_FFFE_0401_E172),
            (msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xFFF9_FFFE_0400_6172),
            (msr::IA32_VMX_PROCBASED_CTLS2, 0x00FF_FFFF_0000_0000),
            (msr::IA32_VMX_EXIT_CTLS, 0x01FF_FFFF_0003_6DFF),
            (msr::IA32_VMX_TRUE_EXIT_CTLS, 0x01FF_FFFF_0003_6DFB),
            (msr::IA32_VMX_ENTRY_CTLS, 0x0003_FFFF_0000_11FF),
            (msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0003_FFFF_0000_11FB),
            (msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (msr::IA32_VMX_CR0_FIXED1, 0xFFFF_FFFF),
            (msr::IA32_VMX_CR4_FIXED0, CR4_VMXE),
            (msr::IA32_VMX_CR4_FIXED1, 0x0037_67FF),
            (msr::IA32_FS_BASE, 0x0000_0000_0040_0000),
            (msr::IA32_GS_BASE, 0xFFFF_F800_0020_0000),
            (msr::IA32_DEBUGCTL, 0),
            (msr::IA32_SYSENTER_CS, 0),
            (msr::IA32_SYSENTER_ESP, 0),
            (msr::IA32_SYSENTER_EIP, 0),
        ]);

        // Leaf 1 reports VMX in ECX[5].
        //
        let cpuid = HashMap::from([(
            1,
            CpuidResult {
                eax: 0x0009_06EA,
                ebx: 0x0010_0800,
                ecx: 0x7FFA_FBFF,
                edx: 0xBFEB_FBFF,
            },
        )]);

        Self {
            msrs,
            cpuid,
            cr0: 0x8005_0033,
            cr3: 0x001A_D000,
            cr4: 0x0037_06F8,
            rflags: 0x246,
            selectors: SegmentSelectors {
                cs: 0x08,
                ss: 0x10,
                ds: 0x10,
                es: 0x10,
                fs: 0,
                gs: 0,
                tr: 0x20,
                ldtr: 0,
            },
            physical_offset: 0,
            vmx_operation: false,
            current_vmcs: None,
            vmcs_fields: HashMap::new(),
            launch_error: None,
            launched: false,
            events: Vec::new(),
        }
    }

    /// Skips the bring-up: VMX operation with [`SCRATCH_VMCS`] current.
    pub fn enter_vmx_with_current_vmcs(&mut self) {
        self.cr4 |= CR4_VMXE;
        self.vmx_operation = true;
        self.current_vmcs = Some(SCRATCH_VMCS);
    }

    pub fn set_msr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    pub fn set_cpuid(&mut self, leaf: u32, result: CpuidResult) {
        self.cpuid.insert(leaf, result);
    }

    /// Moves every physical address `offset` bytes away from its virtual
    /// address.
    pub fn set_physical_offset(&mut self, offset: u64) {
        self.physical_offset = offset;
    }

    /// Makes the next VMLAUNCH fail with the VM-instruction error `code`.
    pub fn fail_launch(&mut self, code: u32) {
        self.launch_error = Some(code);
    }

    /// Sets up the exit information the processor stores on a VM-exit.
    pub fn simulate_exit(&mut self, reason: u32, rip: u64, instruction_length: u64) {
        self.vmcs_fields.insert(ro::EXIT_REASON, reason as u64);
        self.vmcs_fields.insert(ro::VMEXIT_INSTRUCTION_LEN, instruction_length);
        self.vmcs_fields.insert(x86::vmx::vmcs::guest::RIP, rip);
    }

    /// Writes a VMCS field directly, including read-only ones.
    pub fn set_field(&mut self, field: u32, value: u64) {
        self.vmcs_fields.insert(field, value);
    }

    /// The value of a VMCS field, if anything wrote it.
    pub fn field(&self, field: u32) -> Option<u64> {
        self.vmcs_fields.get(&field).copied()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn current_vmcs(&self) -> Option<u64> {
        self.current_vmcs
    }

    pub fn in_vmx_operation(&self) -> bool {
        self.vmx_operation
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.rflags & RFLAGS_IF != 0
    }

    pub fn launched(&self) -> bool {
        self.launched
    }

    fn require_current_vmcs(&self) -> Result<()> {
        match self.current_vmcs {
            Some(_) => Ok(()),
            None => Err(VmFail::VmFailInvalid),
        }
    }

    fn require_vmx_operation(&self) -> Result<()> {
        if !self.vmx_operation {
            return Err(VmFail::VmFailInvalid);
        }

        Ok(())
    }
}

impl VmcsAccess for SimulatedProcessor {
    fn vmread(&self, field: u32) -> Result<u64> {
        self.require_current_vmcs()?;

        Ok(self.field(field).unwrap_or_default())
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<()> {
        self.require_current_vmcs()?;
        self.vmcs_fields.insert(field, value);

        Ok(())
    }
}

impl Processor for SimulatedProcessor {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
        self.cpuid.get(&leaf).copied().unwrap_or_default()
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or_default()
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        self.events.push(Event::WriteMsr(msr, value));
        self.msrs.insert(msr, value);
    }

    fn read_cr(&self, register: ControlRegister) -> u64 {
        match register {
            ControlRegister::Cr0 => self.cr0,
            ControlRegister::Cr3 => self.cr3,
            ControlRegister::Cr4 => self.cr4,
        }
    }

    fn write_cr(&mut self, register: ControlRegister, value: u64) {
        self.events.push(Event::WriteCr(register, value));

        match register {
            ControlRegister::Cr0 => self.cr0 = value,
            ControlRegister::Cr3 => self.cr3 = value,
            ControlRegister::Cr4 => self.cr4 = value,
        }
    }

    fn read_dr7(&self) -> u64 {
        0x400
    }

    fn read_rflags(&self) -> u64 {
        self.rflags
    }

    fn disable_interrupts(&mut self) {
        self.events.push(Event::DisableInterrupts);
        self.rflags &= !RFLAGS_IF;
    }

    fn enable_interrupts(&mut self) {
        self.events.push(Event::EnableInterrupts);
        self.rflags |= RFLAGS_IF;
    }

    fn gdtr(&self) -> TableRegister {
        TableRegister {
            base: GDT_BASE,
            limit: (GDT.len() * 8 - 1) as u16,
        }
    }

    fn idtr(&self) -> TableRegister {
        TableRegister {
            base: IDT_BASE,
            limit: 0xFFF,
        }
    }

    fn read_table_entry(&self, table: &TableRegister, index: u16) -> u64 {
        match table.base {
            GDT_BASE => GDT.get(index as usize).copied().unwrap_or_default(),
            _ => 0,
        }
    }

    fn segment_selectors(&self) -> SegmentSelectors {
        self.selectors
    }

    fn physical_address(&self, virtual_address: u64) -> Option<u64> {
        virtual_address.checked_add(self.physical_offset)
    }

    fn vmxon(&mut self, physical_address: u64) -> Result<()> {
        self.events.push(Event::Vmxon(physical_address));

        if self.vmx_operation || self.cr4 & CR4_VMXE == 0 || physical_address & 0xFFF != 0 {
            return Err(VmFail::VmFailInvalid);
        }
        self.vmx_operation = true;

        Ok(())
    }

    fn vmxoff(&mut self) -> Result<()> {
        self.events.push(Event::Vmxoff);
        self.require_vmx_operation()?;

        self.vmx_operation = false;
        self.current_vmcs = None;

        Ok(())
    }

    fn vmclear(&mut self, physical_address: u64) -> Result<()> {
        self.events.push(Event::Vmclear(physical_address));
        self.require_vmx_operation()?;

        if self.current_vmcs == Some(physical_address) {
            self.current_vmcs = None;
        }

        Ok(())
    }

    fn vmptrld(&mut self, physical_address: u64) -> Result<()> {
        self.events.push(Event::Vmptrld(physical_address));
        self.require_vmx_operation()?;

        self.current_vmcs = Some(physical_address);

        Ok(())
    }

    fn invept_all_contexts(&mut self) -> Result<()> {
        self.events.push(Event::InveptAllContexts);
        self.require_vmx_operation()
    }

    fn vmlaunch(&mut self) -> Result<()> {
        self.events.push(Event::Vmlaunch);
        self.require_current_vmcs()?;

        if let Some(code) = self.launch_error {
            self.vmcs_fields.insert(ro::VM_INSTRUCTION_ERROR, code as u64);
            return Err(VmFail::VmFailValid);
        }
        self.launched = true;

        Ok(())
    }

    fn exit_entry_point(&self) -> u64 {
        EXIT_ENTRY_POINT
    }

    fn interrupt_entry_point(&self, vector: u8) -> u64 {
        INTERRUPT_ENTRY_POINTS + vector as u64 * 16
    }
}

/// Runs closures on a fixed set of simulated processors.
pub struct SimulatedExecutor {
    pub processors: Vec<SimulatedProcessor>,
}

impl SimulatedExecutor {
    pub fn new(count: usize) -> Self {
        Self {
            processors: (0..count).map(|_| SimulatedProcessor::new()).collect(),
        }
    }
}

impl ProcessorExecutor for SimulatedExecutor {
    type Processor = SimulatedProcessor;

    fn processor_count(&self) -> u32 {
        self.processors.len() as u32
    }

    fn run_on<R>(&mut self, index: u32, f: impl FnOnce(&mut Self::Processor) -> R) -> Option<R> {
        self.processors.get_mut(index as usize).map(f)
    }
}
