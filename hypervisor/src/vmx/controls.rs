//! VMX execution controls and the writers that keep them within what the
//! processor supports.
//!
//! See `A.3 VM-EXECUTION CONTROLS` in the Intel SDM.

use crate::{
    error::{InvalidControlValueSnafu, Result},
    vmx::{
        cpu::Processor,
        support::VmxBasic,
        vmcs::{vmread, vmwrite},
    },
};
use bitflags::bitflags;
use x86::{msr, vmx::vmcs};

bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinbasedControls: u32 {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMIS = 1 << 5;
        const VMX_PREEMPTION_TIMER = 1 << 6;
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct PrimaryControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPG_EXITING = 1 << 9;
        const MWAIT_EXITING = 1 << 10;
        const RDPMC_EXITING = 1 << 11;
        const RDTSC_EXITING = 1 << 12;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const USE_TPR_SHADOW = 1 << 21;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCOND_IO_EXITING = 1 << 24;
        const USE_IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const USE_MSR_BITMAPS = 1 << 28;
        const MONITOR_EXITING = 1 << 29;
        const PAUSE_EXITING = 1 << 30;
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct SecondaryControls: u32 {
        const VIRTUALIZE_APIC = 1 << 0;
        const ENABLE_EPT = 1 << 1;
        const DTABLE_EXITING = 1 << 2;
        const ENABLE_RDTSCP = 1 << 3;
        const VIRTUALIZE_X2APIC = 1 << 4;
        const ENABLE_VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const ENABLE_INVPCID = 1 << 12;
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        const CONCEAL_VMX_FROM_PT = 1 << 19;
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        const ENABLE_USER_WAIT_PAUSE = 1 << 26;
    }
}

bitflags! {
    /// Primary VM-exit controls.
    pub struct ExitControls: u32 {
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        const SAVE_IA32_PAT = 1 << 18;
        const LOAD_IA32_PAT = 1 << 19;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
        const CONCEAL_VMX_FROM_PT = 1 << 24;
    }
}

bitflags! {
    /// VM-entry controls.
    pub struct EntryControls: u32 {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const LOAD_IA32_PAT = 1 << 14;
        const LOAD_IA32_EFER = 1 << 15;
        const CONCEAL_VMX_FROM_PT = 1 << 17;
    }
}

/// The control words whose valid settings are reported by capability MSRs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

impl VmxControl {
    pub const fn field(self) -> u32 {
        match self {
            VmxControl::PinBased => vmcs::control::PINBASED_EXEC_CONTROLS,
            VmxControl::ProcessorBased => vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            VmxControl::ProcessorBased2 => vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            VmxControl::VmExit => vmcs::control::VMEXIT_CONTROLS,
            VmxControl::VmEntry => vmcs::control::VMENTRY_CONTROLS,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            VmxControl::PinBased => "Pin-based controls",
            VmxControl::ProcessorBased => "Primary processor-based controls",
            VmxControl::ProcessorBased2 => "Secondary processor-based controls",
            VmxControl::VmExit => "VM-exit controls",
            VmxControl::VmEntry => "VM-entry controls",
        }
    }

    /// The capability MSR describing this control. The secondary controls
    /// have no `TRUE_` variant.
    pub const fn capability_msr(self, true_controls: bool) -> u32 {
        match (self, true_controls) {
            (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
            (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
            (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
            (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
            (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
            (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
            (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
            (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        }
    }
}

/// The bits that must be 1 (`allowed0`) and the bits that may be 1
/// (`allowed1`) for a control word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllowedSettings {
    pub allowed0: u32,
    pub allowed1: u32,
}

impl AllowedSettings {
    pub fn read<P: Processor + ?Sized>(cpu: &P, control: VmxControl) -> Self {
        let basic = VmxBasic(cpu.read_msr(msr::IA32_VMX_BASIC));
        let capabilities = cpu.read_msr(control.capability_msr(basic.true_controls()));

        Self {
            allowed0: capabilities as u32,
            allowed1: (capabilities >> 32) as u32,
        }
    }

    pub fn adjust(&self, requested: u32) -> u32 {
        (requested | self.allowed0) & self.allowed1
    }

    pub fn permits(&self, value: u32) -> bool {
        value & self.allowed0 == self.allowed0 && value & !self.allowed1 == 0
    }
}

/// Returns `requested` with every mandatory bit set and every unsupported bit
/// cleared.
pub fn adjust_vmx_control<P: Processor + ?Sized>(cpu: &P, control: VmxControl, requested: u32) -> u32 {
    AllowedSettings::read(cpu, control).adjust(requested)
}

/// Adjusts `requested` to the processor's capabilities and writes it. Returns
/// the value that was written.
pub fn write_control_safe<P: Processor + ?Sized>(
    cpu: &mut P, control: VmxControl, requested: u32,
) -> Result<u32> {
    let value = adjust_vmx_control(cpu, control, requested);

    if value & requested != requested {
        log::warn!(
            "{}: requested bits {:#x} are not supported",
            control.name(),
            requested & !value
        );
    }
    log::trace!("{}: {:#x} (requested {:#x})", control.name(), value, requested);

    vmwrite(cpu, control.field(), value)?;

    Ok(value)
}

/// Writes `value` as is. Fails if it violates the processor's capabilities
/// instead of letting the next VM-entry fail.
pub fn write_control<P: Processor + ?Sized>(cpu: &mut P, control: VmxControl, value: u32) -> Result<()> {
    let settings = AllowedSettings::read(cpu, control);
    if !settings.permits(value) {
        log::error!(
            "{}: {:#x} violates allowed0 {:#x} / allowed1 {:#x}",
            control.name(),
            value,
            settings.allowed0,
            settings.allowed1
        );

        return InvalidControlValueSnafu {
            control: control.name(),
            value: value as u64,
            allowed: settings.allowed1 as u64,
        }
        .fail();
    }

    vmwrite(cpu, control.field(), value)
}

pub fn read_control<P: Processor + ?Sized>(cpu: &P, control: VmxControl) -> Result<u32> {
    Ok(vmread(cpu, control.field())? as u32)
}
