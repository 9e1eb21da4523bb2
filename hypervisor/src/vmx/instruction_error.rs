//! Decoding of the VM-instruction error field.
//!
//! See `31.4 VM INSTRUCTION ERROR NUMBERS` in the Intel SDM.

use crate::{
    error::Result,
    vmx::{cpu::VmcsAccess, vmcs::vmread},
};
use core::fmt;
use x86::vmx::vmcs;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstructionError {
    NotAvailable,
    VmcallInVmxRoot,
    VmclearInvalidAddress,
    VmclearVmxonPointer,
    VmlaunchNonClearVmcs,
    VmresumeNonLaunchedVmcs,
    VmresumeAfterVmxoff,
    VmentryInvalidControlFields,
    VmentryInvalidHostState,
    VmptrldInvalidAddress,
    VmptrldVmxonPointer,
    VmptrldIncorrectRevision,
    UnsupportedVmcsComponent,
    VmwriteReadOnlyComponent,
    VmxonInVmxRoot,
    VmentryInvalidExecutiveVmcsPointer,
    VmentryNonLaunchedExecutiveVmcs,
    VmentryExecutiveVmcsPointerNotVmxon,
    VmcallNonClearVmcs,
    VmcallInvalidExitControls,
    VmcallIncorrectMsegRevision,
    VmxoffUnderDualMonitor,
    VmcallInvalidSmmMonitorFeatures,
    VmentryInvalidExecutionControls,
    VmentryEventsBlockedByMovSs,
    InvalidInveptInvvpidOperand,
    Unknown(u32),
}

impl From<u32> for InstructionError {
    fn from(value: u32) -> Self {
        use InstructionError::*;

        match value {
            0 => NotAvailable,
            1 => VmcallInVmxRoot,
            2 => VmclearInvalidAddress,
            3 => VmclearVmxonPointer,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            6 => VmresumeAfterVmxoff,
            7 => VmentryInvalidControlFields,
            8 => VmentryInvalidHostState,
            9 => VmptrldInvalidAddress,
            10 => VmptrldVmxonPointer,
            11 => VmptrldIncorrectRevision,
            12 => UnsupportedVmcsComponent,
            13 => VmwriteReadOnlyComponent,
            15 => VmxonInVmxRoot,
            16 => VmentryInvalidExecutiveVmcsPointer,
            17 => VmentryNonLaunchedExecutiveVmcs,
            18 => VmentryExecutiveVmcsPointerNotVmxon,
            19 => VmcallNonClearVmcs,
            20 => VmcallInvalidExitControls,
            22 => VmcallIncorrectMsegRevision,
            23 => VmxoffUnderDualMonitor,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => VmentryInvalidExecutionControls,
            26 => VmentryEventsBlockedByMovSs,
            28 => InvalidInveptInvvpidOperand,
            other => Unknown(other),
        }
    }
}

impl InstructionError {
    /// Reads the error of the last failed VMX instruction from the current
    /// VMCS.
    pub fn read<C: VmcsAccess + ?Sized>(cpu: &C) -> Result<Self> {
        Ok(Self::from(vmread(cpu, vmcs::ro::VM_INSTRUCTION_ERROR)? as u32))
    }

    pub fn code(&self) -> u32 {
        use InstructionError::*;

        match *self {
            NotAvailable => 0,
            VmcallInVmxRoot => 1,
            VmclearInvalidAddress => 2,
            VmclearVmxonPointer => 3,
            VmlaunchNonClearVmcs => 4,
            VmresumeNonLaunchedVmcs => 5,
            VmresumeAfterVmxoff => 6,
            VmentryInvalidControlFields => 7,
            VmentryInvalidHostState => 8,
            VmptrldInvalidAddress => 9,
            VmptrldVmxonPointer => 10,
            VmptrldIncorrectRevision => 11,
            UnsupportedVmcsComponent => 12,
            VmwriteReadOnlyComponent => 13,
            VmxonInVmxRoot => 15,
            VmentryInvalidExecutiveVmcsPointer => 16,
            VmentryNonLaunchedExecutiveVmcs => 17,
            VmentryExecutiveVmcsPointerNotVmxon => 18,
            VmcallNonClearVmcs => 19,
            VmcallInvalidExitControls => 20,
            VmcallIncorrectMsegRevision => 22,
            VmxoffUnderDualMonitor => 23,
            VmcallInvalidSmmMonitorFeatures => 24,
            VmentryInvalidExecutionControls => 25,
            VmentryEventsBlockedByMovSs => 26,
            InvalidInveptInvvpidOperand => 28,
            Unknown(code) => code,
        }
    }

    pub fn description(&self) -> &'static str {
        use InstructionError::*;

        match self {
            NotAvailable => "no error recorded",
            VmcallInVmxRoot => "VMCALL executed in VMX root operation",
            VmclearInvalidAddress => "VMCLEAR with invalid physical address",
            VmclearVmxonPointer => "VMCLEAR with VMXON pointer",
            VmlaunchNonClearVmcs => "VMLAUNCH with non-clear VMCS",
            VmresumeNonLaunchedVmcs => "VMRESUME with non-launched VMCS",
            VmresumeAfterVmxoff => "VMRESUME after VMXOFF",
            VmentryInvalidControlFields => "VM entry with invalid control field(s)",
            VmentryInvalidHostState => "VM entry with invalid host-state field(s)",
            VmptrldInvalidAddress => "VMPTRLD with invalid physical address",
            VmptrldVmxonPointer => "VMPTRLD with VMXON pointer",
            VmptrldIncorrectRevision => "VMPTRLD with incorrect VMCS revision identifier",
            UnsupportedVmcsComponent => "VMREAD/VMWRITE from/to unsupported VMCS component",
            VmwriteReadOnlyComponent => "VMWRITE to read-only VMCS component",
            VmxonInVmxRoot => "VMXON executed in VMX root operation",
            VmentryInvalidExecutiveVmcsPointer => "VM entry with invalid executive-VMCS pointer",
            VmentryNonLaunchedExecutiveVmcs => "VM entry with non-launched executive VMCS",
            VmentryExecutiveVmcsPointerNotVmxon => {
                "VM entry with executive-VMCS pointer not VMXON pointer"
            }
            VmcallNonClearVmcs => "VMCALL with non-clear VMCS",
            VmcallInvalidExitControls => "VMCALL with invalid VM-exit control fields",
            VmcallIncorrectMsegRevision => "VMCALL with incorrect MSEG revision identifier",
            VmxoffUnderDualMonitor => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            VmcallInvalidSmmMonitorFeatures => "VMCALL with invalid SMM-monitor features",
            VmentryInvalidExecutionControls => {
                "VM entry with invalid VM-execution control fields in executive VMCS"
            }
            VmentryEventsBlockedByMovSs => "VM entry with events blocked by MOV SS",
            InvalidInveptInvvpidOperand => "Invalid operand to INVEPT/INVVPID",
            Unknown(_) => "unknown error",
        }
    }
}

impl fmt::Display for InstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}
