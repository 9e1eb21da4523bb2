use crate::vmx::instruction_error::InstructionError;
use snafu::prelude::*;
use x86::vmx::VmFail;

pub type Result<T> = core::result::Result<T, HypervisorError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HypervisorError {
    #[snafu(display("Processor does not support VMX"))]
    VmxNotSupported,

    #[snafu(display("VMX is disabled and locked in IA32_FEATURE_CONTROL"))]
    VmxLockedOff,

    #[snafu(display("Processor {} is already virtualized", index))]
    AlreadyVirtualized { index: u32 },

    #[snafu(display("Failed to translate {:#x} to a physical address", address))]
    AddressTranslation { address: u64 },

    #[snafu(display("{} region at {:#x} is not 4 KiB aligned", region, address))]
    MisalignedRegion { region: &'static str, address: u64 },

    #[snafu(display("{} failed: {:?}", instruction, fail))]
    VmxInstruction {
        instruction: &'static str,
        fail: VmFail,
    },

    #[snafu(display("Failed to read or write VMCS field {:#x}: {:?}", field, fail))]
    VmcsAccess { field: u32, fail: VmFail },

    #[snafu(display("{} value {:#x} violates the allowed bits {:#x}", control, value, allowed))]
    InvalidControlValue {
        control: &'static str,
        value: u64,
        allowed: u64,
    },

    #[snafu(display("VMLAUNCH failed: {}", error))]
    LaunchFailed { error: InstructionError },

    #[snafu(display("VM-entry failed with exit reason {:#x}", reason))]
    VmEntryFailure { reason: u32 },

    #[snafu(display("Unhandled VM-exit {:#x} at rip {:#x}", reason, rip))]
    UnhandledVmExit { reason: u16, rip: u64 },
}
