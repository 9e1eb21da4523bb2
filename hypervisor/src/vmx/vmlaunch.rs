use crate::{
    error::{LaunchFailedSnafu, Result},
    vmx::{cpu::Processor, instruction_error::InstructionError},
};
use x86::vmx::VmFail;

/// Executes VMLAUNCH through the launch trampoline.
///
/// On hardware this only returns `Ok` once the processor runs as the guest,
/// right after the launch, with the host state captured in the VMCS. A failed
/// launch returns to the host with the decoded VM-instruction error.
pub fn launch<P: Processor + ?Sized>(cpu: &mut P) -> Result<()> {
    let Err(fail) = cpu.vmlaunch() else {
        return Ok(());
    };

    // Only a failure with a valid current VMCS records an error number.
    //
    let error = match fail {
        VmFail::VmFailValid => {
            InstructionError::read(cpu).unwrap_or(InstructionError::NotAvailable)
        }
        VmFail::VmFailInvalid => InstructionError::NotAvailable,
    };
    log::error!("VMLAUNCH failed ({:?}): {}", fail, error);

    LaunchFailedSnafu { error }.fail()
}
