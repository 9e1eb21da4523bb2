use crate::{
    error::Result,
    vmx::{
        cpu::Processor,
        data::guest::GuestRegisters,
        events::{EventInjection, ExitInterruptionInfo},
        vmcs::{vmread, vmwrite},
        vmexit::{nmi::queue_nmi, ExitType},
    },
};
use x86::vmx::vmcs::{control, ro};

/// Handles exceptions and NMIs that happened in the guest.
///
/// NMIs belong to the guest, so they are queued and delivered as soon as the
/// guest can take them. Exceptions are reflected back unchanged.
pub fn handle_exception_or_nmi(
    cpu: &mut dyn Processor, _guest_regs: &mut GuestRegisters,
) -> Result<ExitType> {
    let info = ExitInterruptionInfo::read(cpu)?;

    if info.is_nmi() {
        log::trace!("Queueing guest NMI");
        queue_nmi(cpu)?;
    } else {
        let error_code = if info.error_code_valid() {
            vmread(cpu, ro::VMEXIT_INTERRUPTION_ERR_CODE)? as u32
        } else {
            0
        };

        let event = EventInjection::reflect(&info);
        if event.needs_instruction_length() {
            let len = vmread(cpu, ro::VMEXIT_INSTRUCTION_LEN)?;
            vmwrite(cpu, control::VMENTRY_INSTRUCTION_LEN, len)?;
        }

        log::trace!("Reinjecting exception {} ({:#x})", info.vector(), error_code);
        event.inject(cpu, error_code)?;
    }

    Ok(ExitType::Continue)
}
