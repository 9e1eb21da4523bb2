use crate::{
    error::Result,
    vmx::{
        controls::{read_control, write_control, PrimaryControls, VmxControl},
        cpu::Processor,
        data::guest::GuestRegisters,
        events::EventInjection,
        vmexit::ExitType,
    },
};

fn update_nmi_window<P: Processor + ?Sized>(cpu: &mut P, enabled: bool) -> Result<()> {
    let mut primary = read_control(cpu, VmxControl::ProcessorBased)?;
    if enabled {
        primary |= PrimaryControls::NMI_WINDOW_EXITING.bits();
    } else {
        primary &= !PrimaryControls::NMI_WINDOW_EXITING.bits();
    }

    write_control(cpu, VmxControl::ProcessorBased, primary)
}

/// Requests an NMI-window exit, which happens as soon as the guest is able to
/// receive an NMI.
pub fn queue_nmi<P: Processor + ?Sized>(cpu: &mut P) -> Result<()> {
    update_nmi_window(cpu, true)
}

/// Delivers the NMI queued by [`queue_nmi`].
pub fn handle_nmi_window(cpu: &mut dyn Processor, _guest_regs: &mut GuestRegisters) -> Result<ExitType> {
    EventInjection::nmi().inject(cpu, 0)?;
    update_nmi_window(cpu, false)?;

    Ok(ExitType::Continue)
}
