use crate::{
    error::Result,
    vmx::{cpu::Processor, data::guest::GuestRegisters, vmexit::ExitType},
};

/// Executes `rdmsr` on behalf of the guest.
///
/// Only MSRs selected in the MSR bitmap (and those outside of its ranges)
/// exit, so this is hit rarely.
///
/// Important: Reading an MSR the processor does not implement raises #GP in
/// the host. Callers that intercept such MSRs must install their own handler.
pub fn handle_rdmsr(cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters) -> Result<ExitType> {
    let msr = guest_regs.rcx as u32;

    let value = cpu.read_msr(msr);
    log::trace!("rdmsr({:#x}) = {:#x}", msr, value);

    guest_regs.set_edx_eax(value);

    Ok(ExitType::IncrementRip)
}

/// Executes `wrmsr` on behalf of the guest.
pub fn handle_wrmsr(cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters) -> Result<ExitType> {
    let msr = guest_regs.rcx as u32;
    let value = guest_regs.edx_eax();

    log::trace!("wrmsr({:#x}, {:#x})", msr, value);
    cpu.write_msr(msr, value);

    Ok(ExitType::IncrementRip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::sim::SimulatedProcessor;
    use x86::msr::IA32_SYSENTER_ESP;

    #[test]
    fn rdmsr_splits_into_edx_eax() {
        let mut cpu = SimulatedProcessor::new();
        cpu.set_msr(IA32_SYSENTER_ESP, 0x1122_3344_5566_7788);

        let mut regs = GuestRegisters {
            rcx: IA32_SYSENTER_ESP as u64,
            rax: u64::MAX,
            ..Default::default()
        };
        handle_rdmsr(&mut cpu, &mut regs).unwrap();

        assert_eq!(regs.rax, 0x5566_7788);
        assert_eq!(regs.rdx, 0x1122_3344);
    }

    #[test]
    fn wrmsr_combines_edx_eax() {
        let mut cpu = SimulatedProcessor::new();

        let mut regs = GuestRegisters {
            rcx: IA32_SYSENTER_ESP as u64,
            rax: 0xAAAA_AAAA_5566_7788,
            rdx: 0x1122_3344,
            ..Default::default()
        };
        assert_eq!(handle_wrmsr(&mut cpu, &mut regs).unwrap(), ExitType::IncrementRip);

        assert_eq!(cpu.read_msr(IA32_SYSENTER_ESP), 0x1122_3344_5566_7788);
    }
}
