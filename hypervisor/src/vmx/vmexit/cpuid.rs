use crate::{
    error::Result,
    vmx::{cpu::Processor, data::guest::GuestRegisters, vmexit::ExitType},
};

/// Executes `cpuid` on behalf of the guest.
pub fn handle_default(cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters) -> Result<ExitType> {
    let leaf = guest_regs.rax as u32;
    let subleaf = guest_regs.rcx as u32;

    let cpuid = cpu.cpuid(leaf, subleaf);

    guest_regs.rax = cpuid.eax as u64;
    guest_regs.rbx = cpuid.ebx as u64;
    guest_regs.rcx = cpuid.ecx as u64;
    guest_regs.rdx = cpuid.edx as u64;

    Ok(ExitType::IncrementRip)
}
