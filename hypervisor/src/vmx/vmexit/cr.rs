use crate::{
    error::Result,
    vmx::{
        cpu::Processor,
        data::guest::GuestRegisters,
        vmcs::{vmread, vmwrite},
        vmexit::ExitType,
    },
};
use bitfield::bitfield;
use x86::vmx::vmcs::{control, guest, ro};

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// See `Table 28-3. Exit Qualification for Control-Register Accesses` in
    /// the Intel SDM.
    #[derive(Clone, Copy)]
    pub struct MovCrQualification(u64);
    impl Debug;
    pub cr_number, _: 3, 0;
    pub access_type, _: 5, 4;
    pub lmsw_memory_operand, _: 6;
    pub gpr, _: 11, 8;
    pub lmsw_source_data, _: 31, 16;
}

const ACCESS_MOV_TO_CR: u64 = 0;
const ACCESS_MOV_FROM_CR: u64 = 1;
const ACCESS_CLTS: u64 = 2;
const ACCESS_LMSW: u64 = 3;

const CR0_TS: u64 = 1 << 3;
const CR0_PE: u64 = 1 << 0;
const CR3_PCID_NOFLUSH: u64 = 1 << 63;

fn read_gpr(cpu: &dyn Processor, guest_regs: &GuestRegisters, gpr: u8) -> Result<u64> {
    if gpr == GuestRegisters::RSP {
        vmread(cpu, guest::RSP)
    } else {
        Ok(guest_regs.get(gpr))
    }
}

fn write_gpr(cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters, gpr: u8, value: u64) -> Result<()> {
    if gpr == GuestRegisters::RSP {
        vmwrite(cpu, guest::RSP, value)
    } else {
        guest_regs.set(gpr, value);
        Ok(())
    }
}

/// The guest and read-shadow fields of a control register, if the register
/// can be accessed with `mov`.
fn cr_fields(cr: u64) -> Option<(u32, Option<u32>)> {
    match cr {
        0 => Some((guest::CR0, Some(control::CR0_READ_SHADOW))),
        3 => Some((guest::CR3, None)),
        4 => Some((guest::CR4, Some(control::CR4_READ_SHADOW))),
        _ => None,
    }
}

/// Emulates `mov` to and from CR0, CR3 and CR4 as well as `clts` and `lmsw`.
///
/// Only CR3 accesses exit unless guest/host masks are set, and those only in
/// debug builds.
pub fn handle_mov_cr(cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters) -> Result<ExitType> {
    let qualification = MovCrQualification(vmread(cpu, ro::EXIT_QUALIFICATION)?);
    let gpr = qualification.gpr() as u8;

    match qualification.access_type() {
        ACCESS_MOV_TO_CR => {
            let Some((field, shadow)) = cr_fields(qualification.cr_number()) else {
                log::warn!("Unsupported mov to cr: {:?}", qualification);
                return Ok(ExitType::IncrementRip);
            };

            let mut value = read_gpr(cpu, guest_regs, gpr)?;
            if field == guest::CR3 {
                // Bit 63 only requests not to flush the TLB, it is not part of
                // the register.
                //
                value &= !CR3_PCID_NOFLUSH;
            }

            vmwrite(cpu, field, value)?;
            if let Some(shadow) = shadow {
                vmwrite(cpu, shadow, value)?;
            }
        }
        ACCESS_MOV_FROM_CR => {
            let Some((field, _)) = cr_fields(qualification.cr_number()) else {
                log::warn!("Unsupported mov from cr: {:?}", qualification);
                return Ok(ExitType::IncrementRip);
            };

            let value = vmread(cpu, field)?;
            write_gpr(cpu, guest_regs, gpr, value)?;
        }
        ACCESS_CLTS => {
            let cr0 = vmread(cpu, guest::CR0)? & !CR0_TS;
            vmwrite(cpu, guest::CR0, cr0)?;
            vmwrite(cpu, control::CR0_READ_SHADOW, cr0)?;
        }
        ACCESS_LMSW => {
            // LMSW loads CR0[3:0] but can not clear PE.
            //
            let cr0 = vmread(cpu, guest::CR0)?;
            let source = qualification.lmsw_source_data() & 0xF;
            let cr0 = (cr0 & !0xF) | source | (cr0 & CR0_PE);

            vmwrite(cpu, guest::CR0, cr0)?;
            vmwrite(cpu, control::CR0_READ_SHADOW, cr0)?;
        }
        _ => unreachable!(),
    }

    Ok(ExitType::IncrementRip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::sim::SimulatedProcessor;

    fn processor(qualification: u64) -> SimulatedProcessor {
        let mut cpu = SimulatedProcessor::new();
        cpu.enter_vmx_with_current_vmcs();
        cpu.simulate_exit(28, 0x2000, 3);
        cpu.set_field(ro::EXIT_QUALIFICATION, qualification);
        cpu
    }

    #[test]
    fn mov_to_cr3_strips_the_noflush_bit() {
        // mov cr3, rbx
        let mut cpu = processor(3 | 3 << 8);
        let mut regs = GuestRegisters {
            rbx: (1 << 63) | 0x1AB000,
            ..Default::default()
        };

        assert_eq!(handle_mov_cr(&mut cpu, &mut regs).unwrap(), ExitType::IncrementRip);
        assert_eq!(cpu.field(guest::CR3), Some(0x1AB000));
    }

    #[test]
    fn mov_from_cr3_into_rsp() {
        // mov rsp, cr3
        let mut cpu = processor(3 | 1 << 4 | 4 << 8);
        cpu.set_field(guest::CR3, 0x5000);

        let mut regs = GuestRegisters::default();
        handle_mov_cr(&mut cpu, &mut regs).unwrap();

        assert_eq!(cpu.field(guest::RSP), Some(0x5000));
        assert_eq!(regs.rsp, 0);
    }

    #[test]
    fn lmsw_can_not_clear_protection_enable() {
        let mut cpu = processor(3 << 4 | 0x8 << 16);
        cpu.set_field(guest::CR0, 0x8000_0031);

        handle_mov_cr(&mut cpu, &mut GuestRegisters::default()).unwrap();

        assert_eq!(cpu.field(guest::CR0), Some(0x8000_0039));
    }
}
