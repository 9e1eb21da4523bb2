//! Population of the VMCS: control, host-state and guest-state areas.
//!
//! Everything here operates on the *current* VMCS of the processor.

use crate::{
    error::{Result, VmcsAccessSnafu},
    vmx::{
        controls::{
            write_control_safe, EntryControls, ExitControls, PinbasedControls, PrimaryControls,
            SecondaryControls, VmxControl,
        },
        cpu::{physical_address, ControlRegister, Processor, VmcsAccess},
        data::vcpu_data::VcpuData,
        host::{HOST_CS_SELECTOR, HOST_TR_SELECTOR},
        segmentation::Segment,
    },
};
use x86::{
    msr,
    vmx::vmcs::{control, guest, host},
};

/// Guest activity state "active".
pub const ACTIVITY_STATE_ACTIVE: u64 = 0;

/// A VMCS link pointer of all ones means "no shadow VMCS".
pub const VMCS_LINK_POINTER_NONE: u64 = u64::MAX;

pub fn vmread<C: VmcsAccess + ?Sized>(cpu: &C, field: u32) -> Result<u64> {
    cpu.vmread(field)
        .map_err(|fail| VmcsAccessSnafu { field, fail }.build())
}

pub fn vmwrite<C: VmcsAccess + ?Sized, T: Into<u64>>(cpu: &mut C, field: u32, value: T) -> Result<()> {
    cpu.vmwrite(field, value.into())
        .map_err(|fail| VmcsAccessSnafu { field, fail }.build())
}

/// Writes the VM-execution, VM-exit and VM-entry control fields.
///
/// See `25.6 VM-EXECUTION CONTROL FIELDS`, `25.7 VM-EXIT CONTROL FIELDS` and
/// `25.8 VM-ENTRY CONTROL FIELDS` in the Intel SDM.
pub fn write_control_fields<P: Processor + ?Sized>(cpu: &mut P, data: &VcpuData) -> Result<()> {
    // NMIs are routed to the hypervisor and reinjected through the NMI window.
    //
    let pin_based = PinbasedControls::NMI_EXITING | PinbasedControls::VIRTUAL_NMIS;
    write_control_safe(cpu, VmxControl::PinBased, pin_based.bits())?;

    #[allow(unused_mut)]
    let mut primary = PrimaryControls::USE_MSR_BITMAPS | PrimaryControls::SECONDARY_CONTROLS;
    cfg_if::cfg_if! {
        if #[cfg(debug_assertions)] {
            primary |= PrimaryControls::CR3_LOAD_EXITING | PrimaryControls::CR3_STORE_EXITING;
        }
    }
    write_control_safe(cpu, VmxControl::ProcessorBased, primary.bits())?;

    // Instructions that raise #UD in the guest unless enabled here.
    //
    let secondary = SecondaryControls::ENABLE_RDTSCP
        | SecondaryControls::ENABLE_INVPCID
        | SecondaryControls::ENABLE_XSAVES_XRSTORS
        | SecondaryControls::ENABLE_USER_WAIT_PAUSE
        | SecondaryControls::CONCEAL_VMX_FROM_PT;
    write_control_safe(cpu, VmxControl::ProcessorBased2, secondary.bits())?;

    let exit = ExitControls::SAVE_DEBUG_CONTROLS
        | ExitControls::HOST_ADDRESS_SPACE_SIZE
        | ExitControls::CONCEAL_VMX_FROM_PT;
    write_control_safe(cpu, VmxControl::VmExit, exit.bits())?;

    let entry = EntryControls::LOAD_DEBUG_CONTROLS
        | EntryControls::IA32E_MODE_GUEST
        | EntryControls::CONCEAL_VMX_FROM_PT;
    write_control_safe(cpu, VmxControl::VmEntry, entry.bits())?;

    // No exception exits, #PF included.
    //
    vmwrite(cpu, control::EXCEPTION_BITMAP, 0u32)?;
    vmwrite(cpu, control::PAGE_FAULT_ERR_CODE_MASK, 0u32)?;
    vmwrite(cpu, control::PAGE_FAULT_ERR_CODE_MATCH, 0u32)?;

    // The guest owns every bit of CR0 and CR4.
    //
    vmwrite(cpu, control::CR0_GUEST_HOST_MASK, 0u64)?;
    vmwrite(cpu, control::CR4_GUEST_HOST_MASK, 0u64)?;
    vmwrite(cpu, control::CR0_READ_SHADOW, 0u64)?;
    vmwrite(cpu, control::CR4_READ_SHADOW, 0u64)?;

    vmwrite(cpu, control::CR3_TARGET_COUNT, 0u32)?;
    for field in [
        control::CR3_TARGET_VALUE0,
        control::CR3_TARGET_VALUE1,
        control::CR3_TARGET_VALUE2,
        control::CR3_TARGET_VALUE3,
    ] {
        vmwrite(cpu, field, 0u64)?;
    }

    let msr_bitmap_pa = physical_address(cpu, &data.msr_bitmap as *const _ as u64)?;
    vmwrite(cpu, control::MSR_BITMAPS_ADDR_FULL, msr_bitmap_pa)?;

    // No MSRs are saved or loaded on exit or entry.
    //
    vmwrite(cpu, control::VMEXIT_MSR_STORE_COUNT, 0u32)?;
    vmwrite(cpu, control::VMEXIT_MSR_STORE_ADDR_FULL, 0u64)?;
    vmwrite(cpu, control::VMEXIT_MSR_LOAD_COUNT, 0u32)?;
    vmwrite(cpu, control::VMEXIT_MSR_LOAD_ADDR_FULL, 0u64)?;
    vmwrite(cpu, control::VMENTRY_MSR_LOAD_COUNT, 0u32)?;
    vmwrite(cpu, control::VMENTRY_MSR_LOAD_ADDR_FULL, 0u64)?;

    // Nothing is injected on the first entry.
    //
    vmwrite(cpu, control::VMENTRY_INTERRUPTION_INFO_FIELD, 0u32)?;
    vmwrite(cpu, control::VMENTRY_EXCEPTION_ERR_CODE, 0u32)?;
    vmwrite(cpu, control::VMENTRY_INSTRUCTION_LEN, 0u32)?;

    Ok(())
}

/// Writes the host-state area. After a VM-exit the processor runs on the
/// vcpu's private stack, GDT, IDT and TSS.
///
/// See `25.5 HOST-STATE AREA` in the Intel SDM.
pub fn write_host_fields<P: Processor + ?Sized>(cpu: &mut P, data: &VcpuData) -> Result<()> {
    let cr0 = cpu.read_cr(ControlRegister::Cr0);
    let cr3 = cpu.read_cr(ControlRegister::Cr3);
    let cr4 = cpu.read_cr(ControlRegister::Cr4);
    vmwrite(cpu, host::CR0, cr0)?;
    vmwrite(cpu, host::CR3, cr3)?;
    vmwrite(cpu, host::CR4, cr4)?;

    let rsp = data.host_stack_layout.host_rsp();
    let rip = cpu.exit_entry_point();
    log::trace!("Host rsp: {:#x}, rip: {:#x}", rsp, rip);
    vmwrite(cpu, host::RSP, rsp)?;
    vmwrite(cpu, host::RIP, rip)?;

    vmwrite(cpu, host::CS_SELECTOR, HOST_CS_SELECTOR)?;
    vmwrite(cpu, host::TR_SELECTOR, HOST_TR_SELECTOR)?;
    for field in [
        host::SS_SELECTOR,
        host::DS_SELECTOR,
        host::ES_SELECTOR,
        host::FS_SELECTOR,
        host::GS_SELECTOR,
    ] {
        vmwrite(cpu, field, 0u16)?;
    }

    vmwrite(cpu, host::FS_BASE, 0u64)?;
    vmwrite(cpu, host::GS_BASE, 0u64)?;
    vmwrite(cpu, host::TR_BASE, &data.host_tss as *const _ as u64)?;
    vmwrite(cpu, host::GDTR_BASE, data.host_gdt.as_ptr() as u64)?;
    vmwrite(cpu, host::IDTR_BASE, data.host_idt.as_ptr() as u64)?;

    vmwrite(cpu, host::IA32_SYSENTER_CS, 0u64)?;
    vmwrite(cpu, host::IA32_SYSENTER_ESP, 0u64)?;
    vmwrite(cpu, host::IA32_SYSENTER_EIP, 0u64)?;

    Ok(())
}

/// The four guest-state fields describing one segment register.
struct SegmentFields {
    selector: u32,
    base: u32,
    limit: u32,
    access_rights: u32,
}

impl SegmentFields {
    const ES: Self = Self {
        selector: guest::ES_SELECTOR,
        base: guest::ES_BASE,
        limit: guest::ES_LIMIT,
        access_rights: guest::ES_ACCESS_RIGHTS,
    };
    const CS: Self = Self {
        selector: guest::CS_SELECTOR,
        base: guest::CS_BASE,
        limit: guest::CS_LIMIT,
        access_rights: guest::CS_ACCESS_RIGHTS,
    };
    const SS: Self = Self {
        selector: guest::SS_SELECTOR,
        base: guest::SS_BASE,
        limit: guest::SS_LIMIT,
        access_rights: guest::SS_ACCESS_RIGHTS,
    };
    const DS: Self = Self {
        selector: guest::DS_SELECTOR,
        base: guest::DS_BASE,
        limit: guest::DS_LIMIT,
        access_rights: guest::DS_ACCESS_RIGHTS,
    };
    const FS: Self = Self {
        selector: guest::FS_SELECTOR,
        base: guest::FS_BASE,
        limit: guest::FS_LIMIT,
        access_rights: guest::FS_ACCESS_RIGHTS,
    };
    const GS: Self = Self {
        selector: guest::GS_SELECTOR,
        base: guest::GS_BASE,
        limit: guest::GS_LIMIT,
        access_rights: guest::GS_ACCESS_RIGHTS,
    };
    const LDTR: Self = Self {
        selector: guest::LDTR_SELECTOR,
        base: guest::LDTR_BASE,
        limit: guest::LDTR_LIMIT,
        access_rights: guest::LDTR_ACCESS_RIGHTS,
    };
    const TR: Self = Self {
        selector: guest::TR_SELECTOR,
        base: guest::TR_BASE,
        limit: guest::TR_LIMIT,
        access_rights: guest::TR_ACCESS_RIGHTS,
    };
}

fn write_guest_segment<P: Processor + ?Sized>(
    cpu: &mut P, fields: SegmentFields, segment: &Segment,
) -> Result<()> {
    log::trace!("Guest segment: {:x?}", segment);

    vmwrite(cpu, fields.selector, segment.selector)?;
    vmwrite(cpu, fields.base, segment.base)?;
    vmwrite(cpu, fields.limit, segment.limit)?;
    vmwrite(cpu, fields.access_rights, segment.access_rights.0)?;

    Ok(())
}

/// Writes the guest-state area as a copy of the processor's current state, so
/// that the guest continues where the launch left off.
///
/// See `25.4 GUEST-STATE AREA` in the Intel SDM.
pub fn write_guest_fields<P: Processor + ?Sized>(cpu: &mut P) -> Result<()> {
    let cr0 = cpu.read_cr(ControlRegister::Cr0);
    let cr3 = cpu.read_cr(ControlRegister::Cr3);
    let cr4 = cpu.read_cr(ControlRegister::Cr4);
    vmwrite(cpu, guest::CR0, cr0)?;
    vmwrite(cpu, guest::CR3, cr3)?;
    vmwrite(cpu, guest::CR4, cr4)?;

    let dr7 = cpu.read_dr7();
    vmwrite(cpu, guest::DR7, dr7)?;

    // Both are filled in by the launch trampoline right before VMLAUNCH.
    //
    vmwrite(cpu, guest::RSP, 0u64)?;
    vmwrite(cpu, guest::RIP, 0u64)?;

    let rflags = cpu.read_rflags();
    vmwrite(cpu, guest::RFLAGS, rflags)?;

    let gdtr = cpu.gdtr();
    let idtr = cpu.idtr();
    let selectors = cpu.segment_selectors();

    for (fields, selector) in [
        (SegmentFields::CS, selectors.cs),
        (SegmentFields::SS, selectors.ss),
        (SegmentFields::DS, selectors.ds),
        (SegmentFields::ES, selectors.es),
        (SegmentFields::FS, selectors.fs),
        (SegmentFields::GS, selectors.gs),
        (SegmentFields::TR, selectors.tr),
        (SegmentFields::LDTR, selectors.ldtr),
    ] {
        let segment = Segment::from_gdt(cpu, &gdtr, selector);
        write_guest_segment(cpu, fields, &segment)?;
    }

    // The descriptor only holds the lower 32 bits of the FS and GS bases.
    //
    let fs_base = cpu.read_msr(msr::IA32_FS_BASE);
    let gs_base = cpu.read_msr(msr::IA32_GS_BASE);
    vmwrite(cpu, guest::FS_BASE, fs_base)?;
    vmwrite(cpu, guest::GS_BASE, gs_base)?;

    vmwrite(cpu, guest::GDTR_BASE, gdtr.base)?;
    vmwrite(cpu, guest::GDTR_LIMIT, gdtr.limit)?;
    vmwrite(cpu, guest::IDTR_BASE, idtr.base)?;
    vmwrite(cpu, guest::IDTR_LIMIT, idtr.limit)?;

    let debugctl = cpu.read_msr(msr::IA32_DEBUGCTL);
    let sysenter_cs = cpu.read_msr(msr::IA32_SYSENTER_CS);
    let sysenter_esp = cpu.read_msr(msr::IA32_SYSENTER_ESP);
    let sysenter_eip = cpu.read_msr(msr::IA32_SYSENTER_EIP);
    vmwrite(cpu, guest::IA32_DEBUGCTL_FULL, debugctl)?;
    vmwrite(cpu, guest::IA32_SYSENTER_CS, sysenter_cs)?;
    vmwrite(cpu, guest::IA32_SYSENTER_ESP, sysenter_esp)?;
    vmwrite(cpu, guest::IA32_SYSENTER_EIP, sysenter_eip)?;

    vmwrite(cpu, guest::ACTIVITY_STATE, ACTIVITY_STATE_ACTIVE)?;
    vmwrite(cpu, guest::INTERRUPTIBILITY_STATE, 0u32)?;
    vmwrite(cpu, guest::PENDING_DBG_EXCEPTIONS, 0u64)?;
    vmwrite(cpu, guest::LINK_PTR_FULL, VMCS_LINK_POINTER_NONE)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::{controls::AllowedSettings, sim::SimulatedProcessor};

    fn loaded_processor() -> (SimulatedProcessor, alloc::boxed::Box<VcpuData>) {
        let mut cpu = SimulatedProcessor::new();
        cpu.enter_vmx_with_current_vmcs();

        (cpu, VcpuData::new())
    }

    #[test]
    fn control_fields_stay_within_capabilities() {
        let (mut cpu, data) = loaded_processor();
        write_control_fields(&mut cpu, &data).unwrap();

        for control in [
            VmxControl::PinBased,
            VmxControl::ProcessorBased,
            VmxControl::ProcessorBased2,
            VmxControl::VmExit,
            VmxControl::VmEntry,
        ] {
            let value = cpu.field(control.field()).unwrap() as u32;
            assert!(AllowedSettings::read(&cpu, control).permits(value));
        }

        let primary = PrimaryControls::from_bits_truncate(
            cpu.field(control::PRIMARY_PROCBASED_EXEC_CONTROLS).unwrap() as u32,
        );
        assert!(primary.contains(PrimaryControls::USE_MSR_BITMAPS));
        assert_eq!(
            primary.contains(PrimaryControls::CR3_LOAD_EXITING),
            cfg!(debug_assertions)
        );

        let entry = EntryControls::from_bits_truncate(
            cpu.field(control::VMENTRY_CONTROLS).unwrap() as u32,
        );
        assert!(entry.contains(EntryControls::IA32E_MODE_GUEST));
    }

    #[test]
    fn control_fields_point_at_the_msr_bitmap() {
        let (mut cpu, data) = loaded_processor();
        write_control_fields(&mut cpu, &data).unwrap();

        assert_eq!(
            cpu.field(control::MSR_BITMAPS_ADDR_FULL),
            cpu.physical_address(&data.msr_bitmap as *const _ as u64)
        );
        assert_eq!(cpu.field(control::EXCEPTION_BITMAP), Some(0));
        assert_eq!(cpu.field(control::VMENTRY_INTERRUPTION_INFO_FIELD), Some(0));
        assert_eq!(cpu.field(control::CR3_TARGET_VALUE3), Some(0));
    }

    #[test]
    fn host_fields_use_private_structures() {
        let (mut cpu, data) = loaded_processor();
        write_host_fields(&mut cpu, &data).unwrap();

        assert_eq!(cpu.field(host::CS_SELECTOR), Some(0x08));
        assert_eq!(cpu.field(host::TR_SELECTOR), Some(0x10));
        assert_eq!(cpu.field(host::SS_SELECTOR), Some(0));
        assert_eq!(cpu.field(host::RSP).unwrap() % 16, 8);
        assert_eq!(cpu.field(host::RIP), Some(cpu.exit_entry_point()));
        assert_eq!(
            cpu.field(host::GDTR_BASE),
            Some(data.host_gdt.as_ptr() as u64)
        );
        assert_ne!(cpu.field(host::GDTR_BASE), Some(cpu.gdtr().base));
    }

    #[test]
    fn guest_fields_snapshot_the_processor() {
        let (mut cpu, _data) = loaded_processor();
        write_guest_fields(&mut cpu).unwrap();

        assert_eq!(cpu.field(guest::ACTIVITY_STATE), Some(0));
        assert_eq!(cpu.field(guest::INTERRUPTIBILITY_STATE), Some(0));
        assert_eq!(cpu.field(guest::LINK_PTR_FULL), Some(u64::MAX));
        assert_eq!(cpu.field(guest::RIP), Some(0));
        assert_eq!(cpu.field(guest::CR3), Some(cpu.read_cr(ControlRegister::Cr3)));
        assert_eq!(cpu.field(guest::FS_BASE), Some(cpu.read_msr(msr::IA32_FS_BASE)));
        assert_eq!(cpu.field(guest::GS_BASE), Some(cpu.read_msr(msr::IA32_GS_BASE)));
        assert_eq!(cpu.field(guest::CS_SELECTOR), Some(cpu.segment_selectors().cs as u64));
        assert_eq!(cpu.field(guest::CS_ACCESS_RIGHTS), Some(0xA09B));
        assert_eq!(cpu.field(guest::LDTR_ACCESS_RIGHTS), Some(1 << 16));
        assert_eq!(cpu.field(guest::GDTR_LIMIT), Some(cpu.gdtr().limit as u64));
    }
}
