//! The processor the code runs on.
//!
//! Also contains the assembly entry points: the launch trampoline, the VM-exit
//! entry point and the host interrupt entry points.

use crate::{
    dbg_break,
    vmx::{
        cpu::{ControlRegister, CpuidResult, Processor, SegmentSelectors, TableRegister, VmcsAccess},
        data::{guest::GuestRegisters, trap_frame::TrapFrame, vcpu_data::STACK_MARKER},
        interrupt,
        vcpu::Vcpu,
    },
};
use core::arch::{asm, global_asm};
use spin::Once;
use x86::{
    bits64::{rflags, vmx},
    controlregs,
    cpuid::cpuid,
    msr::{
        rdmsr, wrmsr, IA32_VMX_EPT_VPID_CAP, IA32_VMX_PROCBASED_CTLS, IA32_VMX_PROCBASED_CTLS2,
    },
    vmx::{vmcs::guest, Result, VmFail},
};
use x86_64::{
    instructions::{
        interrupts,
        segmentation::{Segment, CS, DS, ES, FS, GS, SS},
        tables::{sgdt, sidt},
    },
    registers::control::{Cr0, Cr4},
};

/// `INVEPT` type 2, all-context invalidation.
const INVEPT_ALL_CONTEXT: u64 = 2;

/// Distance between two host interrupt entry points.
const INTERRUPT_ENTRY_SIZE: u64 = 16;

/// XMM0-15 saved by the exit and interrupt stubs.
const XMM_SAVE_AREA_SIZE: usize = 16 * 16;

/// The XMM area plus the padding that realigns RSP below `GuestRegisters`.
const EXIT_XMM_FRAME_SIZE: usize = XMM_SAVE_AREA_SIZE + 8;

// HOST_RSP is 8 modulo 16, `movaps` and the call need RSP 16-byte aligned.
const_assert_eq!((core::mem::size_of::<GuestRegisters>() + EXIT_XMM_FRAME_SIZE) % 16, 8);

const LAUNCH_SUCCEEDED: u64 = 0;
const LAUNCH_FAILED_VALID: u64 = 1;

extern "C" {
    fn vmx_launch() -> u64;
    fn vmx_exit();
    fn vmx_interrupt_entries();
}

// Writes the guest RSP and RIP so that the guest continues right after the
// call, then launches. Returns 0 in the guest, or the VMfail kind on failure.
//
global_asm!(
    ".global vmx_launch",
    "vmx_launch:",
    "mov rcx, {guest_rsp}",
    "vmwrite rcx, rsp",
    "mov rcx, {guest_rip}",
    "lea rdx, [rip + 2f]",
    "vmwrite rcx, rdx",
    "vmlaunch",
    "jz 3f",
    "mov rax, 2",
    "ret",
    "3:",
    "mov rax, 1",
    "ret",
    "2:",
    "xor eax, eax",
    "ret",
    guest_rsp = const guest::RSP,
    guest_rip = const guest::RIP,
);

// HOST_RSP is 8 modulo 16 and the vcpu pointer sits right above it. Saves the
// general purpose registers in `GuestRegisters` order, the RSP slot is zero
// since the guest RSP lives in the VMCS. XMM0-15 go into an aligned area
// below them, since the handlers may use SSE.
//
global_asm!(
    ".global vmx_exit",
    "vmx_exit:",
    "sub rsp, 0x80",
    "mov [rsp + 0x00], rax",
    "mov [rsp + 0x08], rcx",
    "mov [rsp + 0x10], rdx",
    "mov [rsp + 0x18], rbx",
    "mov qword ptr [rsp + 0x20], 0",
    "mov [rsp + 0x28], rbp",
    "mov [rsp + 0x30], rsi",
    "mov [rsp + 0x38], rdi",
    "mov [rsp + 0x40], r8",
    "mov [rsp + 0x48], r9",
    "mov [rsp + 0x50], r10",
    "mov [rsp + 0x58], r11",
    "mov [rsp + 0x60], r12",
    "mov [rsp + 0x68], r13",
    "mov [rsp + 0x70], r14",
    "mov [rsp + 0x78], r15",
    "sub rsp, {xmm_frame}",
    "movaps [rsp + 0x0], xmm0",
    "movaps [rsp + 0x10], xmm1",
    "movaps [rsp + 0x20], xmm2",
    "movaps [rsp + 0x30], xmm3",
    "movaps [rsp + 0x40], xmm4",
    "movaps [rsp + 0x50], xmm5",
    "movaps [rsp + 0x60], xmm6",
    "movaps [rsp + 0x70], xmm7",
    "movaps [rsp + 0x80], xmm8",
    "movaps [rsp + 0x90], xmm9",
    "movaps [rsp + 0xa0], xmm10",
    "movaps [rsp + 0xb0], xmm11",
    "movaps [rsp + 0xc0], xmm12",
    "movaps [rsp + 0xd0], xmm13",
    "movaps [rsp + 0xe0], xmm14",
    "movaps [rsp + 0xf0], xmm15",
    "mov rdi, [rsp + {vcpu_offset}]",
    "lea rsi, [rsp + {xmm_frame}]",
    "call {handle_exit}",
    "movaps xmm0, [rsp + 0x0]",
    "movaps xmm1, [rsp + 0x10]",
    "movaps xmm2, [rsp + 0x20]",
    "movaps xmm3, [rsp + 0x30]",
    "movaps xmm4, [rsp + 0x40]",
    "movaps xmm5, [rsp + 0x50]",
    "movaps xmm6, [rsp + 0x60]",
    "movaps xmm7, [rsp + 0x70]",
    "movaps xmm8, [rsp + 0x80]",
    "movaps xmm9, [rsp + 0x90]",
    "movaps xmm10, [rsp + 0xa0]",
    "movaps xmm11, [rsp + 0xb0]",
    "movaps xmm12, [rsp + 0xc0]",
    "movaps xmm13, [rsp + 0xd0]",
    "movaps xmm14, [rsp + 0xe0]",
    "movaps xmm15, [rsp + 0xf0]",
    "add rsp, {xmm_frame}",
    "mov rax, [rsp + 0x00]",
    "mov rcx, [rsp + 0x08]",
    "mov rdx, [rsp + 0x10]",
    "mov rbx, [rsp + 0x18]",
    "mov rbp, [rsp + 0x28]",
    "mov rsi, [rsp + 0x30]",
    "mov rdi, [rsp + 0x38]",
    "mov r8, [rsp + 0x40]",
    "mov r9, [rsp + 0x48]",
    "mov r10, [rsp + 0x50]",
    "mov r11, [rsp + 0x58]",
    "mov r12, [rsp + 0x60]",
    "mov r13, [rsp + 0x68]",
    "mov r14, [rsp + 0x70]",
    "mov r15, [rsp + 0x78]",
    "add rsp, 0x80",
    "vmresume",
    "sub rsp, 8",
    "call {resume_failed}",
    xmm_frame = const EXIT_XMM_FRAME_SIZE,
    vcpu_offset = const EXIT_XMM_FRAME_SIZE + core::mem::size_of::<GuestRegisters>() + 8,
    handle_exit = sym handle_vm_exit,
    resume_failed = sym handle_vmresume_failure,
);

// One 16 byte entry per vector. Vectors without an error code push a zero so
// that every entry builds the same `TrapFrame`. The common path saves the
// caller-saved registers, XMM0-15 included.
//
global_asm!(
    ".global vmx_interrupt_entries",
    ".balign 16",
    "vmx_interrupt_entries:",
    ".set hv_vector, 0",
    ".rept 256",
    ".balign 16",
    ".if (hv_vector == 8) || ((hv_vector >= 10) && (hv_vector <= 14)) || (hv_vector == 17) || (hv_vector == 21) || (hv_vector == 29) || (hv_vector == 30)",
    ".else",
    "push 0",
    ".endif",
    "push hv_vector",
    "jmp 4f",
    ".set hv_vector, hv_vector + 1",
    ".endr",
    "4:",
    "push rbp",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "lea rdi, [rsp + 0x50]",
    "mov rbp, rsp",
    "and rsp, -16",
    "sub rsp, {xmm_area}",
    "movaps [rsp + 0x0], xmm0",
    "movaps [rsp + 0x10], xmm1",
    "movaps [rsp + 0x20], xmm2",
    "movaps [rsp + 0x30], xmm3",
    "movaps [rsp + 0x40], xmm4",
    "movaps [rsp + 0x50], xmm5",
    "movaps [rsp + 0x60], xmm6",
    "movaps [rsp + 0x70], xmm7",
    "movaps [rsp + 0x80], xmm8",
    "movaps [rsp + 0x90], xmm9",
    "movaps [rsp + 0xa0], xmm10",
    "movaps [rsp + 0xb0], xmm11",
    "movaps [rsp + 0xc0], xmm12",
    "movaps [rsp + 0xd0], xmm13",
    "movaps [rsp + 0xe0], xmm14",
    "movaps [rsp + 0xf0], xmm15",
    "call {handle_interrupt}",
    "movaps xmm0, [rsp + 0x0]",
    "movaps xmm1, [rsp + 0x10]",
    "movaps xmm2, [rsp + 0x20]",
    "movaps xmm3, [rsp + 0x30]",
    "movaps xmm4, [rsp + 0x40]",
    "movaps xmm5, [rsp + 0x50]",
    "movaps xmm6, [rsp + 0x60]",
    "movaps xmm7, [rsp + 0x70]",
    "movaps xmm8, [rsp + 0x80]",
    "movaps xmm9, [rsp + 0x90]",
    "movaps xmm10, [rsp + 0xa0]",
    "movaps xmm11, [rsp + 0xb0]",
    "movaps xmm12, [rsp + 0xc0]",
    "movaps xmm13, [rsp + 0xd0]",
    "movaps xmm14, [rsp + 0xe0]",
    "movaps xmm15, [rsp + 0xf0]",
    "mov rsp, rbp",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "pop rbp",
    "add rsp, 0x10",
    "iretq",
    xmm_area = const XMM_SAVE_AREA_SIZE,
    handle_interrupt = sym handle_host_interrupt,
);

unsafe extern "sysv64" fn handle_vm_exit(vcpu: *const Vcpu, guest_regs: *mut GuestRegisters) {
    let (Some(vcpu), Some(guest_regs)) = (vcpu.as_ref(), guest_regs.as_mut()) else {
        halt();
    };

    if vcpu.data().host_stack_layout.reserved != STACK_MARKER {
        log::error!("Host stack of processor {} is corrupted", vcpu.id());
        halt();
    }

    if let Err(error) = vcpu.handle_vm_exit(&mut Intel, guest_regs) {
        log::error!("Fatal VM-exit on processor {}: {}", vcpu.id(), error);
        dbg_break!();
        halt();
    }
}

unsafe extern "sysv64" fn handle_vmresume_failure() -> ! {
    let error = crate::vmx::instruction_error::InstructionError::read(&Intel);
    log::error!("VMRESUME failed: {:?}", error);
    dbg_break!();
    halt();
}

unsafe extern "sysv64" fn handle_host_interrupt(frame: *const TrapFrame) {
    let Some(frame) = frame.as_ref() else {
        return;
    };

    if let Err(error) = interrupt::handle_host_interrupt(&mut Intel, frame) {
        log::error!("Failed to handle host interrupt {}: {}", frame.vector, error);
    }
}

fn halt() -> ! {
    loop {
        interrupts::disable();
        x86_64::instructions::hlt();
    }
}

fn read_tr() -> u16 {
    let selector: u16;
    unsafe { asm!("str {0:x}", out(reg) selector, options(nomem, nostack, preserves_flags)) };
    selector
}

fn read_ldtr() -> u16 {
    let selector: u16;
    unsafe { asm!("sldt {0:x}", out(reg) selector, options(nomem, nostack, preserves_flags)) };
    selector
}

static TRANSLATOR: Once<fn(u64) -> Option<u64>> = Once::new();

/// The logical processor the caller currently runs on.
pub struct Intel;

impl Intel {
    /// Installs the function that translates host virtual addresses. Only the
    /// first call has an effect.
    pub fn install_translator(translate: fn(u64) -> Option<u64>) {
        TRANSLATOR.call_once(|| translate);
    }

    /// All-context INVEPT is only available when EPT is.
    fn invept_supported(&self) -> bool {
        const SECONDARY_CONTROLS: u64 = 1 << 31;
        const ENABLE_EPT: u64 = 1 << 1;
        const INVEPT: u64 = 1 << 20;
        const INVEPT_ALL_CONTEXT_SUPPORTED: u64 = 1 << 26;

        if (self.read_msr(IA32_VMX_PROCBASED_CTLS) >> 32) & SECONDARY_CONTROLS == 0 {
            return false;
        }
        if (self.read_msr(IA32_VMX_PROCBASED_CTLS2) >> 32) & ENABLE_EPT == 0 {
            return false;
        }

        let capabilities = self.read_msr(IA32_VMX_EPT_VPID_CAP);
        capabilities & INVEPT != 0 && capabilities & INVEPT_ALL_CONTEXT_SUPPORTED != 0
    }
}

impl VmcsAccess for Intel {
    fn vmread(&self, field: u32) -> Result<u64> {
        unsafe { vmx::vmread(field) }
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<()> {
        unsafe { vmx::vmwrite(field, value) }
    }
}

impl Processor for Intel {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let result = cpuid!(leaf, subleaf);

        CpuidResult {
            eax: result.eax,
            ebx: result.ebx,
            ecx: result.ecx,
            edx: result.edx,
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        unsafe { rdmsr(msr) }
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        unsafe { wrmsr(msr, value) }
    }

    fn read_cr(&self, register: ControlRegister) -> u64 {
        match register {
            ControlRegister::Cr0 => Cr0::read_raw(),
            ControlRegister::Cr3 => unsafe { controlregs::cr3() },
            ControlRegister::Cr4 => Cr4::read_raw(),
        }
    }

    fn write_cr(&mut self, register: ControlRegister, value: u64) {
        match register {
            ControlRegister::Cr0 => unsafe { Cr0::write_raw(value) },
            ControlRegister::Cr3 => unsafe { controlregs::cr3_write(value) },
            ControlRegister::Cr4 => unsafe { Cr4::write_raw(value) },
        }
    }

    fn read_dr7(&self) -> u64 {
        let dr7: u64;
        unsafe { asm!("mov {}, dr7", out(reg) dr7, options(nomem, nostack, preserves_flags)) };
        dr7
    }

    fn read_rflags(&self) -> u64 {
        rflags::read().bits()
    }

    fn disable_interrupts(&mut self) {
        interrupts::disable();
    }

    fn enable_interrupts(&mut self) {
        interrupts::enable();
    }

    fn gdtr(&self) -> TableRegister {
        let gdtr = sgdt();

        TableRegister {
            base: gdtr.base.as_u64(),
            limit: gdtr.limit,
        }
    }

    fn idtr(&self) -> TableRegister {
        let idtr = sidt();

        TableRegister {
            base: idtr.base.as_u64(),
            limit: idtr.limit,
        }
    }

    fn read_table_entry(&self, table: &TableRegister, index: u16) -> u64 {
        if index as u64 * 8 + 7 > table.limit as u64 {
            return 0;
        }

        let entry = (table.base + index as u64 * 8) as *const u64;
        unsafe { core::ptr::read_volatile(entry) }
    }

    fn segment_selectors(&self) -> SegmentSelectors {
        SegmentSelectors {
            cs: CS::get_reg().0,
            ss: SS::get_reg().0,
            ds: DS::get_reg().0,
            es: ES::get_reg().0,
            fs: FS::get_reg().0,
            gs: GS::get_reg().0,
            tr: read_tr(),
            ldtr: read_ldtr(),
        }
    }

    fn physical_address(&self, virtual_address: u64) -> Option<u64> {
        TRANSLATOR.get().and_then(|translate| translate(virtual_address))
    }

    fn vmxon(&mut self, physical_address: u64) -> Result<()> {
        unsafe { vmx::vmxon(physical_address) }
    }

    fn vmxoff(&mut self) -> Result<()> {
        unsafe { vmx::vmxoff() }
    }

    fn vmclear(&mut self, physical_address: u64) -> Result<()> {
        unsafe { vmx::vmclear(physical_address) }
    }

    fn vmptrld(&mut self, physical_address: u64) -> Result<()> {
        unsafe { vmx::vmptrld(physical_address) }
    }

    fn invept_all_contexts(&mut self) -> Result<()> {
        if !self.invept_supported() {
            log::trace!("INVEPT is not supported, skipping it");
            return Ok(());
        }

        let descriptor = [0u64; 2];
        let (carry, zero): (u8, u8);
        unsafe {
            asm!(
                "invept {kind}, [{descriptor}]",
                "setc {carry}",
                "setz {zero}",
                kind = in(reg) INVEPT_ALL_CONTEXT,
                descriptor = in(reg) descriptor.as_ptr(),
                carry = out(reg_byte) carry,
                zero = out(reg_byte) zero,
                options(nostack),
            )
        };

        match (carry, zero) {
            (0, 0) => Ok(()),
            (0, _) => Err(VmFail::VmFailValid),
            _ => Err(VmFail::VmFailInvalid),
        }
    }

    fn vmlaunch(&mut self) -> Result<()> {
        match unsafe { vmx_launch() } {
            LAUNCH_SUCCEEDED => Ok(()),
            LAUNCH_FAILED_VALID => Err(VmFail::VmFailValid),
            _ => Err(VmFail::VmFailInvalid),
        }
    }

    fn exit_entry_point(&self) -> u64 {
        vmx_exit as usize as u64
    }

    fn interrupt_entry_point(&self, vector: u8) -> u64 {
        vmx_interrupt_entries as usize as u64 + vector as u64 * INTERRUPT_ENTRY_SIZE
    }
}
