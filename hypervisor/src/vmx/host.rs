//! The descriptor tables the hypervisor runs on after a VM-exit. They are
//! private to each vcpu and never shared with the guest.

use crate::vmx::{cpu::Processor, data::vcpu_data::VcpuData};
use x86::bits64::task::TaskStateSegment;

pub const HOST_GDT_ENTRIES: usize = 4;
pub const HOST_IDT_ENTRIES: usize = 256;

/// GDT index 1, RPL 0.
pub const HOST_CS_SELECTOR: u16 = 1 << 3;
/// GDT index 2 (and 3), RPL 0.
pub const HOST_TR_SELECTOR: u16 = 2 << 3;

/// Flat, present, ring 0, execute/read, accessed, 64-bit, 4 KiB granularity.
const CODE64_DESCRIPTOR: u64 = 0x00AF_9B00_0000_FFFF;

/// Present 64-bit interrupt gate, DPL 0.
const INTERRUPT_GATE: u8 = 0x8E;

/// Available 64-bit TSS.
const TSS_AVAILABLE: u64 = 0b1001;

/// A 16-byte IDT entry.
///
/// See `6.14.1 64-Bit Mode IDT` in the Intel SDM.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterruptGate {
    pub offset_low: u16,
    pub selector: u16,
    pub ist: u8,
    pub attributes: u8,
    pub offset_mid: u16,
    pub offset_high: u32,
    pub reserved: u32,
}
const_assert_eq!(core::mem::size_of::<InterruptGate>(), 16);

impl InterruptGate {
    pub fn new(handler: u64, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            attributes: INTERRUPT_GATE,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        self.offset_low as u64 | (self.offset_mid as u64) << 16 | (self.offset_high as u64) << 32
    }
}

/// Points every vector at its host entry point.
pub fn prepare_host_idt<P: Processor + ?Sized>(cpu: &P, idt: &mut [InterruptGate; HOST_IDT_ENTRIES]) {
    for (vector, gate) in idt.iter_mut().enumerate() {
        *gate = InterruptGate::new(cpu.interrupt_entry_point(vector as u8), HOST_CS_SELECTOR);
    }
}

/// Builds the host GDT: null descriptor, 64-bit code segment, and a 16-byte
/// TSS descriptor for the TSS at `tss_base`.
pub fn prepare_host_gdt(gdt: &mut [u64; HOST_GDT_ENTRIES], tss_base: u64) {
    let limit = (core::mem::size_of::<TaskStateSegment>() - 1) as u64;

    let tss_low = (limit & 0xFFFF)
        | (tss_base & 0xFF_FFFF) << 16
        | TSS_AVAILABLE << 40
        | 1 << 47
        | (limit >> 16 & 0xF) << 48
        | (tss_base >> 24 & 0xFF) << 56;

    gdt[0] = 0;
    gdt[(HOST_CS_SELECTOR >> 3) as usize] = CODE64_DESCRIPTOR;
    gdt[(HOST_TR_SELECTOR >> 3) as usize] = tss_low;
    gdt[(HOST_TR_SELECTOR >> 3) as usize + 1] = tss_base >> 32;
}

/// Initializes the structures the VMCS points to: MSR bitmap, host TSS,
/// host IDT and host GDT.
///
/// The MSR bitmap is cleared so that no MSR access exits, callers that want
/// intercepts set them afterwards.
pub fn prepare_external_structures<P: Processor + ?Sized>(cpu: &P, data: &mut VcpuData) {
    data.msr_bitmap.clear();

    data.host_tss.tss = TaskStateSegment::new();

    prepare_host_idt(cpu, &mut data.host_idt);

    let tss_base = &data.host_tss as *const _ as u64;
    prepare_host_gdt(&mut data.host_gdt, tss_base);

    log::trace!("Host gdt: {:x?}", data.host_gdt);
}
