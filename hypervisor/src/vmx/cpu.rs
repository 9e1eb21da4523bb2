//! The processor capabilities the virtualization core depends on.
//!
//! Everything that touches a privileged register or executes a VMX instruction
//! goes through [`Processor`]. The hardware implementation lives in
//! [`crate::vmx::intel`]; tests use a simulated processor instead.

use snafu::OptionExt;
use x86::vmx::Result;

/// Result of a `cpuid` instruction.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ControlRegister {
    Cr0,
    Cr3,
    Cr4,
}

/// Contents of `GDTR` or `IDTR`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

/// The segment selectors that are currently loaded.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SegmentSelectors {
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub ldtr: u16,
}

/// Reads and writes fields of the current VMCS.
pub trait VmcsAccess {
    fn vmread(&self, field: u32) -> Result<u64>;
    fn vmwrite(&mut self, field: u32, value: u64) -> Result<()>;
}

/// A logical processor.
///
/// Implementations must only ever be used on the processor they describe.
pub trait Processor: VmcsAccess {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    fn read_msr(&self, msr: u32) -> u64;
    fn write_msr(&mut self, msr: u32, value: u64);

    fn read_cr(&self, register: ControlRegister) -> u64;
    fn write_cr(&mut self, register: ControlRegister, value: u64);

    fn read_dr7(&self) -> u64;
    fn read_rflags(&self) -> u64;

    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);

    fn gdtr(&self) -> TableRegister;
    fn idtr(&self) -> TableRegister;

    /// Reads the 8-byte entry at `index` of the descriptor table described by
    /// `table`.
    fn read_table_entry(&self, table: &TableRegister, index: u16) -> u64;

    fn segment_selectors(&self) -> SegmentSelectors;

    /// Translates a host virtual address, if it is mapped.
    fn physical_address(&self, virtual_address: u64) -> Option<u64>;

    fn vmxon(&mut self, physical_address: u64) -> Result<()>;
    fn vmxoff(&mut self) -> Result<()>;
    fn vmclear(&mut self, physical_address: u64) -> Result<()>;
    fn vmptrld(&mut self, physical_address: u64) -> Result<()>;

    /// Invalidates the EPT-derived translations of all contexts.
    fn invept_all_contexts(&mut self) -> Result<()>;

    /// Launches the guest through the launch trampoline. Only returns on
    /// failure on real hardware.
    fn vmlaunch(&mut self) -> Result<()>;

    /// Address the processor jumps to on every VM-exit.
    fn exit_entry_point(&self) -> u64;

    /// Address of the host-side entry point for interrupt `vector`.
    fn interrupt_entry_point(&self, vector: u8) -> u64;
}

/// Translates `virtual_address` or fails with
/// [`HypervisorError::AddressTranslation`](crate::error::HypervisorError::AddressTranslation).
pub fn physical_address<P: Processor + ?Sized>(
    cpu: &P, virtual_address: u64,
) -> crate::error::Result<u64> {
    cpu.physical_address(virtual_address)
        .context(crate::error::AddressTranslationSnafu {
            address: virtual_address,
        })
}
