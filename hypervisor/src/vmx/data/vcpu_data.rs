use crate::vmx::{
    data::{msr_bitmap::MsrBitmap, vmcs::VmcsRegion, vmxon::VmxonRegion},
    host::{InterruptGate, HOST_GDT_ENTRIES, HOST_IDT_ENTRIES},
};
use alloc::boxed::Box;
use elain::Align;
use x86::bits64::{paging::BASE_PAGE_SIZE, task::TaskStateSegment};

pub const HOST_STACK_SIZE: usize = 0x6000;
pub const STACK_CONTENTS_SIZE: usize = HOST_STACK_SIZE - 2 * core::mem::size_of::<u64>();

/// Marker stored in [`HostStackLayout::reserved`].
pub const STACK_MARKER: u64 = u64::MAX;

#[repr(C, align(4096))]
pub struct HostStackLayout {
    pub stack_contents: [u8; STACK_CONTENTS_SIZE],

    /// Pointer to the owning vcpu, located right above `HOST_RSP + 8`.
    pub vcpu: u64,
    pub reserved: u64,
}
const_assert_eq!(core::mem::size_of::<HostStackLayout>(), HOST_STACK_SIZE);

impl HostStackLayout {
    /// The value for `HOST_RSP`.
    ///
    /// The exit entry point is reached like a called function would be, so the
    /// stack pointer must be 8 modulo 16.
    pub fn host_rsp(&self) -> u64 {
        let top = self.stack_contents.as_ptr() as u64 + STACK_CONTENTS_SIZE as u64;

        (top & !0b1111) - 8
    }
}

/// The host task state segment. Nothing in it is used, it only exists because
/// `TR` must not be null on VM-exit.
#[repr(C)]
pub struct HostTaskSegment {
    _align: Align<BASE_PAGE_SIZE>,
    pub tss: TaskStateSegment,
}
const_assert_eq!(core::mem::size_of::<HostTaskSegment>(), BASE_PAGE_SIZE);

/// All per-processor memory. Allocated once and never moved.
#[repr(C, align(4096))]
pub struct VcpuData {
    /// ```text
    ///  Low     stack_contents[0]                         StackLimit
    ///  ^       ...
    ///  ^       stack_contents[STACK_CONTENTS_SIZE - 1]
    ///  High    vcpu, reserved                            StackBase
    /// ```
    pub host_stack_layout: HostStackLayout,
    pub vmxon_region: VmxonRegion,
    pub vmcs_region: VmcsRegion,
    pub msr_bitmap: MsrBitmap,
    pub host_tss: HostTaskSegment,
    pub host_idt: [InterruptGate; HOST_IDT_ENTRIES],
    pub host_gdt: [u64; HOST_GDT_ENTRIES],
}
const_assert_eq!(
    core::mem::size_of::<VcpuData>(),
    HOST_STACK_SIZE + 6 * BASE_PAGE_SIZE
);
const_assert_eq!(core::mem::align_of::<VcpuData>(), BASE_PAGE_SIZE);

impl VcpuData {
    pub fn new() -> Box<Self> {
        // Every field is plain data for which all zeroes is a valid value.
        //
        unsafe { Box::new_zeroed().assume_init() }
    }
}
