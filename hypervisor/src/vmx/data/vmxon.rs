use elain::Align;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// The VMXON region. Only the revision identifier is ever touched by
/// software, the rest belongs to the processor.
#[repr(C)]
pub struct VmxonRegion {
    _align: Align<BASE_PAGE_SIZE>,
    pub revision_id: u32,
    pub data: [u8; BASE_PAGE_SIZE - 4],
}
const_assert_eq!(core::mem::size_of::<VmxonRegion>(), BASE_PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<VmxonRegion>(), BASE_PAGE_SIZE);

impl VmxonRegion {
    pub fn set_revision_id(&mut self, revision_id: u32) {
        // Bit 31 is always 0 for the VMXON region.
        //
        self.revision_id = revision_id & !(1 << 31);
    }
}
