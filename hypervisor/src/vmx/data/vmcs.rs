use elain::Align;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// The VMCS region.
///
/// See `25.2 FORMAT OF THE VMCS REGION` in the Intel SDM.
#[repr(C)]
pub struct VmcsRegion {
    _align: Align<BASE_PAGE_SIZE>,

    /// Bits 30:0 hold the VMCS revision identifier, bit 31 is the shadow-VMCS
    /// indicator.
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub data: [u8; BASE_PAGE_SIZE - 8],
}
const_assert_eq!(core::mem::size_of::<VmcsRegion>(), BASE_PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<VmcsRegion>(), BASE_PAGE_SIZE);

const SHADOW_VMCS_INDICATOR: u32 = 1 << 31;

impl VmcsRegion {
    /// Stamps the revision identifier and marks the region as an ordinary
    /// (non-shadow) VMCS.
    pub fn set_revision_id(&mut self, revision_id: u32) {
        self.revision_id = revision_id & !SHADOW_VMCS_INDICATOR;
    }

    pub fn is_shadow(&self) -> bool {
        self.revision_id & SHADOW_VMCS_INDICATOR != 0
    }
}
