use alloc::vec::Vec;
use elain::Align;
use x86::bits64::paging::BASE_PAGE_SIZE;

const LOW_MSRS: core::ops::RangeInclusive<u32> = 0x0000_0000..=0x0000_1FFF;
const HIGH_MSRS: core::ops::RangeInclusive<u32> = 0xC000_0000..=0xC000_1FFF;

/// The MSR bitmap. A set bit causes the matching `rdmsr`/`wrmsr` to exit,
/// MSRs outside of the two ranges always exit.
///
/// See `25.6.9 MSR-Bitmap Address` in the Intel SDM.
#[repr(C)]
pub struct MsrBitmap {
    _align: Align<BASE_PAGE_SIZE>,
    /// 0000_0000 to 0000_1FFF
    pub read_low: [u8; 0x400],
    /// C000_0000 to C000_1FFF
    pub read_high: [u8; 0x400],
    /// 0000_0000 to 0000_1FFF
    pub write_low: [u8; 0x400],
    /// C000_0000 to C000_1FFF
    pub write_high: [u8; 0x400],
}
const_assert_eq!(core::mem::size_of::<MsrBitmap>(), BASE_PAGE_SIZE);

impl MsrBitmap {
    pub fn clear(&mut self) {
        self.read_low.fill(0);
        self.read_high.fill(0);
        self.write_low.fill(0);
        self.write_high.fill(0);
    }

    pub fn hook_msr(&mut self, msr: u32) {
        self.hook_rdmsr(msr);
        self.hook_wrmsr(msr);
    }

    pub fn hook_rdmsr(&mut self, msr: u32) {
        if LOW_MSRS.contains(&msr) {
            Self::set_bit(&mut self.read_low, msr);
        } else if HIGH_MSRS.contains(&msr) {
            Self::set_bit(&mut self.read_high, msr);
        } else {
            log::warn!("Msr {:#x} is outside of the bitmap and always exits", msr);
        }
    }

    pub fn hook_wrmsr(&mut self, msr: u32) {
        if LOW_MSRS.contains(&msr) {
            Self::set_bit(&mut self.write_low, msr);
        } else if HIGH_MSRS.contains(&msr) {
            Self::set_bit(&mut self.write_high, msr);
        } else {
            log::warn!("Msr {:#x} is outside of the bitmap and always exits", msr);
        }
    }

    pub fn is_rdmsr_hooked(&self, msr: u32) -> bool {
        if LOW_MSRS.contains(&msr) {
            Self::bit(&self.read_low, msr)
        } else if HIGH_MSRS.contains(&msr) {
            Self::bit(&self.read_high, msr)
        } else {
            true
        }
    }

    pub fn is_wrmsr_hooked(&self, msr: u32) -> bool {
        if LOW_MSRS.contains(&msr) {
            Self::bit(&self.write_low, msr)
        } else if HIGH_MSRS.contains(&msr) {
            Self::bit(&self.write_high, msr)
        } else {
            true
        }
    }

    fn set_bit(bitmap: &mut [u8; 0x400], msr: u32) {
        let offset = (msr & 0x1FFF) as usize;
        bitmap[offset / 8] |= 1 << (offset % 8);
    }

    fn bit(bitmap: &[u8; 0x400], msr: u32) -> bool {
        let offset = (msr & 0x1FFF) as usize;
        bitmap[offset / 8] & (1 << (offset % 8)) != 0
    }
}

/// MSR accesses that should exit, applied to every fresh MSR bitmap.
#[derive(Debug, Default, Clone)]
pub struct MsrIntercepts {
    pub rdmsr: Vec<u32>,
    pub wrmsr: Vec<u32>,
}

impl MsrIntercepts {
    pub fn is_empty(&self) -> bool {
        self.rdmsr.is_empty() && self.wrmsr.is_empty()
    }

    pub fn apply(&self, bitmap: &mut MsrBitmap) {
        for &msr in &self.rdmsr {
            bitmap.hook_rdmsr(msr);
        }
        for &msr in &self.wrmsr {
            bitmap.hook_wrmsr(msr);
        }
    }
}
