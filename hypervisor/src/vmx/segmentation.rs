//! Decoding of GDT entries into the base, limit and access rights the VMCS
//! guest-state area expects.

use crate::vmx::cpu::{Processor, TableRegister};
use bitfield::bitfield;

bitfield! {
    /// A legacy 8-byte segment descriptor.
    ///
    /// See `3.4.5 Segment Descriptors` in the Intel SDM.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SegmentDescriptor(u64);
    impl Debug;

    pub limit_low, set_limit_low: 15, 0;
    pub base_low, set_base_low: 39, 16;
    pub segment_type, set_segment_type: 43, 40;
    pub descriptor_type, set_descriptor_type: 44;
    pub dpl, set_dpl: 46, 45;
    pub present, set_present: 47;
    pub limit_high, set_limit_high: 51, 48;
    pub avl, set_avl: 52;
    pub long_mode, set_long_mode: 53;
    pub default_big, set_default_big: 54;
    pub granularity, set_granularity: 55;
    pub base_high, set_base_high: 63, 56;
}

bitfield! {
    /// Segment access rights in the format used by the VMCS.
    ///
    /// See `Table 25-2. Format of Access Rights` in the Intel SDM.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights(u32);
    impl Debug;

    pub segment_type, set_segment_type: 3, 0;
    pub descriptor_type, set_descriptor_type: 4;
    pub dpl, set_dpl: 6, 5;
    pub present, set_present: 7;
    pub avl, set_avl: 12;
    pub long_mode, set_long_mode: 13;
    pub default_big, set_default_big: 14;
    pub granularity, set_granularity: 15;
    pub unusable, set_unusable: 16;
}

impl SegmentAccessRights {
    pub fn unusable_segment() -> Self {
        let mut rights = Self(0);
        rights.set_unusable(true);
        rights
    }
}

impl From<SegmentDescriptor> for SegmentAccessRights {
    fn from(descriptor: SegmentDescriptor) -> Self {
        // Bits 47:40 and 55:52 of the descriptor, with bits 11:8 reserved.
        //
        let low = (descriptor.0 >> 40) & 0xFF;
        let high = (descriptor.0 >> 52) & 0xF;

        Self((low | high << 12) as u32)
    }
}

impl SegmentDescriptor {
    pub fn base(&self) -> u32 {
        (self.base_low() | self.base_high() << 24) as u32
    }

    /// The limit in bytes, taking the granularity into account.
    pub fn limit(&self) -> u32 {
        let limit = (self.limit_low() | self.limit_high() << 16) as u32;

        if self.granularity() {
            (limit << 12) | 0xFFF
        } else {
            limit
        }
    }
}

/// Everything the guest-state area stores about a segment register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    const TABLE_INDICATOR: u16 = 1 << 2;

    /// Looks up `selector` in the GDT described by `gdtr`.
    ///
    /// Null selectors, LDT selectors and selectors outside of the table are
    /// reported as unusable.
    pub fn from_gdt<P: Processor + ?Sized>(cpu: &P, gdtr: &TableRegister, selector: u16) -> Self {
        Self::from_table(selector, gdtr.limit, |index| cpu.read_table_entry(gdtr, index))
    }

    pub fn from_table(selector: u16, table_limit: u16, read_entry: impl Fn(u16) -> u64) -> Self {
        let unusable = Self {
            selector,
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::unusable_segment(),
        };

        let index = selector >> 3;
        if index == 0 || selector & Self::TABLE_INDICATOR != 0 {
            return unusable;
        }

        let offset = index as u32 * 8;
        if offset + 7 > table_limit as u32 {
            log::warn!("Selector {:#x} is outside of the GDT", selector);
            return unusable;
        }

        let descriptor = SegmentDescriptor(read_entry(index));
        let mut base = descriptor.base() as u64;

        // System descriptors (TSS, LDT) are 16 bytes long in long mode and
        // carry bits 63:32 of the base in the following entry.
        //
        if !descriptor.descriptor_type() && offset + 15 <= table_limit as u32 {
            base |= (read_entry(index + 1) & 0xFFFF_FFFF) << 32;
        }

        Self {
            selector,
            base,
            limit: descriptor.limit(),
            access_rights: descriptor.into(),
        }
    }
}
