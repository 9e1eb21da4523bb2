/// General purpose registers of the guest, saved by the exit trampoline.
///
/// The order matches the encoding used by instructions and exit
/// qualifications, so a register number can be used as an index. `rsp` is a
/// placeholder, the guest stack pointer lives in the VMCS.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 16 * 8);

impl GuestRegisters {
    /// Number of the `rsp` register.
    pub const RSP: u8 = 4;

    fn as_array(&self) -> &[u64; 16] {
        unsafe { &*(self as *const Self as *const [u64; 16]) }
    }

    fn as_array_mut(&mut self) -> &mut [u64; 16] {
        unsafe { &mut *(self as *mut Self as *mut [u64; 16]) }
    }

    pub fn get(&self, register: u8) -> u64 {
        self.as_array()[register as usize & 0xF]
    }

    pub fn set(&mut self, register: u8, value: u64) {
        self.as_array_mut()[register as usize & 0xF] = value;
    }

    /// Returns `edx:eax` as a single value.
    pub fn edx_eax(&self) -> u64 {
        (self.rdx as u32 as u64) << 32 | self.rax as u32 as u64
    }

    /// Splits `value` into `edx:eax`, clearing the upper halves.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = (value as u32) as u64;
        self.rdx = (value >> 32) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_numbers_follow_the_encoding() {
        let mut regs = GuestRegisters::default();

        regs.set(3, 0x1234);
        regs.set(15, 0xFFFF);

        assert_eq!(regs.rbx, 0x1234);
        assert_eq!(regs.r15, 0xFFFF);
        assert_eq!(regs.get(3), 0x1234);
    }

    #[test]
    fn edx_eax_round_trip() {
        let mut regs = GuestRegisters {
            rax: 0xFFFF_FFFF_0000_0001,
            rdx: 0xFFFF_FFFF_0000_0002,
            ..Default::default()
        };
        assert_eq!(regs.edx_eax(), 0x2_0000_0001);

        regs.set_edx_eax(0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(regs.rax, 0xCAFE_BABE);
        assert_eq!(regs.rdx, 0xDEAD_BEEF);
    }
}
