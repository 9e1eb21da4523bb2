/// What the host interrupt entry points push before calling into the
/// coordinator.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapFrame {
    pub vector: u64,
    /// Zero for vectors that do not push an error code.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}
const_assert_eq!(core::mem::size_of::<TrapFrame>(), 7 * 8);
