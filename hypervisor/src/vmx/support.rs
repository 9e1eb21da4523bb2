//! Checks whether the current processor is able to run the hypervisor.

use crate::{
    error::{Result, VmxLockedOffSnafu, VmxNotSupportedSnafu},
    vmx::cpu::Processor,
};
use bitfield::bitfield;
use bitflags::bitflags;
use x86::msr::{IA32_FEATURE_CONTROL, IA32_VMX_BASIC};

/// `CPUID.01H:ECX.VMX[bit 5]`
const CPUID_VMX: u32 = 1 << 5;

bitflags! {
    /// See `24.7 ENABLING AND ENTERING VMX OPERATION` in the Intel SDM.
    pub struct FeatureControl: u64 {
        const LOCKED = 1 << 0;
        const VMX_INSIDE_SMX = 1 << 1;
        const VMX_OUTSIDE_SMX = 1 << 2;
    }
}

bitfield! {
    /// `IA32_VMX_BASIC`, see `A.1 BASIC VMX INFORMATION` in the Intel SDM.
    #[derive(Clone, Copy)]
    pub struct VmxBasic(u64);
    impl Debug;

    pub revision_id, _: 30, 0;
    pub region_size, _: 44, 32;
    pub memory_type, _: 53, 50;
    pub true_controls, _: 55;
}

/// What [`check`] found out about `IA32_FEATURE_CONTROL`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FeatureControlState {
    /// Locked with VMX allowed outside of SMX.
    Enabled,
    /// Not locked yet. The root-mode enabler locks it with VMX enabled.
    Unlocked,
}

/// Checks whether VMX can be used on this processor and why not.
///
/// # Algorithm
/// Taken from `24.6 DISCOVERING SUPPORT FOR VMX` and `24.7 ENABLING AND
/// ENTERING VMX OPERATION` of the Intel SDM.
/// ```text
/// if (CPUID.01H:ECX.VMX == 0)
///     return VMX_NOT_AVAILABLE;
///
/// if (IA32_FEATURE_CONTROL.LOCK == 0)
///     return VMX_ALLOWED;
///     // the MSR is written and locked before VMXON
///
/// if (IA32_FEATURE_CONTROL.ENABLE_VMX_OUTSIDE_SMX == 0)
///     return VMX_DISABLED_BY_FIRMWARE;
///     // no way to change it until the next reset
///
/// return VMX_ALLOWED;
/// ```
pub fn check<P: Processor + ?Sized>(cpu: &P) -> Result<FeatureControlState> {
    if cpu.cpuid(1, 0).ecx & CPUID_VMX == 0 {
        log::warn!("Processor does not support VMX");
        return VmxNotSupportedSnafu.fail();
    }

    let feature_control = FeatureControl::from_bits_truncate(cpu.read_msr(IA32_FEATURE_CONTROL));
    if !feature_control.contains(FeatureControl::LOCKED) {
        return Ok(FeatureControlState::Unlocked);
    }

    if !feature_control.contains(FeatureControl::VMX_OUTSIDE_SMX) {
        log::warn!("VMX is disabled and locked in IA32_FEATURE_CONTROL. Enable it in the firmware.");
        return VmxLockedOffSnafu.fail();
    }

    Ok(FeatureControlState::Enabled)
}

/// Checks whether vmx is supported by the processor.
pub fn is_vmx_supported<P: Processor + ?Sized>(cpu: &P) -> bool {
    check(cpu).is_ok()
}

/// The VMCS revision identifier, without the shadow-VMCS indicator.
pub fn vmcs_revision_id<P: Processor + ?Sized>(cpu: &P) -> u32 {
    VmxBasic(cpu.read_msr(IA32_VMX_BASIC)).revision_id() as u32
}
