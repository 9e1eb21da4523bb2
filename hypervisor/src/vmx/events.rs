use crate::{
    error::Result,
    vmx::{
        cpu::VmcsAccess,
        vmcs::{vmread, vmwrite},
    },
};
use bitfield::bitfield;
use x86::vmx::vmcs::{control, ro};

/// Interruption types used by the interruption-information fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

pub const NMI_VECTOR: u32 = 2;

bitfield! {
    /// The VM-entry interruption-information field.
    ///
    /// See `25.8.3 VM-Entry Controls for Event Injection` in the Intel SDM.
    ///
    /// ## Fields
    ///
    /// - `Vector`: Vector of the interrupt or exception. Ignored for NMIs
    ///   other than being 2 by convention.
    /// - `Type`: See [`InterruptionType`].
    /// - `Deliver Error Code`: Push `VMENTRY_EXCEPTION_ERR_CODE` when set.
    /// - `Valid`: Inject the event on the next VM-entry.
    pub struct EventInjection(u32);
    impl Debug;
    pub get_vector, set_vector: 7, 0;                        // [0-7]
    pub get_type, set_type: 10, 8;                           // [8-10]
    pub get_deliver_error_code, set_deliver_error_code: 11;  // [11]
    // Reserved                                              // [12-30]
    pub get_valid, set_valid: 31;                            // [31]
}

impl EventInjection {
    pub fn nmi() -> Self {
        let mut event = EventInjection(0);
        event.set_vector(NMI_VECTOR);
        event.set_type(InterruptionType::NonMaskableInterrupt as u32);
        event.set_valid(true);

        event
    }

    pub fn hardware_exception(vector: u8, deliver_error_code: bool) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(vector as u32);
        event.set_type(InterruptionType::HardwareException as u32);
        event.set_deliver_error_code(deliver_error_code);
        event.set_valid(true);

        event
    }

    /// `#GP(0)`
    pub fn gp() -> Self {
        Self::hardware_exception(13, true)
    }

    /// The event that caused a VM-exit, with its type kept as is.
    pub fn reflect(info: &ExitInterruptionInfo) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(info.vector());
        event.set_type(info.interruption_type());
        event.set_deliver_error_code(info.error_code_valid());
        event.set_valid(true);

        event
    }

    /// Software interrupts and exceptions need the length of the instruction
    /// that raised them.
    pub fn needs_instruction_length(&self) -> bool {
        self.get_type() == InterruptionType::SoftwareInterrupt as u32
            || self.get_type() == InterruptionType::PrivilegedSoftwareException as u32
            || self.get_type() == InterruptionType::SoftwareException as u32
    }

    /// Queues the event for the next VM-entry.
    pub fn inject<C: VmcsAccess + ?Sized>(&self, cpu: &mut C, error_code: u32) -> Result<()> {
        if self.get_deliver_error_code() {
            vmwrite(cpu, control::VMENTRY_EXCEPTION_ERR_CODE, error_code)?;
        }

        vmwrite(cpu, control::VMENTRY_INTERRUPTION_INFO_FIELD, self.0)
    }
}

bitfield! {
    /// The VM-exit interruption-information field, which has the same layout
    /// as [`EventInjection`] plus the NMI unblocking bit.
    ///
    /// See `25.9.2 Information for VM Exits Due to Vectored Events` in the
    /// Intel SDM.
    pub struct ExitInterruptionInfo(u32);
    impl Debug;
    pub vector, _: 7, 0;
    pub interruption_type, _: 10, 8;
    pub error_code_valid, _: 11;
    pub nmi_unblocking, _: 12;
    pub valid, _: 31;
}

impl ExitInterruptionInfo {
    pub fn read<C: VmcsAccess + ?Sized>(cpu: &C) -> Result<Self> {
        Ok(Self(vmread(cpu, ro::VMEXIT_INTERRUPTION_INFO)? as u32))
    }

    pub fn is_nmi(&self) -> bool {
        self.valid() && self.interruption_type() == InterruptionType::NonMaskableInterrupt as u32
    }
}
