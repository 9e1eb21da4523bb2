//! Interrupts that arrive while the processor runs hypervisor code.
//!
//! The host IDT routes every vector here. The only one that needs work is the
//! NMI: it belongs to the guest and has to be delivered the next time the
//! guest can receive one.

use crate::{
    error::Result,
    vmx::{cpu::Processor, data::trap_frame::TrapFrame, vmexit::nmi::queue_nmi},
};

pub const NMI_VECTOR: u64 = 2;

/// Called by the host interrupt entry points with the frame they built.
pub fn handle_host_interrupt<P: Processor + ?Sized>(cpu: &mut P, frame: &TrapFrame) -> Result<()> {
    match frame.vector {
        NMI_VECTOR => queue_nmi(cpu),
        vector => {
            log::trace!("Ignoring host interrupt {} at {:#x}", vector, frame.rip);
            Ok(())
        }
    }
}
