//! VM-exit dispatch.
//!
//! Every vcpu owns an [`ExitHandlers`] registry that maps basic exit reasons
//! to handlers. Exit reasons without a handler are fatal.

use crate::{
    error::{Result, UnhandledVmExitSnafu, VmEntryFailureSnafu},
    vmx::{
        cpu::{Processor, VmcsAccess},
        data::guest::GuestRegisters,
        vmcs::{vmread, vmwrite},
    },
};
use bitfield::bitfield;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use x86::vmx::vmcs::{guest, ro};

pub mod cpuid;
pub mod cr;
pub mod exception;
pub mod msr;
pub mod nmi;

/// A basic exit reason, see `Appendix C VMX BASIC EXIT REASONS` in the Intel
/// SDM.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
pub struct BasicExitReason(pub u16);

impl BasicExitReason {
    pub const EXCEPTION_OR_NMI: Self = Self(0);
    pub const EXTERNAL_INTERRUPT: Self = Self(1);
    pub const TRIPLE_FAULT: Self = Self(2);
    pub const INTERRUPT_WINDOW: Self = Self(7);
    pub const NMI_WINDOW: Self = Self(8);
    pub const CPUID: Self = Self(10);
    pub const HLT: Self = Self(12);
    pub const INVD: Self = Self(13);
    pub const RDTSC: Self = Self(16);
    pub const VMCALL: Self = Self(18);
    pub const MOV_CR: Self = Self(28);
    pub const MOV_DR: Self = Self(29);
    pub const IO_INSTRUCTION: Self = Self(30);
    pub const RDMSR: Self = Self(31);
    pub const WRMSR: Self = Self(32);
    pub const INVALID_GUEST_STATE: Self = Self(33);
    pub const EPT_VIOLATION: Self = Self(48);
    pub const EPT_MISCONFIGURATION: Self = Self(49);
    pub const XSETBV: Self = Self(55);

    pub fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::EXCEPTION_OR_NMI => "EXCEPTION_OR_NMI",
            Self::EXTERNAL_INTERRUPT => "EXTERNAL_INTERRUPT",
            Self::TRIPLE_FAULT => "TRIPLE_FAULT",
            Self::INTERRUPT_WINDOW => "INTERRUPT_WINDOW",
            Self::NMI_WINDOW => "NMI_WINDOW",
            Self::CPUID => "CPUID",
            Self::HLT => "HLT",
            Self::INVD => "INVD",
            Self::RDTSC => "RDTSC",
            Self::VMCALL => "VMCALL",
            Self::MOV_CR => "MOV_CR",
            Self::MOV_DR => "MOV_DR",
            Self::IO_INSTRUCTION => "IO_INSTRUCTION",
            Self::RDMSR => "RDMSR",
            Self::WRMSR => "WRMSR",
            Self::INVALID_GUEST_STATE => "INVALID_GUEST_STATE",
            Self::EPT_VIOLATION => "EPT_VIOLATION",
            Self::EPT_MISCONFIGURATION => "EPT_MISCONFIGURATION",
            Self::XSETBV => "XSETBV",
            _ => return None,
        })
    }
}

impl core::fmt::Debug for BasicExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "BasicExitReason({})", self.0),
        }
    }
}

bitfield! {
    /// The exit reason field.
    ///
    /// See `25.9.1 Basic VM-Exit Information` in the Intel SDM.
    #[derive(Clone, Copy)]
    pub struct ExitReason(u32);
    impl Debug;
    pub basic, _: 15, 0;
    pub enclave_mode, _: 27;
    pub pending_mtf, _: 28;
    pub exit_from_root, _: 29;
    pub vm_entry_failure, _: 31;
}

impl ExitReason {
    pub fn read<C: VmcsAccess + ?Sized>(cpu: &C) -> Result<Self> {
        Ok(Self(vmread(cpu, ro::EXIT_REASON)? as u32))
    }

    pub fn basic_reason(&self) -> BasicExitReason {
        BasicExitReason(self.basic() as u16)
    }
}

#[derive(Debug, PartialOrd, PartialEq, Eq, Copy, Clone)]
pub enum ExitType {
    /// Skip the instruction that caused the exit.
    IncrementRip,
    /// Resume the guest at the same instruction.
    Continue,
}

pub type VmExitHandler = fn(&mut dyn Processor, &mut GuestRegisters) -> Result<ExitType>;

#[derive(Clone)]
pub struct ExitHandlers {
    handlers: HashMap<BasicExitReason, VmExitHandler, FnvBuildHasher>,
}

impl Default for ExitHandlers {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExitHandlers {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// The handlers needed to keep a guest running that is a copy of the
    /// host.
    pub fn with_defaults() -> Self {
        let mut handlers = Self::empty();

        macro_rules! add_handler {
            ($reason: expr, $handler: expr) => {
                let _ = handlers
                    .handlers
                    .insert($reason, $handler as VmExitHandler);
            };
        }

        add_handler!(BasicExitReason::MOV_CR, cr::handle_mov_cr);
        add_handler!(BasicExitReason::CPUID, cpuid::handle_default);
        add_handler!(BasicExitReason::RDMSR, msr::handle_rdmsr);
        add_handler!(BasicExitReason::WRMSR, msr::handle_wrmsr);
        add_handler!(BasicExitReason::EXCEPTION_OR_NMI, exception::handle_exception_or_nmi);
        add_handler!(BasicExitReason::NMI_WINDOW, nmi::handle_nmi_window);

        handlers
    }

    /// Registers `handler` for `reason`, replacing the current one.
    pub fn insert(&mut self, reason: BasicExitReason, handler: VmExitHandler) -> Option<VmExitHandler> {
        let previous = self.handlers.insert(reason, handler);
        if previous.is_some() {
            log::warn!("Handler for {:?} was overwritten. Was this on purpose?", reason);
        }

        previous
    }

    pub fn get(&self, reason: BasicExitReason) -> Option<VmExitHandler> {
        self.handlers.get(&reason).copied()
    }

    pub fn contains(&self, reason: BasicExitReason) -> bool {
        self.handlers.contains_key(&reason)
    }

    /// Handles the VM-exit that just happened.
    ///
    /// Returns an error, without calling any handler, for failed VM-entries and
    /// exit reasons nobody registered for. The caller must not resume the guest
    /// in that case.
    pub fn dispatch(&self, cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters) -> Result<ExitType> {
        let exit_reason = ExitReason::read(cpu)?;

        if exit_reason.vm_entry_failure() {
            log::error!("VM-entry failed: {:?}", exit_reason);
            return VmEntryFailureSnafu { reason: exit_reason.0 }.fail();
        }

        let reason = exit_reason.basic_reason();
        let Some(handler) = self.get(reason) else {
            let rip = vmread(cpu, guest::RIP).unwrap_or_default();
            let qualification = vmread(cpu, ro::EXIT_QUALIFICATION).unwrap_or_default();
            log::error!(
                "Unhandled VM-exit {:?} at rip {:#x}, qualification {:#x}, {:x?}",
                reason,
                rip,
                qualification,
                guest_regs
            );

            return UnhandledVmExitSnafu { reason: reason.0, rip }.fail();
        };

        log::trace!("Handling VM-exit {:?}", reason);

        let exit_type = handler(cpu, guest_regs)?;
        if exit_type == ExitType::IncrementRip {
            advance_rip(cpu)?;
        }

        Ok(exit_type)
    }
}

/// Moves the guest past the instruction that caused the exit.
pub fn advance_rip<C: VmcsAccess + ?Sized>(cpu: &mut C) -> Result<()> {
    let rip = vmread(cpu, guest::RIP)?;
    let len = vmread(cpu, ro::VMEXIT_INSTRUCTION_LEN)?;

    vmwrite(cpu, guest::RIP, rip + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::HypervisorError,
        vmx::{
            controls::{read_control, write_control_safe, PrimaryControls, VmxControl},
            sim::{Event, SimulatedProcessor},
        },
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use x86::{msr::IA32_SYSENTER_ESP, vmx::vmcs::control};

    fn exiting_processor(reason: u32) -> SimulatedProcessor {
        let mut cpu = SimulatedProcessor::new();
        cpu.enter_vmx_with_current_vmcs();
        cpu.simulate_exit(reason, 0x1000, 2);
        cpu
    }

    #[test]
    fn default_handlers_reach_their_handler() {
        let handlers = ExitHandlers::with_defaults();
        assert!(!handlers.contains(BasicExitReason::HLT));

        // cpuid(1)
        let mut cpu = exiting_processor(BasicExitReason::CPUID.0 as u32);
        let mut regs = GuestRegisters {
            rax: 1,
            ..Default::default()
        };
        assert_eq!(handlers.dispatch(&mut cpu, &mut regs).unwrap(), ExitType::IncrementRip);
        assert_eq!(regs.rcx as u32, cpu.cpuid(1, 0).ecx);
        assert_eq!(cpu.field(guest::RIP), Some(0x1002));

        // rdmsr(IA32_SYSENTER_ESP)
        let mut cpu = exiting_processor(BasicExitReason::RDMSR.0 as u32);
        cpu.set_msr(IA32_SYSENTER_ESP, 0x1122_3344_5566_7788);
        let mut regs = GuestRegisters {
            rcx: IA32_SYSENTER_ESP as u64,
            ..Default::default()
        };
        assert_eq!(handlers.dispatch(&mut cpu, &mut regs).unwrap(), ExitType::IncrementRip);
        assert_eq!((regs.rdx, regs.rax), (0x1122_3344, 0x5566_7788));
        assert!(!cpu.events().iter().any(|event| matches!(event, Event::WriteMsr(..))));

        // wrmsr(IA32_SYSENTER_ESP)
        let mut cpu = exiting_processor(BasicExitReason::WRMSR.0 as u32);
        let mut regs = GuestRegisters {
            rcx: IA32_SYSENTER_ESP as u64,
            rax: 0x5566_7788,
            rdx: 0x1122_3344,
            ..Default::default()
        };
        assert_eq!(handlers.dispatch(&mut cpu, &mut regs).unwrap(), ExitType::IncrementRip);
        assert_eq!(cpu.read_msr(IA32_SYSENTER_ESP), 0x1122_3344_5566_7788);
        assert_eq!(regs.rax, 0x5566_7788);

        // mov cr3, rbx
        let mut cpu = exiting_processor(BasicExitReason::MOV_CR.0 as u32);
        cpu.set_field(ro::EXIT_QUALIFICATION, 3 | 3 << 8);
        let mut regs = GuestRegisters {
            rbx: 0x1AB000,
            ..Default::default()
        };
        assert_eq!(handlers.dispatch(&mut cpu, &mut regs).unwrap(), ExitType::IncrementRip);
        assert_eq!(cpu.field(guest::CR3), Some(0x1AB000));

        // #PF with error code
        let mut cpu = exiting_processor(BasicExitReason::EXCEPTION_OR_NMI.0 as u32);
        cpu.set_field(ro::VMEXIT_INTERRUPTION_INFO, 0x8000_0B0E);
        cpu.set_field(ro::VMEXIT_INTERRUPTION_ERR_CODE, 0x2);
        let mut regs = GuestRegisters::default();
        assert_eq!(handlers.dispatch(&mut cpu, &mut regs).unwrap(), ExitType::Continue);
        assert_eq!(cpu.field(control::VMENTRY_INTERRUPTION_INFO_FIELD), Some(0x8000_0B0E));
        assert_eq!(cpu.field(guest::RIP), Some(0x1000));

        // NMI window
        let mut cpu = exiting_processor(BasicExitReason::NMI_WINDOW.0 as u32);
        write_control_safe(
            &mut cpu,
            VmxControl::ProcessorBased,
            PrimaryControls::NMI_WINDOW_EXITING.bits(),
        )
        .unwrap();
        let mut regs = GuestRegisters::default();
        assert_eq!(handlers.dispatch(&mut cpu, &mut regs).unwrap(), ExitType::Continue);
        assert_eq!(cpu.field(control::VMENTRY_INTERRUPTION_INFO_FIELD), Some(0x8000_0202));
        let primary = read_control(&cpu, VmxControl::ProcessorBased).unwrap();
        assert_eq!(primary & PrimaryControls::NMI_WINDOW_EXITING.bits(), 0);
    }

    #[test]
    fn exits_reach_only_their_handler() {
        static CPUID_CALLS: AtomicUsize = AtomicUsize::new(0);
        static MSR_CALLS: AtomicUsize = AtomicUsize::new(0);

        fn count_cpuid(_: &mut dyn Processor, _: &mut GuestRegisters) -> Result<ExitType> {
            CPUID_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(ExitType::IncrementRip)
        }

        fn count_msr(_: &mut dyn Processor, _: &mut GuestRegisters) -> Result<ExitType> {
            MSR_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(ExitType::Continue)
        }

        let mut handlers = ExitHandlers::empty();
        handlers.insert(BasicExitReason::CPUID, count_cpuid);
        handlers.insert(BasicExitReason::RDMSR, count_msr);

        let mut cpu = exiting_processor(10);
        let exit_type = handlers
            .dispatch(&mut cpu, &mut GuestRegisters::default())
            .unwrap();

        assert_eq!(exit_type, ExitType::IncrementRip);
        assert_eq!(CPUID_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(MSR_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(cpu.field(guest::RIP), Some(0x1002));

        let mut cpu = exiting_processor(31);
        let exit_type = handlers
            .dispatch(&mut cpu, &mut GuestRegisters::default())
            .unwrap();

        assert_eq!(exit_type, ExitType::Continue);
        assert_eq!(CPUID_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(MSR_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(cpu.field(guest::RIP), Some(0x1000));
    }

    #[test]
    fn unknown_reason_is_fatal() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn count(_: &mut dyn Processor, _: &mut GuestRegisters) -> Result<ExitType> {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(ExitType::IncrementRip)
        }

        let mut handlers = ExitHandlers::empty();
        handlers.insert(BasicExitReason::CPUID, count);
        handlers.insert(BasicExitReason::RDMSR, count);

        let mut cpu = exiting_processor(12);
        let result = handlers.dispatch(&mut cpu, &mut GuestRegisters::default());

        assert!(matches!(
            result,
            Err(HypervisorError::UnhandledVmExit { reason: 12, rip: 0x1000 })
        ));
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(cpu.field(guest::RIP), Some(0x1000));
    }

    #[test]
    fn failed_entries_are_fatal() {
        let handlers = ExitHandlers::with_defaults();
        let mut cpu = exiting_processor((1 << 31) | 33);

        let result = handlers.dispatch(&mut cpu, &mut GuestRegisters::default());
        assert!(matches!(result, Err(HypervisorError::VmEntryFailure { .. })));
    }

    #[test]
    fn insert_reports_replaced_handlers() {
        fn ignore(_: &mut dyn Processor, _: &mut GuestRegisters) -> Result<ExitType> {
            Ok(ExitType::Continue)
        }

        let mut handlers = ExitHandlers::with_defaults();

        assert!(handlers.insert(BasicExitReason::CPUID, ignore).is_some());
        assert!(handlers.insert(BasicExitReason::HLT, ignore).is_none());
        assert!(handlers.contains(BasicExitReason::HLT));
    }

    #[test]
    fn debug_names_known_reasons() {
        assert_eq!(format!("{:?}", BasicExitReason::NMI_WINDOW), "NMI_WINDOW");
        assert_eq!(format!("{:?}", BasicExitReason(63)), "BasicExitReason(63)");
    }
}
