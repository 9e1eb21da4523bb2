use crate::{
    error::{AlreadyVirtualizedSnafu, MisalignedRegionSnafu, Result, VmxInstructionSnafu},
    vmx::{
        cpu::{physical_address, ControlRegister, Processor},
        data::{
            guest::GuestRegisters,
            msr_bitmap::MsrIntercepts,
            vcpu_data::{VcpuData, STACK_MARKER},
        },
        host,
        support::{self, FeatureControl, FeatureControlState},
        vmcs,
        vmexit::{ExitHandlers, ExitType},
        vmlaunch,
    },
};
use alloc::boxed::Box;
use core::{marker::PhantomPinned, mem::ManuallyDrop, pin::Pin};
use snafu::ensure;
use x86::{
    bits64::paging::BASE_PAGE_SIZE,
    msr::{IA32_FEATURE_CONTROL, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1},
};

const CR4_VMXE: u64 = 1 << 13;

/// How far the bring-up got. Each stage implies all previous ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Off,
    /// CR0/CR4 are adjusted for VMX operation.
    VmxEnabled,
    /// VMXON succeeded.
    VmxOn,
    /// The VMCS is current on this processor.
    VmcsLoaded,
    /// The processor runs the guest.
    Launched,
}

/// A virtual processor. There is exactly one for every logical processor.
///
/// The host stack stores the address of the vcpu for the VM-exit entry point,
/// so it has to be pinned for as long as it runs the guest.
pub struct Vcpu {
    index: u32,
    stage: Stage,

    /// CR0 and CR4 before they were adjusted for VMX operation.
    saved_cr0: u64,
    saved_cr4: u64,

    /// Leaked instead of freed while the guest runs, see [`Drop`].
    data: ManuallyDrop<Box<VcpuData>>,
    handlers: ExitHandlers,
    msr_intercepts: MsrIntercepts,

    _pinned: PhantomPinned,
}

impl Vcpu {
    pub fn new(index: u32) -> Self {
        Self::with_handlers(index, ExitHandlers::with_defaults(), MsrIntercepts::default())
    }

    pub fn with_handlers(index: u32, handlers: ExitHandlers, msr_intercepts: MsrIntercepts) -> Self {
        log::trace!("Creating processor {}", index);

        Self {
            index,
            stage: Stage::Off,
            saved_cr0: 0,
            saved_cr4: 0,
            data: ManuallyDrop::new(VcpuData::new()),
            handlers,
            msr_intercepts,
            _pinned: PhantomPinned,
        }
    }

    pub fn id(&self) -> u32 {
        self.index
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn data(&self) -> &VcpuData {
        &self.data
    }

    pub fn handlers(&self) -> &ExitHandlers {
        &self.handlers
    }

    /// Virtualizes the processor the caller runs on, which must be the one
    /// this vcpu belongs to for the whole call.
    ///
    /// On success the caller continues as the guest. On failure every step
    /// that was already done is undone before the error is returned.
    pub fn virtualize<P: Processor + ?Sized>(self: Pin<&mut Self>, cpu: &mut P) -> Result<()> {
        // Nothing is moved out of the vcpu.
        //
        let this = unsafe { self.get_unchecked_mut() };
        this.virtualize_pinned(cpu)
    }

    fn virtualize_pinned<P: Processor + ?Sized>(&mut self, cpu: &mut P) -> Result<()> {
        ensure!(self.stage == Stage::Off, AlreadyVirtualizedSnafu { index: self.index });

        log::info!("Virtualizing processor {}", self.index);

        let feature_control = support::check(cpu)?;

        if let Err(error) = self.bring_up(cpu, feature_control) {
            log::error!(
                "Failed to virtualize processor {} at stage {:?}: {}",
                self.index,
                self.stage,
                error
            );
            self.teardown(cpu);

            return Err(error);
        }

        Ok(())
    }

    fn bring_up<P: Processor + ?Sized>(
        &mut self, cpu: &mut P, feature_control: FeatureControlState,
    ) -> Result<()> {
        self.enable_vmx_operation(cpu, feature_control);
        log::info!("Enabled VMX operation");

        self.enter_vmx_operation(cpu)?;
        log::info!("Entered VMX operation");

        self.set_vmcs_pointer(cpu)?;
        log::info!("Set the VMCS pointer");

        self.prepare_host_stack(cpu);
        log::info!("Prepared the host structures");

        vmcs::write_control_fields(cpu, &self.data)?;
        vmcs::write_host_fields(cpu, &self.data)?;
        vmcs::write_guest_fields(cpu)?;
        log::info!("Wrote the VMCS fields");

        vmlaunch::launch(cpu)?;

        // From here on this is the guest.
        //
        self.stage = Stage::Launched;
        log::info!("Virtualized processor {}", self.index);

        Ok(())
    }

    /// Prepares CR0, CR4 and `IA32_FEATURE_CONTROL` for VMXON.
    ///
    /// See `24.8 RESTRICTIONS ON VMX OPERATION` in the Intel SDM.
    pub fn enable_vmx_operation<P: Processor + ?Sized>(
        &mut self, cpu: &mut P, feature_control: FeatureControlState,
    ) {
        cpu.disable_interrupts();

        if feature_control == FeatureControlState::Unlocked {
            log::info!("Locking IA32_FEATURE_CONTROL with VMX enabled");

            let value = cpu.read_msr(IA32_FEATURE_CONTROL)
                | (FeatureControl::LOCKED | FeatureControl::VMX_OUTSIDE_SMX).bits();
            cpu.write_msr(IA32_FEATURE_CONTROL, value);
        }

        self.saved_cr0 = cpu.read_cr(ControlRegister::Cr0);
        self.saved_cr4 = cpu.read_cr(ControlRegister::Cr4);

        let cr0 = (self.saved_cr0 | cpu.read_msr(IA32_VMX_CR0_FIXED0)) & cpu.read_msr(IA32_VMX_CR0_FIXED1);
        let cr4 = (self.saved_cr4 | CR4_VMXE | cpu.read_msr(IA32_VMX_CR4_FIXED0))
            & cpu.read_msr(IA32_VMX_CR4_FIXED1);

        cpu.write_cr(ControlRegister::Cr0, cr0);
        cpu.write_cr(ControlRegister::Cr4, cr4);
        self.stage = Stage::VmxEnabled;

        cpu.enable_interrupts();
    }

    /// Executes VMXON followed by a global INVEPT.
    pub fn enter_vmx_operation<P: Processor + ?Sized>(&mut self, cpu: &mut P) -> Result<()> {
        self.data
            .vmxon_region
            .set_revision_id(support::vmcs_revision_id(cpu));

        let vmxon_pa = Self::region_address(cpu, "VMXON", &self.data.vmxon_region as *const _ as u64)?;
        cpu.vmxon(vmxon_pa)
            .map_err(|fail| VmxInstructionSnafu { instruction: "VMXON", fail }.build())?;
        self.stage = Stage::VmxOn;

        // Stale EPT translations from earlier VMX operation must not be used.
        //
        cpu.invept_all_contexts()
            .map_err(|fail| VmxInstructionSnafu { instruction: "INVEPT", fail }.build())
    }

    /// Makes the vcpu's VMCS the current VMCS. Calling this again on the
    /// current VMCS is harmless.
    pub fn set_vmcs_pointer<P: Processor + ?Sized>(&mut self, cpu: &mut P) -> Result<()> {
        self.data
            .vmcs_region
            .set_revision_id(support::vmcs_revision_id(cpu));

        let vmcs_pa = Self::region_address(cpu, "VMCS", &self.data.vmcs_region as *const _ as u64)?;

        cpu.vmclear(vmcs_pa)
            .map_err(|fail| VmxInstructionSnafu { instruction: "VMCLEAR", fail }.build())?;
        cpu.vmptrld(vmcs_pa)
            .map_err(|fail| VmxInstructionSnafu { instruction: "VMPTRLD", fail }.build())?;
        self.stage = Stage::VmcsLoaded;

        Ok(())
    }

    /// Initializes everything the VMCS points to and the host stack.
    pub fn prepare_external_structures<P: Processor + ?Sized>(self: Pin<&mut Self>, cpu: &P) {
        unsafe { self.get_unchecked_mut() }.prepare_host_stack(cpu);
    }

    /// Only called on a pinned vcpu, the host stack keeps its address.
    fn prepare_host_stack<P: Processor + ?Sized>(&mut self, cpu: &P) {
        host::prepare_external_structures(cpu, &mut self.data);

        if !self.msr_intercepts.is_empty() {
            log::info!("Intercepting msrs: {:x?}", self.msr_intercepts);
            self.msr_intercepts.apply(&mut self.data.msr_bitmap);
        }

        // The exit handler finds its vcpu above the host stack pointer.
        //
        self.data.host_stack_layout.vcpu = self as *mut Self as u64;
        self.data.host_stack_layout.reserved = STACK_MARKER;
    }

    /// Undoes the bring-up steps that were done, in reverse order.
    ///
    /// Nothing can be undone from the host once the guest runs.
    pub fn teardown<P: Processor + ?Sized>(&mut self, cpu: &mut P) {
        if self.stage == Stage::Launched {
            log::warn!("Processor {} runs the guest and can not be torn down", self.index);
            return;
        }

        if self.stage >= Stage::VmcsLoaded {
            match physical_address(cpu, &self.data.vmcs_region as *const _ as u64) {
                Ok(vmcs_pa) => {
                    if let Err(fail) = cpu.vmclear(vmcs_pa) {
                        log::error!("VMCLEAR failed during teardown: {:?}", fail);
                    }
                }
                Err(error) => log::error!("{}", error),
            }
        }

        if self.stage >= Stage::VmxOn {
            if let Err(fail) = cpu.vmxoff() {
                log::error!("VMXOFF failed during teardown: {:?}", fail);
            }
        }

        if self.stage >= Stage::VmxEnabled {
            cpu.disable_interrupts();
            cpu.write_cr(ControlRegister::Cr4, self.saved_cr4);
            cpu.write_cr(ControlRegister::Cr0, self.saved_cr0);
            cpu.enable_interrupts();
        }

        log::info!("Tore down processor {} from stage {:?}", self.index, self.stage);
        self.stage = Stage::Off;
    }

    /// Handles a VM-exit of this vcpu.
    pub fn handle_vm_exit(&self, cpu: &mut dyn Processor, guest_regs: &mut GuestRegisters) -> Result<ExitType> {
        self.handlers.dispatch(cpu, guest_regs)
    }

    fn region_address<P: Processor + ?Sized>(cpu: &P, region: &'static str, address: u64) -> Result<u64> {
        let pa = physical_address(cpu, address)?;

        if pa % BASE_PAGE_SIZE as u64 != 0 {
            log::error!("{} region at {:#x} is not page aligned", region, pa);
            return MisalignedRegionSnafu { region, address: pa }.fail();
        }

        Ok(pa)
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        if self.stage == Stage::Launched {
            // The processor still uses the VMCS, the host stack and the host
            // descriptor tables.
            //
            log::error!("Processor {} still runs the guest, leaking its host structures", self.index);
            let _ = Box::leak(unsafe { ManuallyDrop::take(&mut self.data) });
        } else {
            unsafe { ManuallyDrop::drop(&mut self.data) };
        }
    }
}
