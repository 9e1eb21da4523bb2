use crate::{
    utils::processor::ProcessorExecutor,
    vmx::{
        data::msr_bitmap::MsrIntercepts,
        vcpu::{Stage, Vcpu},
        vmexit::{BasicExitReason, ExitHandlers, VmExitHandler},
    },
};
use alloc::{boxed::Box, vec::Vec};
use core::pin::Pin;

pub mod controls;
pub mod cpu;
pub mod data;
pub mod events;
pub mod host;
pub mod instruction_error;
pub mod interrupt;
pub mod segmentation;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmexit;
pub mod vmlaunch;

#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod intel;

#[cfg(test)]
pub mod sim;

#[derive(Default)]
pub struct HypervisorBuilder {
    handlers: ExitHandlers,
    msr_intercepts: MsrIntercepts,
}

impl HypervisorBuilder {
    /// Adds the specified handler.
    ///
    /// Note: If a handler is already registered for the specified reason, it
    /// will be replaced.
    #[must_use]
    pub fn with_handler(mut self, reason: BasicExitReason, handler: VmExitHandler) -> Self {
        self.handlers.insert(reason, handler);
        self
    }

    /// Adds multiple handlers at once.
    #[must_use]
    pub fn with_handlers<const N: usize>(self, handlers: [(BasicExitReason, VmExitHandler); N]) -> Self {
        let mut instance = self;

        for (reason, handler) in handlers {
            instance = instance.with_handler(reason, handler)
        }

        instance
    }

    /// Makes `rdmsr` of `msr` exit to the `RDMSR` handler.
    #[must_use]
    pub fn intercept_rdmsr(mut self, msr: u32) -> Self {
        self.msr_intercepts.rdmsr.push(msr);
        self
    }

    /// Makes `wrmsr` of `msr` exit to the `WRMSR` handler.
    #[must_use]
    pub fn intercept_wrmsr(mut self, msr: u32) -> Self {
        self.msr_intercepts.wrmsr.push(msr);
        self
    }

    #[must_use]
    pub fn intercept_msr(self, msr: u32) -> Self {
        self.intercept_rdmsr(msr).intercept_wrmsr(msr)
    }

    pub fn build<E: ProcessorExecutor>(self, executor: &mut E) -> Option<Hypervisor> {
        if !executor.run_on(0, |cpu| support::is_vmx_supported(&*cpu))? {
            log::error!("VMX is not supported");
            return None;
        }

        let processors = (0..executor.processor_count())
            .map(|index| Box::pin(Vcpu::with_handlers(index, self.handlers.clone(), self.msr_intercepts.clone())))
            .collect::<Vec<_>>();
        log::info!("Found {} processors", processors.len());

        Some(Hypervisor { processors })
    }
}

pub struct Hypervisor {
    /// Pinned, the host stacks point to them.
    processors: Vec<Pin<Box<Vcpu>>>,
}

impl Hypervisor {
    pub fn builder() -> HypervisorBuilder {
        HypervisorBuilder::default()
    }

    /// Virtualizes every processor, one after another.
    ///
    /// Stops at the first processor that fails. That processor is torn down
    /// again, the ones before it keep running as guests.
    pub fn virtualize<E: ProcessorExecutor>(&mut self, executor: &mut E) -> bool {
        log::info!("Virtualizing processors");

        for processor in self.processors.iter_mut() {
            let index = processor.id();

            let Some(result) = executor.run_on(index, |cpu| processor.as_mut().virtualize(cpu)) else {
                log::error!("Failed to switch to processor {}", index);
                return false;
            };

            if let Err(error) = result {
                log::error!("Failed to virtualize processor {}: {}", index, error);
                return false;
            }
        }

        true
    }

    pub fn processors(&self) -> &[Pin<Box<Vcpu>>] {
        &self.processors
    }
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        for processor in self.processors.drain(..) {
            // The VM-exit entry point of that processor still uses it.
            //
            if processor.stage() == Stage::Launched {
                core::mem::forget(processor);
            }
        }
    }
}
