//! Running code on a specific logical processor.

use crate::vmx::cpu::Processor;

/// Executes closures pinned to one logical processor at a time.
///
/// The host platform decides how a thread gets moved to a processor and what
/// the processor count is. Implementations must keep the closure on processor
/// `index` until it returns.
pub trait ProcessorExecutor {
    type Processor: Processor;

    fn processor_count(&self) -> u32;

    /// Runs `f` on processor `index`. Returns `None` if the executor could not
    /// switch to that processor.
    fn run_on<R>(&mut self, index: u32, f: impl FnOnce(&mut Self::Processor) -> R) -> Option<R>;
}
