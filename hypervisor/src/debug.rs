/// Breaks into the attached debugger in debug builds.
///
/// Release builds and unit tests skip the breakpoint, since nothing would
/// catch it there.
#[macro_export]
macro_rules! dbg_break {
    () => {
        #[cfg(all(target_arch = "x86_64", debug_assertions, not(test)))]
        {
            #[allow(unused_unsafe)]
            unsafe {
                core::arch::asm!("int 3")
            };
        }
    };
}
