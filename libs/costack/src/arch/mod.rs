cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::{init_stack, swap_raw};
        pub use x86_64::STACK_ALIGNMENT;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::{init_stack, swap_raw};
        pub use aarch64::STACK_ALIGNMENT;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub(crate) use riscv64::{init_stack, swap_raw};
        pub use riscv64::STACK_ALIGNMENT;
    } else {
        compile_error!("costack does not support this target architecture");
    }
}
