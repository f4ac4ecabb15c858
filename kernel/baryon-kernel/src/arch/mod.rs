//! Architecture support. Only i386 exists.

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(target_arch = "x86")]
pub use x86::{
    fork_address_space, machine_restart, protect_user_range, restore_sigcontext, switch,
    unmap_user_range,
};
