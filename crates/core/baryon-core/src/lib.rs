//! Core types and primitives for the Baryon kernel.
//!
//! This crate contains the host-testable leaves every other kernel crate
//! depends on: 32-bit physical/virtual address types, the POSIX errno
//! set, the logging macros, and the spin-based synchronization
//! primitives.
//!
//! By living outside the kernel crate, these types can be tested with
//! `cargo test` on the host without a bare-metal target.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod errno;
pub mod id;
pub mod log;
pub mod sync;

pub use errno::{Errno, Result};
pub use log::LogLevel;
