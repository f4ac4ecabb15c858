//! Memory management for the Baryon kernel.
//!
//! Four layers, leaves first: [`frame`] owns the physical frame table
//! (free list, reservation map, file-page hash), [`buddy`] carves
//! sub-page blocks out of whole frames, [`paging`] defines the i386
//! two-level table entries, and [`mapper`] installs per-process mappings
//! on top of both (demand allocation, copy-on-write). [`vma`] tracks the
//! per-process virtual regions and [`fault`] classifies page-fault error
//! codes against them.
//!
//! Everything here is pure logic over caller-provided storage, so the
//! whole crate builds and tests on the host.

#![cfg_attr(not(test), no_std)]

pub mod buddy;
pub mod fault;
pub mod frame;
pub mod mapper;
pub mod paging;
pub mod vma;

pub use frame::{Frame, FrameFlags, FrameIdx, FrameTable, PageTag};
pub use vma::{Prot, Section, Share, Vma, VmaTable};
