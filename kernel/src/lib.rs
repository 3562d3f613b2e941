//! Ferrite kernel library
//!
//! Core of a small monolithic Unix-like kernel for 32-bit x86: physical
//! and virtual memory management, a preemptive round-robin scheduler, a
//! POSIX-shaped process model and system-call surface, a trait-based VFS,
//! and an ext2-family on-disk driver.
//!
//! The library builds for two kinds of targets:
//! - bare metal (`target_os = "none"`, i386): the real kernel, with the
//!   hole allocator as `#[global_allocator]` and hardware access through
//!   [`arch`].
//! - the host: the portable core compiles against `std` with the system
//!   allocator so the unit tests run under the standard `#[test]` harness
//!   against in-memory mock devices.

#![no_std]
#![allow(clippy::manual_div_ceil, clippy::result_unit_err)]

extern crate alloc;

// Host target: link std and use the system allocator so test code can
// allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: the kernel heap (mm::heap) is the global allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_ALLOCATOR: mm::heap::GlobalHeap = mm::heap::GlobalHeap;

#[macro_use]
pub mod print;

#[cfg(test)]
mod integration_tests;

pub mod arch;
pub mod elf;
pub mod error;
pub mod fs;
pub mod klog;
pub mod mm;
pub mod multiboot;
pub mod process;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod time;
pub mod util;

// Re-exports for the boot path and tests
pub use error::Errno;
pub use mm::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use task::Pid;
