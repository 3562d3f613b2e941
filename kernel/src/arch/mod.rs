//! Architecture layer
//!
//! Everything that touches hardware lives here. The portable core calls
//! through the free functions below; on the host they are no-ops (or
//! backed by std), so the rest of the kernel is testable off-target.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{
    console_write, disable_interrupts, enable_interrupts, halt, invlpg, load_page_dir,
};

// Host stubs: interrupts and the TLB do not exist; the console is std.

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn enable_interrupts() {}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn disable_interrupts() {}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn halt() -> ! {
    #[cfg(not(target_os = "none"))]
    std::process::exit(0);
    #[cfg(target_os = "none")]
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn invlpg(_vaddr: u32) {}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn load_page_dir(_paddr: u32) {}
