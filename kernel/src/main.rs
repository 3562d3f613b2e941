//! Ferrite kernel binary
//!
//! Bare-metal entry point: the Multiboot loader drops us here in
//! protected mode with paging off. Bring up the console and CPU
//! tables, size memory from the boot info, start paging, the heap, the
//! scheduler, and the VFS, then hand the CPU to the bootstrap task.
//!
//! On a host target this binary is only a stub; the kernel library and
//! its tests are the buildable artifact there.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_main {
    use ferrite_kernel::fs::ext2::mkfs::{self, MkfsOptions};
    use ferrite_kernel::fs::{self, MountFlags, RamDisk};
    use ferrite_kernel::{arch, klog, mm, multiboot, process, task};

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        ferrite_kernel::println!("kernel panic: {}", info);
        arch::disable_interrupts();
        arch::halt();
    }

    #[no_mangle]
    pub extern "C" fn kmain(loader_magic: u32, info_addr: u32) -> ! {
        arch::x86::init();
        klog::init();
        ferrite_kernel::println!(
            "Ferrite {} booting",
            env!("CARGO_PKG_VERSION")
        );

        if loader_magic != multiboot::MULTIBOOT_LOADER_MAGIC {
            panic!("not loaded by a multiboot loader: {:#x}", loader_magic);
        }
        let info = unsafe { multiboot::boot_info(info_addr) };
        let mem_upper = info.upper_kib().expect("loader did not report memory");

        mm::init(mem_upper).expect("memory initialization failed");
        let boot_dir = mm::paging::current();
        task::sched::init(boot_dir);
        process::init();

        fs::init();
        // Until the ATA collaborator attaches a real disk, the root is
        // a formatted ramdisk.
        let root = RamDisk::new("ram0", 512, 16384);
        mkfs::format(&*root, MkfsOptions::default()).expect("mkfs failed");
        fs::blockdev::register_disk("ram0", root.clone()).ok();
        fs::mount("ext2", "/", Some(root), MountFlags::empty(), "")
            .expect("mounting root failed");
        ferrite_kernel::println!("root filesystem mounted");

        arch::enable_interrupts();
        ferrite_kernel::println!("entering idle loop");
        loop {
            task::sched::relax();
            arch::x86::idle_wait();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!(
        "ferrite-kernel {}: bare-metal image; build for the i386 target to boot it",
        env!("CARGO_PKG_VERSION")
    );
}
