//! Kernel logger
//!
//! Installs a [`log`] facade backend that writes through the kernel
//! console: the serial port on bare metal, stderr on the host. Installed
//! once during boot (or lazily by tests); repeated init calls are
//! harmless.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Safe to call more than once.
pub fn init() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise or lower the global log filter.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
