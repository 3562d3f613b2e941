// Print macros for kernel output

/// Print to the kernel console (serial port on bare metal, stdout on the
/// host).
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(target_os = "none")]
pub fn _print(args: core::fmt::Arguments) {
    crate::arch::console_write(args);
}

#[cfg(not(target_os = "none"))]
pub fn _print(args: core::fmt::Arguments) {
    use std::io::Write;
    let _ = std::io::stdout().write_fmt(args);
}
