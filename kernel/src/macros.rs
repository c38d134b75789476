//! Utility macros.

use core::fmt;

/// Prints to the kernel console (UART0).
///
/// Equivalent to the [`kprintln!`] macro except that a newline is not printed
/// at the end of the message.
#[macro_export]
macro_rules! kprint {
    () => ($crate::macros::_print_timestamp());
    ($($arg:tt)*) => ({
        $crate::macros::_print_timestamp();
        $crate::macros::_print(format_args!($($arg)*));
    });
}

/// Prints to the kernel console (UART0) with a newline (`\n`).
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)+) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// Prints and returns the value of a given expression for quick and dirty
/// debugging.
#[macro_export]
macro_rules! kdbg {
    () => {
        $crate::kprintln!("[{}:{}]", core::file!(), core::line!())
    };
    ($val:expr $(,)?) => {
        match $val {
            tmp => {
                $crate::kprintln!("[{}:{}] {} = {:#?}",
                    core::file!(), core::line!(), core::stringify!($val), &tmp);
                tmp
            }
        }
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    crate::drivers::ns8250::console().write_fmt(args).unwrap();
}

#[doc(hidden)]
pub fn _print_timestamp() {
    use crate::config::TIMER_FREQ;
    use riscv::registers::Time;

    let cy = Time::read();
    let sec = cy / TIMER_FREQ;
    let subsec = (cy % TIMER_FREQ) / 10;

    _print(format_args!("[{sec:5}.{subsec:06}] "));
}
