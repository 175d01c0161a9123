//! Diagnostics for the interpreter process. Never used from a forked child.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;

static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn log_debug(args: fmt::Arguments<'_>) {
    if debug_enabled() {
        eprintln!("{} {}", "DEBUG:".dimmed(), args);
    }
}

pub fn error(msg: impl fmt::Display) {
    eprintln!("{} {}", "pipesh:".red().bold(), msg);
}

macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::diag::log_debug(format_args!($($arg)*))
    };
}

pub(crate) use debug;
