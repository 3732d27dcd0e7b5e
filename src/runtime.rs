use std::fmt::Arguments;

use crate::log::print_panic;

/// Prints a panic-style message and aborts the process without unwinding.
///
/// Used at points where unwinding would have to cross a raw fiber context
/// switch, which this crate's `fiber` module cannot support (see
/// `fiber::Fiber::switch`'s safety contract) — a violated precondition there
/// is not recoverable.
pub fn panic_nounwind(fmt: Arguments<'_>) -> ! {
	print_panic(None, fmt);

	log::log!(log::Level::Error, "Non unwinding panic, aborting");

	std::process::abort();
}
