use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Arguments;
use std::panic::{set_hook, Location, PanicHookInfo};

pub use log::{max_level as get_max_level, set_max_level, Level, LevelFilter};

#[cfg(feature = "logger")]
mod logger;
mod macros;

macro_rules! get_thread_name {
	($var:ident) => {
		let thread = ::std::thread::current();
		let $var = thread.name().unwrap_or("<unnamed>");
	};
}

/// Prints the current thread's backtrace to the configured logger, at error
/// level.
pub fn print_backtrace() {
	get_thread_name!(thread_name);

	let backtrace = Backtrace::capture();

	log::log!(target: thread_name, Level::Error, "{:?}", backtrace);
}

#[track_caller]
pub fn print_panic(location: Option<&Location<'_>>, fmt: Arguments<'_>) {
	get_thread_name!(thread_name);

	let location = location.unwrap_or_else(Location::caller);

	log::log!(
		target: thread_name,
		Level::Error,
		"Panic occurred at {}:\n>> {}",
		location,
		fmt
	);

	let backtrace = Backtrace::capture();

	if backtrace.status() == BacktraceStatus::Captured {
		log::log!(target: thread_name, Level::Error, "\nBack trace:\n{}", backtrace);
	} else {
		log::log!(
			target: thread_name,
			Level::Error,
			"note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace"
		);
	}
}

/// Installs a panic hook that routes panic messages through the `log`
/// facade instead of stderr directly, so they share formatting with the
/// rest of the scheduler's diagnostics.
pub fn install_panic_hook() {
	#[track_caller]
	fn hook(info: &PanicHookInfo<'_>) {
		let msg = match info.payload().downcast_ref::<&'static str>() {
			Some(s) => *s,
			None => match info.payload().downcast_ref::<String>() {
				Some(s) => &s[..],
				None => "Box<dyn Any>"
			}
		};

		print_panic(info.location(), format_args!("{}", msg));
	}

	set_hook(Box::new(hook));
}
