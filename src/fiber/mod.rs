#![allow(unreachable_pub, clippy::multiple_unsafe_ops_per_block)]

use crate::assert_unsafe_precondition;

mod stack;
pub use stack::Stack;

#[cfg(target_arch = "x86_64")]
mod x64;
#[cfg(target_arch = "aarch64")]
mod arm64;

mod platform {
	#[cfg(target_arch = "x86_64")]
	pub(super) use super::x64::*;
	#[cfg(target_arch = "aarch64")]
	pub(super) use super::arm64::*;
}

use platform::*;

/// The arguments a fiber's entry point is started with.
///
/// # Safety
/// The stack isn't in use before a fiber is first switched to, so it's safe
/// to stash the start arguments there ahead of time.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Start {
	start: unsafe fn(*const ()),
	arg: *const ()
}

impl Start {
	/// # Safety
	/// see `set_start`
	#[must_use]
	pub const unsafe fn new(start: unsafe fn(*const ()), arg: *const ()) -> Self {
		Self { start, arg }
	}

	/// # Safety
	/// `start` must never panic (there is no unwinding across a raw fiber
	/// switch) and must exit the fiber rather than returning. Called exactly
	/// once, the first time the fiber is switched to.
	pub unsafe fn set_start(&mut self, start: unsafe fn(*const ())) {
		self.start = start;
	}

	pub fn set_arg(&mut self, arg: *const ()) {
		self.arg = arg;
	}
}

/// A suspendable execution context: an owned, guarded stack plus the
/// callee-saved register state needed to resume it where it left off.
///
/// A `Fiber` is a cooperative primitive: only one OS thread at a time may be
/// running it, and switching away from it suspends execution exactly at the
/// point of the switch, to be resumed by a later switch back.
#[repr(C)]
pub struct Fiber {
	context: Context,
	stack: Stack
}

impl Fiber {
	/// A placeholder standing in for the OS thread's own stack: never
	/// started, only ever used as the source or destination of a `switch`.
	#[must_use]
	pub fn main() -> Self {
		Self { context: Context::new(), stack: Stack::none() }
	}

	#[allow(clippy::expect_used)]
	#[must_use]
	/// # Panics
	/// if the guarded stack allocation fails
	pub fn new(stack_size: usize) -> Self {
		let stack = Stack::allocate(stack_size).expect("failed to allocate a guarded fiber stack");

		Self {
			/* stores the registers that must survive across a switch; zeroed
			 * until `set_start` runs */
			context: Context::new(),
			stack
		}
	}

	/// Set the entry point of the fiber, rewinding its stack to the top.
	///
	/// # Safety
	/// the fiber must not be running
	pub unsafe fn set_start(&mut self, start: Start) {
		/* Safety: contract upheld by caller; the fiber isn't running, so
		 * resetting its stack and context is sound */
		unsafe {
			self.context.set_stack(self.stack.addr(), self.stack.usable_len());
			self.context.set_start(start);
		}
	}

	/// Switch from the fiber `this` to the fiber `to`.
	///
	/// # Safety
	/// `this` must be the fiber currently running on the calling thread
	pub unsafe fn switch(this: *mut Self, to: *mut Self) {
		/* Safety: guaranteed by caller */
		unsafe { assert_unsafe_precondition!(!this.is_null() && !to.is_null()) };

		/* all registers not explicitly preserved in `Context` must be
		 * declared clobbered in the arch-specific `switch` wrapper; it's
		 * faster to let the compiler save only the registers it knows it's
		 * using across the call than to have the hand-written routine save
		 * everything unconditionally */

		/* Safety: guaranteed by caller */
		unsafe { platform::switch(&mut (*this).context, &mut (*to).context) };
	}
}

/* Safety: the stack is owned exclusively by the fiber; only one thread runs
 * a given fiber at a time */
unsafe impl Send for Fiber {}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	static RAN: AtomicBool = AtomicBool::new(false);

	struct Args {
		main: *mut Fiber,
		worker: *mut Fiber
	}

	unsafe fn entry(arg: *const ()) {
		/* Safety: the test below keeps `Args` alive on its own stack for as
		 * long as `worker` is parked here */
		let args = unsafe { &*arg.cast::<Args>() };

		RAN.store(true, Ordering::Relaxed);

		/* Safety: `worker` is the fiber currently running; `main` is parked
		 * at the switch below, waiting to be resumed */
		unsafe { Fiber::switch(args.worker, args.main) };
		unreachable!("a fiber must not return from its entry point");
	}

	#[test]
	fn switches_into_a_new_fiber_and_back() {
		RAN.store(false, Ordering::Relaxed);

		let mut main = Fiber::main();
		let main_ptr: *mut Fiber = &mut main;

		let mut worker = Fiber::new(64 * 1024);
		let worker_ptr: *mut Fiber = &mut worker;

		let args = Args { main: main_ptr, worker: worker_ptr };
		let args_ptr: *const Args = &args;

		/* Safety: `worker` was never started */
		unsafe { worker.set_start(Start::new(entry, args_ptr.cast())) };

		/* Safety: `main` represents the currently running thread */
		unsafe { Fiber::switch(main_ptr, worker_ptr) };

		assert!(RAN.load(Ordering::Relaxed));
	}
}
