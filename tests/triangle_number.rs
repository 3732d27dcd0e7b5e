//! Scenario A: sum every integer in `1..=47_593_243` by partitioning the
//! range into 10_000-sized subsets, one task per subset, and folding the
//! per-subset partial sums back together once every task has reported in.

use std::sync::Mutex;

use fiberflow::counter::TaskCounter;
use fiberflow::scheduler::Task;
use fiberflow::{Options, Scheduler};

const UPPER_BOUND: u64 = 47_593_243;
const CHUNK_SIZE: u64 = 10_000;
const EXPECTED: u64 = UPPER_BOUND * (UPPER_BOUND + 1) / 2;

struct Subtotal {
	start: u64,
	end: u64,
	partials: &'static Mutex<Vec<u64>>
}

fn sum_chunk(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` is a live `*const Subtotal` leaked by the test below, run
	 * exactly once by the worker that pops it */
	let boxed = unsafe { Box::from_raw(arg.cast::<Subtotal>().cast_mut()) };
	let sum: u64 = (boxed.start..boxed.end).sum();

	boxed.partials.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(sum);
}

#[test]
fn sums_to_the_closed_form_triangle_number() {
	let partials: &'static Mutex<Vec<u64>> = Box::leak(Box::new(Mutex::new(Vec::new())));
	let options = Options { thread_pool_size: 4, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		let counter = TaskCounter::new(scheduler, 0);
		let mut tasks = Vec::new();
		let mut start = 1_u64;

		while start <= UPPER_BOUND {
			let end = (start + CHUNK_SIZE).min(UPPER_BOUND + 1);
			let boxed = Box::new(Subtotal { start, end, partials });
			let arg = Box::into_raw(boxed).cast_const().cast::<()>();

			tasks.push(Task::new(sum_chunk, arg));
			start = end;
		}

		scheduler.add_tasks(&tasks, Some(&counter));
		scheduler.wait_for_counter(&counter, 0, false);
	})
	.unwrap();

	let total: u64 = partials
		.lock()
		.unwrap_or_else(std::sync::PoisonError::into_inner)
		.drain(..)
		.sum();

	assert_eq!(total, EXPECTED);
	assert_eq!(EXPECTED, 1_132_558_180_418_146);
}
