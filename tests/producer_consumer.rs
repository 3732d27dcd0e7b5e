//! Scenario B: 100 producer tasks each submit 10_000 consumer tasks against
//! their own counter; every consumer increments one shared atomic. The
//! producers' own counter is what `main` waits on, so it only returns once
//! every consumer (not just every producer) has run.

use std::sync::atomic::{AtomicU32, Ordering};

use fiberflow::counter::TaskCounter;
use fiberflow::scheduler::Task;
use fiberflow::{Options, Scheduler};

const NUM_PRODUCERS: u32 = 100;
const CONSUMERS_PER_PRODUCER: u32 = 10_000;

struct ProducerArgs {
	total: &'static AtomicU32
}

fn consume(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` points at `total`, which outlives every task (it's
	 * `'static`) */
	let total = unsafe { &*arg.cast::<AtomicU32>() };

	total.fetch_add(1, Ordering::SeqCst);
}

fn produce(scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` is a live `*const ProducerArgs` leaked by the test below,
	 * run exactly once by the worker that pops it */
	let boxed = unsafe { Box::from_raw(arg.cast::<ProducerArgs>().cast_mut()) };
	let counter = TaskCounter::new(scheduler, 0);
	let total_ptr: *const AtomicU32 = boxed.total;

	let tasks: Vec<Task> = (0..CONSUMERS_PER_PRODUCER)
		.map(|_| Task::new(consume, total_ptr.cast()))
		.collect();

	scheduler.add_tasks(&tasks, Some(&counter));
	scheduler.wait_for_counter(&counter, 0, false);
}

#[test]
fn every_consumer_increments_the_shared_total() {
	let total: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
	let options = Options { thread_pool_size: 4, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		let producers = TaskCounter::new(scheduler, 0);

		let tasks: Vec<Task> = (0..NUM_PRODUCERS)
			.map(|_| {
				let boxed = Box::new(ProducerArgs { total });
				let arg = Box::into_raw(boxed).cast_const().cast::<()>();

				Task::new(produce, arg)
			})
			.collect();

		scheduler.add_tasks(&tasks, Some(&producers));
		scheduler.wait_for_counter(&producers, 0, false);
	})
	.unwrap();

	assert_eq!(total.load(Ordering::SeqCst), 1_000_000);
}
