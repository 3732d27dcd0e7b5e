//! Scenario E: a fiber that parks with `pin=true` must resume on the exact
//! worker it parked on, even though the task that satisfies its wait can run
//! on any other worker in the pool.

use std::sync::atomic::{AtomicU32, Ordering};

use fiberflow::counter::TaskCounter;
use fiberflow::scheduler::Task;
use fiberflow::{Options, Scheduler};

const NUM_TASKS: u32 = 64;

fn tick(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` points at the test's shared counter, kept alive on the
	 * stack of the main closure until `wait_for_counter` returns */
	let ran = unsafe { &*arg.cast::<AtomicU32>() };

	ran.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn pinned_wait_resumes_on_the_same_worker_it_parked_on() {
	let options = Options { thread_pool_size: 4, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		assert_eq!(scheduler.current_thread_index(), 0);

		let ran = AtomicU32::new(0);
		let ran_ptr: *const () = std::ptr::from_ref(&ran).cast();
		let counter = TaskCounter::new(scheduler, 0);

		let tasks: Vec<Task> = (0..NUM_TASKS).map(|_| Task::new(tick, ran_ptr)).collect();

		scheduler.add_tasks(&tasks, Some(&counter));
		scheduler.wait_for_counter(&counter, 0, true);

		assert_eq!(scheduler.current_thread_index(), 0);
		assert_eq!(ran.load(Ordering::SeqCst), NUM_TASKS);
	})
	.unwrap();
}
