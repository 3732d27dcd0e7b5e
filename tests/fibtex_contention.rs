//! Scenario C: 40_000 tasks across a 4-thread scheduler all contend for the
//! same `Fibtex`-guarded, plain (non-atomic) counter. If the lock's mutual
//! exclusion is sound, every increment is serialized and the final value is
//! exactly the task count -- no lost updates.

use fiberflow::counter::TaskCounter;
use fiberflow::fibtex::Fibtex;
use fiberflow::scheduler::Task;
use fiberflow::{Options, Scheduler};

const NUM_TASKS: u32 = 40_000;

fn bump(scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` points at the `Fibtex<u32>` the test below keeps alive
	 * on its stack until every task has run */
	let lock = unsafe { &*arg.cast::<Fibtex<'_, u32>>() };
	let mut guard = lock.lock(false);

	*guard += 1;

	let _ = scheduler;
}

#[test]
fn contended_fibtex_never_loses_an_update() {
	let options = Options { thread_pool_size: 4, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		let lock = Fibtex::with_data(scheduler, 0_u32);
		let lock_ptr: *const Fibtex<'_, u32> = &lock;
		let counter = TaskCounter::new(scheduler, 0);

		let tasks: Vec<Task> = (0..NUM_TASKS).map(|_| Task::new(bump, lock_ptr.cast())).collect();

		scheduler.add_tasks(&tasks, Some(&counter));
		scheduler.wait_for_counter(&counter, 0, false);

		assert_eq!(*lock.lock(false), NUM_TASKS);
		assert_eq!(*lock.lock(false), 40_000);
	})
	.unwrap();
}
