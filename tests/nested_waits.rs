//! Scenario D: T1 parks waiting on a counter that hasn't been touched yet;
//! T2 arrives later and is the one that actually submits the sub-tasks T1 is
//! waiting on. Exercises that a counter doesn't care which task populates it,
//! and that waiting doesn't deadlock the worker it parked on.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use fiberflow::counter::TaskCounter;
use fiberflow::scheduler::Task;
use fiberflow::{Options, Scheduler};

const NUM_SUBTASKS: u32 = 100;

struct Counts {
	sub_ran: AtomicU32,
	t1_observed_zero: AtomicBool,
	t1_ran: AtomicBool
}

struct Args {
	c1: *const (),
	counts: *const Counts
}

fn subtask(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` points at an `Args` kept alive on the stack of the test
	 * below for as long as any task submitted against `c1` can still run */
	let args = unsafe { &*arg.cast::<Args>() };
	/* Safety: see above */
	let counts = unsafe { &*args.counts };

	counts.sub_ran.fetch_add(1, Ordering::SeqCst);
}

fn t2_submit_subtasks(scheduler: &Scheduler, arg: *const ()) {
	/* Safety: see `subtask` above */
	let args = unsafe { &*arg.cast::<Args>() };
	/* Safety: `args.c1` points at the live `TaskCounter` the test below
	 * waits on; it outlives every sub-task queued against it */
	let c1 = unsafe { &*args.c1.cast::<TaskCounter<'_>>() };
	let tasks: Vec<Task> = (0..NUM_SUBTASKS).map(|_| Task::new(subtask, arg)).collect();

	scheduler.add_tasks(&tasks, Some(c1));
}

fn t1_wait_on_c1(scheduler: &Scheduler, arg: *const ()) {
	/* Safety: see `subtask` above */
	let args = unsafe { &*arg.cast::<Args>() };
	/* Safety: see `t2_submit_subtasks` above */
	let c1 = unsafe { &*args.c1.cast::<TaskCounter<'_>>() };
	/* Safety: see `subtask` above */
	let counts = unsafe { &*args.counts };

	scheduler.wait_for_counter(c1, 0, false);

	counts.t1_observed_zero.store(c1.get() == 0, Ordering::SeqCst);
	counts.t1_ran.store(true, Ordering::SeqCst);
}

#[test]
fn waiter_arriving_before_the_work_is_queued_does_not_deadlock() {
	let options = Options { thread_pool_size: 2, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		let counts =
			Counts { sub_ran: AtomicU32::new(0), t1_observed_zero: AtomicBool::new(false), t1_ran: AtomicBool::new(false) };
		let c1 = TaskCounter::new(scheduler, 0);
		let args = Args { c1: std::ptr::from_ref(&c1).cast(), counts: &counts };
		let arg: *const () = std::ptr::from_ref(&args).cast();
		let top = TaskCounter::new(scheduler, 0);

		// T2 is tracked under `c1` itself, not `top`: submitting it bumps `c1`
		// to 1 right here, before T1 is even queued. `c1` can't fall back to
		// 0 until T2 has both queued every sub-task against it and finished
		// (T2's own completion is one of the decrements `c1` is waiting to
		// absorb), so T1's wait below can't take the fast path.
		scheduler.add_task(Task::new(t2_submit_subtasks, arg), Some(&c1));
		scheduler.add_task(Task::new(t1_wait_on_c1, arg), Some(&top));

		scheduler.wait_for_counter(&top, 0, false);

		// `top` only tracks T1, but T1 can't return from `wait_for_counter`
		// until `c1` has hit zero, which can't happen until every sub-task
		// below has actually run -- so this is synchronized, not incidental.
		assert_eq!(counts.sub_ran.load(Ordering::SeqCst), NUM_SUBTASKS);
		assert!(counts.t1_ran.load(Ordering::SeqCst));
		assert!(counts.t1_observed_zero.load(Ordering::SeqCst));
	})
	.unwrap();
}
