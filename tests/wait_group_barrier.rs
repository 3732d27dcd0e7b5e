//! Property 7: if `add(k)` precedes any `wait`, and exactly `k` `done()`
//! calls follow, every `wait` returns once and only after all `done()`
//! calls -- never early, never hung.

use std::sync::atomic::{AtomicU32, Ordering};

use fiberflow::scheduler::Task;
use fiberflow::wait_group::WaitGroup;
use fiberflow::{Options, Scheduler};

const NUM_DONE: u32 = 50;
const NUM_WAITERS: u32 = 8;

struct Shared<'scheduler> {
	wg: WaitGroup<'scheduler>,
	done_count: AtomicU32,
	woke_count: AtomicU32,
	/// `done_count` as observed by each waiter the instant it woke; every
	/// entry must equal `NUM_DONE` once the run finishes.
	observed_at_wake: [AtomicU32; NUM_WAITERS as usize]
}

fn wait_task(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` points at the test's `Shared`, kept alive on the stack
	 * of the closure below for as long as any task can still run against it */
	let shared = unsafe { &*arg.cast::<Shared<'_>>() };

	shared.wg.wait(false);

	let slot = shared.woke_count.fetch_add(1, Ordering::SeqCst);

	shared.observed_at_wake[slot as usize].store(shared.done_count.load(Ordering::SeqCst), Ordering::SeqCst);
}

fn done_task(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: see `wait_task` */
	let shared = unsafe { &*arg.cast::<Shared<'_>>() };

	shared.done_count.fetch_add(1, Ordering::SeqCst);
	shared.wg.done();
}

#[test]
fn every_wait_returns_only_after_every_done_call() {
	let options = Options { thread_pool_size: 4, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		let shared = Shared {
			wg: WaitGroup::new(scheduler),
			done_count: AtomicU32::new(0),
			woke_count: AtomicU32::new(0),
			observed_at_wake: std::array::from_fn(|_| AtomicU32::new(0))
		};

		shared.wg.add(i32::try_from(NUM_DONE).unwrap());

		let join = fiberflow::counter::TaskCounter::new(scheduler, 0);
		let arg: *const () = std::ptr::from_ref(&shared).cast();

		let mut tasks = Vec::new();

		for _ in 0..NUM_WAITERS {
			tasks.push(Task::new(wait_task, arg));
		}

		for _ in 0..NUM_DONE {
			tasks.push(Task::new(done_task, arg));
		}

		scheduler.add_tasks(&tasks, Some(&join));
		scheduler.wait_for_counter(&join, 0, false);

		assert_eq!(shared.done_count.load(Ordering::SeqCst), NUM_DONE);
		assert_eq!(shared.woke_count.load(Ordering::SeqCst), NUM_WAITERS);

		for observed in &shared.observed_at_wake {
			assert_eq!(observed.load(Ordering::SeqCst), NUM_DONE, "a waiter woke before every done() call landed");
		}
	})
	.unwrap();
}
