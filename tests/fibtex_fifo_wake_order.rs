//! Property 6: given waiters `w1 < w2 < w3` parked strictly in that order,
//! unlocks wake them in that order (FIFO, not LIFO).
//!
//! `w1`, `w2`, `w3` are stolen (FIFO, oldest first) off the main thread's
//! deque by the lone worker thread and run one at a time: each fails the
//! fast-path lock (held by `main`), links itself onto the Fibtex's waiter
//! queue, and parks. Since the worker thread only ever runs one fiber at a
//! time, those three links happen strictly in submission order. `main`
//! watches worker 1's `Waiting` transitions to know all three have linked in
//! before it releases the lock, so unlocking one at a time must wake them
//! `w1`, `w2`, `w3`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use fiberflow::fibtex::Fibtex;
use fiberflow::scheduler::{Callbacks, FiberState, Task};
use fiberflow::{Options, Scheduler};

const NUM_WAITERS: u32 = 3;
const WORKER_THREAD_INDEX: usize = 1;

struct Shared<'scheduler> {
	lock: Fibtex<'scheduler>,
	next_wake_slot: AtomicU32,
	wake_order: [AtomicU32; NUM_WAITERS as usize]
}

struct TaskArgs<'a, 'scheduler> {
	shared: &'a Shared<'scheduler>,
	id: u32
}

fn waiter(_scheduler: &Scheduler, arg: *const ()) {
	/* Safety: `arg` points at a `TaskArgs` kept alive on the stack of the
	 * closure below until every waiter has recorded its wake order */
	let args = unsafe { &*arg.cast::<TaskArgs<'_, '_>>() };

	let _guard = args.shared.lock.lock(false);
	let slot = args.shared.next_wake_slot.fetch_add(1, Ordering::SeqCst);

	args.shared.wake_order[slot as usize].store(args.id, Ordering::SeqCst);
}

#[test]
fn unlocks_wake_waiters_in_fifo_order() {
	let waiting_transitions_on_worker_1: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));

	let callbacks = Callbacks {
		fiber_state_changed: Some(Box::new(move |index: usize, state: FiberState| {
			if index == WORKER_THREAD_INDEX && state == FiberState::Waiting {
				waiting_transitions_on_worker_1.fetch_add(1, Ordering::SeqCst);
			}
		})),
		..Callbacks::default()
	};

	let options = Options { thread_pool_size: 2, callbacks, ..Options::default() };

	Scheduler::init(options, move |scheduler| {
		let shared = Shared {
			lock: Fibtex::new(scheduler),
			next_wake_slot: AtomicU32::new(0),
			wake_order: std::array::from_fn(|_| AtomicU32::new(u32::MAX))
		};

		let join = fiberflow::counter::TaskCounter::new(scheduler, 0);

		// Hold the lock before any waiter exists, so `w1..w3` are guaranteed
		// to take the slow path and queue rather than barging in.
		let held = shared.lock.lock(false);

		let args: Vec<TaskArgs<'_, '_>> =
			(1..=NUM_WAITERS).map(|id| TaskArgs { shared: &shared, id }).collect();
		let tasks: Vec<Task> = args
			.iter()
			.map(|a| Task::new(waiter, std::ptr::from_ref(a).cast()))
			.collect();

		scheduler.add_tasks(&tasks, Some(&join));

		// Wait for all three to have linked into the Fibtex's waiter queue
		// (signalled by `park`'s `Waiting` transition, which only fires
		// after `lock_slow` has already pushed the waiter's node).
		let deadline = Instant::now() + Duration::from_secs(5);

		while waiting_transitions_on_worker_1.load(Ordering::SeqCst) < NUM_WAITERS {
			assert!(Instant::now() < deadline, "waiters never finished queuing on the Fibtex");
			std::thread::yield_now();
		}

		drop(held);

		scheduler.wait_for_counter(&join, 0, false);

		let order: Vec<u32> = shared.wake_order.iter().map(|slot| slot.load(Ordering::SeqCst)).collect();

		assert_eq!(order, vec![1, 2, 3], "Fibtex did not wake waiters in FIFO order");
	})
	.unwrap();
}
