//! A counter that tracks outstanding task completions and parks fibers
//! until it reaches a target value.
//!
//! Grounded on `original_source/include/ftl/task_counter.h` and
//! `source/task_counter.cpp`: a fixed-capacity table of "waiting fiber"
//! slots rather than a heap-allocated wait list, so a task completion never
//! allocates. [`crate::wait_group::WaitGroup`] is the unbounded alternative
//! for when the number of waiters isn't known up front.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cell::Cell;
use crate::scheduler::{Scheduler, INVALID_INDEX};

const DEFAULT_SLOTS: usize = 4;

struct Slot {
	/// `true` means the slot is either free or being mutated by whoever
	/// currently owns it; a scanner must not read the other fields while
	/// this is `true` unless it just won the CAS that set it.
	in_use: AtomicBool,
	free: AtomicBool,
	fiber_index: Cell<usize>,
	target: Cell<u32>,
	pinned_thread_index: Cell<usize>,
	/// Set to `true` by `cleanup_previous` once the parked fiber is fully
	/// off its prior thread's stack. A ready-fiber handoff may only be
	/// delivered for a slot whose flag already reads `true`.
	switched: AtomicBool
}

/* Safety: every field besides the two flags is only touched by whichever
 * side currently holds `in_use == false` after winning the slot's
 * acquire-CAS on `free`; the flags themselves are the synchronization */
unsafe impl Sync for Slot {}

impl Slot {
	fn new() -> Self {
		Self {
			/* kept `true` even when `free` is `true`, so a scanner that reads
			 * `free` stale never mistakes a never-populated slot for a valid one */
			in_use: AtomicBool::new(true),
			free: AtomicBool::new(true),
			fiber_index: Cell::new(INVALID_INDEX),
			target: Cell::new(0),
			pinned_thread_index: Cell::new(INVALID_INDEX),
			switched: AtomicBool::new(false)
		}
	}
}

pub(crate) enum WaitOutcome {
	/// The counter already read `target`; the caller should proceed without
	/// switching fibers.
	AlreadyDone,
	/// Parked into the returned slot's switched-out flag. The caller must
	/// claim a fresh fiber, record this pointer as its TLS `old_fiber`
	/// hand-off target, and switch away.
	Parked(*const AtomicBool)
}

/// Tracks an outstanding count of work and parks fibers waiting for it to
/// reach a target value (almost always zero).
///
/// Borrows the scheduler it parks fibers on; never owns it.
pub struct TaskCounter<'scheduler> {
	scheduler: &'scheduler Scheduler,
	value: AtomicU32,
	/// Bumped around every mutating call so the destructor can spin-drain
	/// in-flight callers instead of racing a `decrement()` for the last word.
	lock: AtomicU32,
	slots: Box<[Slot]>
}

impl<'scheduler> TaskCounter<'scheduler> {
	#[must_use]
	pub fn new(scheduler: &'scheduler Scheduler, initial: u32) -> Self {
		Self::with_slots(scheduler, initial, DEFAULT_SLOTS)
	}

	#[must_use]
	pub fn with_slots(scheduler: &'scheduler Scheduler, initial: u32, slots: usize) -> Self {
		Self {
			scheduler,
			value: AtomicU32::new(initial),
			lock: AtomicU32::new(0),
			slots: (0..slots).map(|_| Slot::new()).collect()
		}
	}

	#[must_use]
	pub fn get(&self) -> u32 {
		self.value.load(Ordering::SeqCst)
	}

	/// Bump the counter by `n`.
	///
	/// # Open question (preserved from the original)
	/// This does *not* wake parked waiters -- only [`Self::decrement`] does.
	/// That is only correct if `add` is never used to *reach* a value a
	/// fiber is waiting on (only to move away from one, e.g. registering
	/// more outstanding work before any of it can complete). This crate
	/// preserves that contract rather than "fixing" it; see `DESIGN.md`.
	pub fn add(&self, n: u32) {
		self.lock.fetch_add(1, Ordering::SeqCst);
		self.value.fetch_add(n, Ordering::SeqCst);
		self.lock.fetch_sub(1, Ordering::SeqCst);
	}

	/// Decrement by one; if the new value matches a parked waiter's target,
	/// hand that fiber back to the scheduler. Called by the scheduler itself
	/// once a task finishes, never directly by user code.
	pub(crate) fn decrement(&self) {
		self.lock.fetch_add(1, Ordering::SeqCst);

		let new_value = self.value.fetch_sub(1, Ordering::SeqCst) - 1;

		if new_value == 0 {
			self.check_waiting_fibers(0);
		}

		self.lock.fetch_sub(1, Ordering::SeqCst);
	}

	fn check_waiting_fibers(&self, value: u32) {
		for slot in &self.slots {
			if slot.free.load(Ordering::Acquire) || slot.in_use.load(Ordering::SeqCst) {
				continue;
			}

			if slot.target.get() != value {
				continue;
			}

			if slot
				.in_use
				.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
				.is_err()
			{
				continue;
			}

			self.scheduler.add_ready_fiber(
				slot.pinned_thread_index.get(),
				slot.fiber_index.get(),
				&slot.switched
			);

			/* retire the slot; `in_use` stays `true` on purpose (see `Slot::new`) */
			slot.free.store(true, Ordering::Release);
		}
	}

	/// Reserve a slot for `fiber_index` waiting for `target`, or discover the
	/// value has already reached it.
	///
	/// # Panics
	/// if every slot is occupied; this is a hard upper bound on concurrent
	/// waiters per counter (the slot count given to [`Self::with_slots`]),
	/// not a condition this crate recovers from.
	pub(crate) fn add_to_wait_list(
		&self, fiber_index: usize, target: u32, pinned_thread_index: usize
	) -> WaitOutcome {
		for slot in &self.slots {
			if slot
				.free
				.compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
				.is_err()
			{
				continue;
			}

			slot.fiber_index.set(fiber_index);
			slot.target.set(target);
			slot.pinned_thread_index.set(pinned_thread_index);
			slot.switched.store(false, Ordering::Relaxed);

			/* publish the slot; a concurrent `decrement` may now see it */
			slot.in_use.store(false, Ordering::SeqCst);

			if self.value.load(Ordering::SeqCst) != target {
				return WaitOutcome::Parked(&slot.switched);
			}

			if slot
				.in_use
				.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				/* we won the race against `check_waiting_fibers`: the
				 * scheduler never saw this slot populated */
				slot.free.store(true, Ordering::Release);
				return WaitOutcome::AlreadyDone;
			}

			/* `check_waiting_fibers` claimed it first and will deliver a
			 * ready-fiber handoff; park and wait for it */
			return WaitOutcome::Parked(&slot.switched);
		}

		panic!("TaskCounter: no free waiting-fiber slot (raise `with_slots`' capacity)");
	}
}

impl Drop for TaskCounter<'_> {
	fn drop(&mut self) {
		while self.lock.load(Ordering::Acquire) != 0 {
			spin_loop();
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn slot_starts_free_and_in_use_until_populated() {
		let slot = Slot::new();

		assert!(slot.free.load(Ordering::Relaxed));
		assert!(slot.in_use.load(Ordering::Relaxed));
	}
}
