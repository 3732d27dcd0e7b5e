//! An unbounded wait-group: tracks outstanding work with a signed counter
//! and wakes every parked waiter, all at once, the moment it reaches zero.
//!
//! Grounded on `original_source/include/ftl/wait_group.h` and
//! `source/wait_group.cpp` (whose counter is modeled on Go's
//! `sync.WaitGroup` and whose intrusive queue is modeled on WebKit's
//! `WordLock` -- see that file's header comments for both). Unlike
//! [`crate::counter::TaskCounter`], there is no fixed slot table: waiter
//! nodes are intrusive and stack-allocated on the parking fiber's own
//! stack, linked through [`crate::sync::wait_queue`]. That's only sound
//! because of the publish-after-switch discipline documented on
//! [`crate::scheduler`]: a node stays reachable from another thread only
//! from the moment it's linked in until the parking fiber has fully
//! switched off its prior stack.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::thread::yield_now;

use crate::scheduler::{Scheduler, INVALID_INDEX};
use crate::sync::wait_queue::{self, WaitNode};

const QUEUE_LOCKED_BIT: usize = 0b01;
const HEAD_MASK: usize = 0b11;

/// Tracks an outstanding amount of work with a signed delta and parks
/// fibers until it reaches zero, waking all of them together.
///
/// Borrows the scheduler it parks fibers on; never owns it.
///
/// # Ordering contract
/// [`Self::add`] must never be called once any fiber has entered
/// [`Self::wait`]. If a `WaitGroup` is reused across independent phases,
/// new `add` calls must happen strictly after every previous `wait` call
/// has returned -- otherwise a fresh `add` races the queue the in-flight
/// `wait` round is still draining.
pub struct WaitGroup<'scheduler> {
	scheduler: &'scheduler Scheduler,
	counter: AtomicI32,
	/// Bit 0: queue-locked. Remaining bits: pointer to the FIFO queue head,
	/// or all-zero if empty. One spare bit (unused) keeps this word the
	/// same shape as [`crate::fibtex::Fibtex`]'s, which packs a second,
	/// "locked", bit alongside the same head pointer.
	word: AtomicUsize
}

impl<'scheduler> WaitGroup<'scheduler> {
	#[must_use]
	pub const fn new(scheduler: &'scheduler Scheduler) -> Self {
		Self { scheduler, counter: AtomicI32::new(0), word: AtomicUsize::new(0) }
	}

	#[must_use]
	pub fn get(&self) -> i32 {
		self.counter.load(Ordering::SeqCst)
	}

	/// Add `delta` (which may be negative) to the counter. If the new value
	/// is zero, every fiber currently parked in [`Self::wait`] is handed
	/// back to the scheduler.
	///
	/// # Panics
	/// (debug builds only) if the counter goes negative; doing so is
	/// always a caller bug, matching the original's `FTL_ASSERT`.
	pub fn add(&self, delta: i32) {
		let previous = self.counter.fetch_add(delta, Ordering::SeqCst);
		let new_value = previous + delta;

		debug_assert!(new_value >= 0, "WaitGroup: add() drove the counter negative");

		if new_value > 0 {
			return;
		}

		self.wake_all();
	}

	/// Equivalent to `add(-1)`.
	pub fn done(&self) {
		self.add(-1);
	}

	/// Park the current fiber until the counter reaches zero. If `pin` is
	/// `true`, the fiber resumes on this same worker; otherwise it may
	/// resume on any worker.
	pub fn wait(&self, pin: bool) {
		loop {
			if self.counter.load(Ordering::Relaxed) == 0 {
				return;
			}

			let Some(mut current) = self.try_acquire_queue_lock() else {
				yield_now();
				continue;
			};

			/* `add` may have already woken everyone and released the lock
			 * by the time we got it -- re-check under the lock before
			 * committing to parking. */
			if self.counter.load(Ordering::SeqCst) == 0 {
				current = self.word.load(Ordering::Acquire);
				self.word.store(current & !QUEUE_LOCKED_BIT, Ordering::Release);
				return;
			}

			let fiber_index = self.scheduler.current_fiber_index();
			let pinned_thread_index =
				if pin { self.scheduler.current_thread_index() } else { INVALID_INDEX };
			let node = WaitNode::new(fiber_index).pinned(pinned_thread_index);
			let node_ptr: *const WaitNode = &node;
			let head = (current & !HEAD_MASK) as *const WaitNode;

			/* Safety: `head`, if non-null, is the live head of this
			 * WaitGroup's queue (only ever mutated under the queue lock we
			 * just acquired); `node` was just created and isn't linked
			 * into any queue yet. */
			let new_head = unsafe { wait_queue::push_back(head, node_ptr) };

			/* release the queue lock by publishing the new head, which
			 * never has the lock bit set */
			self.word.store(new_head as usize, Ordering::Release);

			self.scheduler.park(&node.switched);

			/* back from a handoff -- the counter was zero at some point
			 * after we parked; loop around to confirm and return */
		}
	}

	/// Repeatedly attempt to set the queue-locked bit, returning the word
	/// observed just before it was set. `None` means the fast "no waiters,
	/// no lock" case never materialized in one attempt and the caller
	/// should back off and retry from scratch (mirrors the original's
	/// spin-and-retry shape rather than blocking).
	fn try_acquire_queue_lock(&self) -> Option<usize> {
		let current = self.word.load(Ordering::Acquire);

		if current & QUEUE_LOCKED_BIT != 0 {
			return None;
		}

		self.word
			.compare_exchange_weak(current, current | QUEUE_LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
			.ok()
	}

	fn wake_all(&self) {
		loop {
			let current = self.word.load(Ordering::Acquire);

			/* fast path: no waiters at all */
			if current == 0 {
				if self
					.word
					.compare_exchange_weak(0, QUEUE_LOCKED_BIT, Ordering::AcqRel, Ordering::Relaxed)
					.is_ok()
				{
					self.word.store(0, Ordering::Release);
					return;
				}

				yield_now();
				continue;
			}

			if current & QUEUE_LOCKED_BIT != 0 {
				yield_now();
				continue;
			}

			if self
				.word
				.compare_exchange_weak(current, current | QUEUE_LOCKED_BIT, Ordering::AcqRel, Ordering::Relaxed)
				.is_ok()
			{
				break;
			}
		}

		let current = self.word.load(Ordering::Acquire);
		let mut node = (current & !HEAD_MASK) as *const WaitNode;

		debug_assert!(!node.is_null(), "WaitGroup: queue lock held but no waiter in the queue");

		while !node.is_null() {
			/* Safety: every node reachable from `node` was linked in by a
			 * `wait` call that released the queue lock only after
			 * publishing it, and none of them have been popped yet --
			 * they're still parked on their own stacks. */
			let (next, popped) = unsafe { wait_queue::pop_front(node) };

			/* Safety: `popped` was just unlinked above */
			let pinned_thread_index = unsafe { (*popped).pinned_thread_index };
			/* Safety: same as above */
			let fiber_index = unsafe { (*popped).fiber_index };
			/* Safety: same as above */
			let switched = unsafe { &(*popped).switched };

			self.scheduler.add_ready_fiber(pinned_thread_index, fiber_index, switched);

			node = next;
		}

		self.word.store(0, Ordering::Release);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn starts_at_zero() {
		// `WaitGroup` borrows a `Scheduler`, which can't be constructed
		// without spinning up threads; the word/counter layout is what's
		// under test here, not scheduler integration (see `tests/` for
		// end-to-end coverage of that).
		assert_eq!(AtomicI32::new(0).load(Ordering::Relaxed), 0);
	}

	#[test]
	fn head_mask_clears_lock_bit() {
		let fake_head = 0x1000_usize;

		assert_eq!((fake_head | QUEUE_LOCKED_BIT) & !HEAD_MASK, fake_head);
	}
}
