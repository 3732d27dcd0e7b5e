//! A mutex whose blocked waiter is a fiber, not a thread.
//!
//! Grounded on `original_source/include/ftl/fibtex.h` and
//! `source/fibtex.cpp`, itself adapted from WebKit's `WordLock` (see that
//! file's header comments). Packs the "locked" bit, a "queue-locked" bit
//! guarding the intrusive waiter queue, and the queue's head pointer into a
//! single `usize` so every state transition is one CAS.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::yield_now;

use crate::scheduler::{Scheduler, INVALID_INDEX};
use crate::sync::wait_queue::{self, WaitNode};

const LOCKED_BIT: usize = 0b01;
const QUEUE_LOCKED_BIT: usize = 0b10;
const HEAD_MASK: usize = 0b11;

/// Spin iterations `lock`'s slow path tries before giving up and queueing,
/// provided the scheduler has more than one worker thread (matches the
/// original's `spinLimit`, picked from past JikesRVM experiments).
const SPIN_LIMIT: u32 = 40;

/// A fiber-aware mutex guarding a `T` (`()` if the caller only needs
/// exclusion, not storage -- see [`Fibtex::new`]).
///
/// Non-reentrant. Borrows the scheduler it parks fibers on; never owns it.
pub struct Fibtex<'scheduler, T = ()> {
	scheduler: &'scheduler Scheduler,
	able_to_spin: bool,
	/// Bit 0: locked. Bit 1: queue-locked. Remaining bits: FIFO waiter
	/// queue head, or all-zero if empty.
	word: AtomicUsize,
	data: UnsafeCell<T>
}

/* Safety: `data` is only ever reachable through a `FibtexGuard`, which
 * exists only between a successful lock and its matching unlock -- `word`
 * mediates every access the same way a `std::sync::Mutex`'s internal state
 * does. */
unsafe impl<T: Send> Send for Fibtex<'_, T> {}
unsafe impl<T: Send> Sync for Fibtex<'_, T> {}

impl<'scheduler> Fibtex<'scheduler, ()> {
	/// A pure mutual-exclusion `Fibtex` with no guarded data -- callers
	/// coordinate access to something external between `lock`/`unlock`
	/// (or `try_lock`) themselves.
	#[must_use]
	pub fn new(scheduler: &'scheduler Scheduler) -> Self {
		Self::with_data(scheduler, ())
	}
}

impl<'scheduler, T> Fibtex<'scheduler, T> {
	#[must_use]
	pub fn with_data(scheduler: &'scheduler Scheduler, data: T) -> Self {
		Self {
			scheduler,
			able_to_spin: scheduler.thread_count() > 1,
			word: AtomicUsize::new(0),
			data: UnsafeCell::new(data)
		}
	}

	/// Acquire the lock, parking the current fiber if it's already held.
	/// If `pin` is `true`, a fiber that parks resumes on this same worker;
	/// otherwise it may resume on any worker once woken by [`Self::unlock`].
	pub fn lock(&self, pin: bool) -> FibtexGuard<'_, T> {
		if self
			.word
			.compare_exchange(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			self.lock_slow(pin);
		}

		FibtexGuard { fibtex: self }
	}

	/// Single-CAS attempt; also barges the lock if it reads unlocked,
	/// matching the original's `try_lock` (which doesn't retry a spurious
	/// weak-CAS failure the way `lock`'s fast path does).
	pub fn try_lock(&self) -> Option<FibtexGuard<'_, T>> {
		if self
			.word
			.compare_exchange(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			return Some(FibtexGuard { fibtex: self });
		}

		let current = self.word.load(Ordering::Relaxed);

		if current & LOCKED_BIT == 0
			&& self
				.word
				.compare_exchange(current, current | LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
		{
			return Some(FibtexGuard { fibtex: self });
		}

		None
	}

	#[cold]
	fn lock_slow(&self, pin: bool) {
		let mut spin_count = 0_u32;

		loop {
			let mut current = self.word.load(Ordering::Acquire);

			if current & LOCKED_BIT == 0 {
				debug_assert!(
					current & QUEUE_LOCKED_BIT == 0,
					"Fibtex: queue lock held while the main lock is not"
				);

				if self
					.word
					.compare_exchange_weak(current, current | LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
					.is_ok()
				{
					return;
				}

				continue;
			}

			if self.able_to_spin && (current & !HEAD_MASK) == 0 && spin_count < SPIN_LIMIT {
				spin_count += 1;
				spin_loop();
				continue;
			}

			current = self.word.load(Ordering::Acquire);

			if current & QUEUE_LOCKED_BIT != 0
				|| current & LOCKED_BIT == 0
				|| self
					.word
					.compare_exchange_weak(current, current | QUEUE_LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
					.is_err()
			{
				yield_now();
				continue;
			}

			/* we now hold the queue lock; the main lock can't be released
			 * while we hold it (unlock's slow path needs the queue lock
			 * too), so it's safe to link ourselves in and release. */
			let fiber_index = self.scheduler.current_fiber_index();
			let pinned_thread_index =
				if pin { self.scheduler.current_thread_index() } else { INVALID_INDEX };
			let node = WaitNode::new(fiber_index).pinned(pinned_thread_index);
			let node_ptr: *const WaitNode = &node;

			current = self.word.load(Ordering::Acquire);

			let head = (current & !HEAD_MASK) as *const WaitNode;

			/* Safety: `head`, if non-null, is the live head of this
			 * Fibtex's queue, only ever mutated under the queue lock we
			 * hold; `node` isn't linked into any queue yet. */
			let new_head = unsafe { wait_queue::push_back(head, node_ptr) };

			/* release the queue lock, keep the main lock held, install the
			 * new head */
			self.word.store((new_head as usize) | LOCKED_BIT, Ordering::Release);

			self.scheduler.park(&node.switched);

			/* back from a handoff; retry acquiring the lock from the top */
		}
	}

	fn unlock(&self) {
		if self
			.word
			.compare_exchange(LOCKED_BIT, 0, Ordering::Release, Ordering::Relaxed)
			.is_err()
		{
			self.unlock_slow();
		}
	}

	#[cold]
	fn unlock_slow(&self) {
		loop {
			let current = self.word.load(Ordering::Acquire);

			debug_assert!(current & LOCKED_BIT != 0, "Fibtex: unlock() while not locked");

			if current == LOCKED_BIT {
				if self
					.word
					.compare_exchange_weak(current, 0, Ordering::Release, Ordering::Relaxed)
					.is_ok()
				{
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
				.compare_exchange_weak(current, current | QUEUE_LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				break;
			}
		}

		let current = self.word.load(Ordering::Acquire);
		let head = (current & !HEAD_MASK) as *const WaitNode;

		debug_assert!(!head.is_null(), "Fibtex: queue lock held but no waiter in the queue");

		/* Safety: `head` is the live head of this Fibtex's queue, owned by
		 * us while we hold the queue lock. */
		let (next, popped) = unsafe { wait_queue::pop_front(head) };

		/* release both the main lock and the queue lock in the same store,
		 * installing whatever's left of the queue as the new head -- FIFO,
		 * not LIFO, since we always wake the head and append at the tail. */
		self.word.store(next as usize, Ordering::Release);

		/* Safety: `popped` was just unlinked and is reachable from no other
		 * queue */
		let pinned_thread_index = unsafe { (*popped).pinned_thread_index };
		/* Safety: same as above */
		let fiber_index = unsafe { (*popped).fiber_index };
		/* Safety: same as above */
		let switched = unsafe { &(*popped).switched };

		self.scheduler.add_ready_fiber(pinned_thread_index, fiber_index, switched);
	}
}

/// RAII guard returned by [`Fibtex::lock`]/[`Fibtex::try_lock`], mirroring
/// [`std::sync::MutexGuard`]. Releases the lock on drop.
pub struct FibtexGuard<'a, T> {
	fibtex: &'a Fibtex<'a, T>
}

impl<T> Deref for FibtexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		/* Safety: a `FibtexGuard` exists only while its `Fibtex` is locked
		 * by this fiber, and the lock mediates every other access to `data` */
		unsafe { &*self.fibtex.data.get() }
	}
}

impl<T> DerefMut for FibtexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		/* Safety: see `Deref` above */
		unsafe { &mut *self.fibtex.data.get() }
	}
}

impl<T> Drop for FibtexGuard<'_, T> {
	fn drop(&mut self) {
		self.fibtex.unlock();
	}
}
