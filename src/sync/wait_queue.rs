//! The intrusive waiter node shared by [`crate::wait_group::WaitGroup`] and
//! [`crate::fibtex::Fibtex`].
//!
//! Both primitives pack a linked-list head pointer into the low bits of a
//! single atomic `usize` alongside one or two lock bits (see each module's
//! own word layout). What they share is the node shape and the FIFO
//! enqueue/dequeue operations on it, so those live here once.
//!
//! A node is always stack-allocated on the parking fiber's own stack, and is
//! only ever reachable from another thread between the moment it is linked
//! in and the moment the parking fiber is switched off of and
//! `cleanup_previous` runs -- the publish-after-switch discipline documented
//! on `crate::scheduler` is what makes that safe without a heap allocation.

use std::mem::align_of;
use std::ptr;
use std::sync::atomic::AtomicBool;

use crate::cell::Cell;
use crate::scheduler::INVALID_INDEX;

/// A waiting fiber, linked into an intrusive FIFO queue.
///
/// `tail` is only meaningful on the node currently at the head of a queue:
/// it points at the last node, so a new arrival can be appended in O(1)
/// without walking the list.
pub(crate) struct WaitNode {
	next: Cell<*const WaitNode>,
	tail: Cell<*const WaitNode>,
	pub(crate) fiber_index: usize,
	pub(crate) pinned_thread_index: usize,
	pub(crate) switched: AtomicBool
}

/* A `WaitNode`'s low two bits must be free for the lock bits packed
 * alongside the head pointer in `WaitGroup`/`Fibtex`'s word. */
const _: () = assert!(align_of::<WaitNode>() >= 4);

impl WaitNode {
	pub(crate) fn new(fiber_index: usize) -> Self {
		Self {
			next: Cell::new(ptr::null()),
			tail: Cell::new(ptr::null()),
			fiber_index,
			pinned_thread_index: INVALID_INDEX,
			switched: AtomicBool::new(false)
		}
	}

	pub(crate) const fn pinned(mut self, pinned_thread_index: usize) -> Self {
		self.pinned_thread_index = pinned_thread_index;
		self
	}
}

/// Append `node` to the FIFO queue whose head is `head` (`null` if empty).
/// Returns the head the caller should store (unchanged unless the queue was
/// empty).
///
/// # Safety
/// `head`, if non-null, must be a live `WaitNode` whose `tail` pointer is
/// valid; `node` must not already be linked into any queue.
pub(crate) unsafe fn push_back(head: *const WaitNode, node: *const WaitNode) -> *const WaitNode {
	if head.is_null() {
		/* Safety: `node` was just handed to us, not yet observable by anyone else */
		unsafe { (*node).tail.set(node) };
		return node;
	}

	/* Safety: guaranteed by caller */
	let tail = unsafe { (*head).tail.get() };

	/* Safety: `tail` is the live tail of `head`'s queue */
	unsafe {
		(*tail).next.set(node);
		(*head).tail.set(node);
	}

	head
}

/// Pop the node at the front of the queue headed by `head` (must be
/// non-null). Returns `(new_head, popped)`; `new_head` is null if the queue
/// is now empty.
///
/// # Safety
/// `head` must be a live, non-null `WaitNode` at the front of its queue.
pub(crate) unsafe fn pop_front(head: *const WaitNode) -> (*const WaitNode, *const WaitNode) {
	/* Safety: guaranteed by caller */
	let next = unsafe { (*head).next.get() };

	if !next.is_null() {
		/* Safety: `head`'s tail pointer is only meaningful on the head node;
		 * carry it forward to the new head */
		let tail = unsafe { (*head).tail.get() };

		unsafe { (*next).tail.set(tail) };
	}

	/* Safety: `head` is being removed from the queue; clear its links so a
	 * stale read can't walk into freed stack space */
	unsafe {
		(*head).next.set(ptr::null());
		(*head).tail.set(ptr::null());
	}

	(next, head)
}
