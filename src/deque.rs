//! A Chase-Lev work-stealing deque.
//!
//! The owning worker pushes and pops from the bottom; any other thread may
//! steal from the top. Implements the algorithm (and its memory ordering) as
//! proven correct on weak memory models by Lê et al., "Correct and Efficient
//! Work-Stealing for Weak Memory Models" (2013).
//!
//! `top` and `bottom` both start at 1 rather than 0: an all-zeroed circular
//! array would otherwise make an empty queue indistinguishable from one
//! racing a reader for slot 0 during construction.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering};

use crate::sync::CachePadded;

const STARTING_CAPACITY: usize = 32;

struct CircularArray<T> {
	mask: usize,
	buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
	/// Kept alive so a thief that read the array pointer before a `Grow`
	/// published its replacement can still dereference it safely.
	previous: Option<Box<CircularArray<T>>>
}

/* Safety: slots are only ever written by the single owning thread, and only
 * read (by a thief or the owner) once `bottom`/`top` publish that the write
 * happened */
unsafe impl<T: Send> Send for CircularArray<T> {}
unsafe impl<T: Send> Sync for CircularArray<T> {}

impl<T: Copy> CircularArray<T> {
	fn new(capacity: usize) -> Box<Self> {
		debug_assert!(capacity.is_power_of_two());

		let buffer = (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

		Box::new(Self { mask: capacity - 1, buffer, previous: None })
	}

	const fn capacity(&self) -> usize {
		self.mask + 1
	}

	/// # Safety
	/// `index` must name a slot this array (or whichever array this one grew
	/// from, at the same index) was `put` to, and not raced by a concurrent
	/// write to the same slot.
	unsafe fn get(&self, index: u64) -> T {
		let slot = &self.buffer[index as usize & self.mask];

		/* Safety: guaranteed by caller */
		unsafe { (*slot.get()).assume_init() }
	}

	/// # Safety
	/// only the queue's owning thread may call this.
	unsafe fn put(&self, index: u64, value: T) {
		let slot = &self.buffer[index as usize & self.mask];

		/* Safety: guaranteed by caller; only the owner writes */
		unsafe { (*slot.get()).write(value) };
	}

	/// Doubles the array's capacity, copying the live `top..bottom` range
	/// across, and chains `self` onto the result so it stays reachable for
	/// any thief still holding the old array pointer.
	///
	/// # Safety
	/// only the owning thread may grow the array, and `top..bottom` must be
	/// exactly the live range at the time of the call.
	unsafe fn grow(self: Box<Self>, top: u64, bottom: u64) -> Box<Self> {
		let mut grown = Self::new(self.capacity() * 2);
		let mut i = top;

		while i != bottom {
			/* Safety: `top..bottom` is `self`'s live range */
			let value = unsafe { self.get(i) };
			/* Safety: `grown` isn't published yet, so no thief can observe
			 * this write racing with `get` */
			unsafe { grown.put(i, value) };
			i = i.wrapping_add(1);
		}

		grown.previous = Some(self);
		grown
	}
}

/// A wait-free (for the stealing side) work-stealing deque.
///
/// `push` and `pop` may only be called from the single thread that owns the
/// queue; `steal` may be called from any thread, including the owner's.
pub struct WaitFreeQueue<T: Copy> {
	top: CachePadded<AtomicU64>,
	bottom: CachePadded<AtomicU64>,
	array: CachePadded<AtomicPtr<CircularArray<T>>>
}

/* Safety: the owner exclusively writes slots and publishes them through
 * `bottom`/`top`; a thief only ever reads a slot after observing that
 * publication */
unsafe impl<T: Copy + Send> Send for WaitFreeQueue<T> {}
unsafe impl<T: Copy + Send> Sync for WaitFreeQueue<T> {}

impl<T: Copy> WaitFreeQueue<T> {
	#[must_use]
	pub fn new() -> Self {
		let array = Box::into_raw(CircularArray::new(STARTING_CAPACITY));

		Self {
			top: CachePadded(AtomicU64::new(1)),
			bottom: CachePadded(AtomicU64::new(1)),
			array: CachePadded(AtomicPtr::new(array))
		}
	}

	/// Push a value onto the bottom of the queue.
	///
	/// Must only be called by the thread that owns this queue.
	pub fn push(&self, value: T) {
		let bottom = self.bottom.load(Ordering::Relaxed);
		let top = self.top.load(Ordering::Acquire);
		let array_ptr = self.array.load(Ordering::Relaxed);

		/* Safety: the owner is the only thread that ever replaces the array
		 * pointer, and it's doing so right here */
		let capacity = unsafe { (*array_ptr).capacity() } as u64;

		let array_ptr = if bottom.wrapping_sub(top) > capacity - 1 {
			/* Safety: owner-only growth; `top..bottom` is the live range */
			let grown = unsafe { Box::from_raw(array_ptr).grow(top, bottom) };
			let grown = Box::into_raw(grown);

			self.array.store(grown, Ordering::Release);
			grown
		} else {
			array_ptr
		};

		/* Safety: slot `bottom` isn't visible to a thief until the store to
		 * `self.bottom` below publishes it */
		unsafe { (*array_ptr).put(bottom, value) };

		fence(Ordering::Release);
		self.bottom.store(bottom.wrapping_add(1), Ordering::Relaxed);
	}

	/// Pop a value from the bottom of the queue.
	///
	/// Must only be called by the thread that owns this queue. Returns
	/// `None` if the queue was empty, or if the owner raced a thief for the
	/// last remaining element and lost.
	pub fn pop(&self) -> Option<T> {
		let bottom = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
		let array_ptr = self.array.load(Ordering::Relaxed);

		self.bottom.store(bottom, Ordering::Relaxed);
		fence(Ordering::SeqCst);

		let top = self.top.load(Ordering::Relaxed);

		if top > bottom {
			/* empty; restore bottom to its resting `top` position */
			self.bottom.store(bottom.wrapping_add(1), Ordering::Relaxed);
			return None;
		}

		/* Safety: `top <= bottom`, so slot `bottom` was `put` by a prior
		 * `push` and not yet claimed by a `pop` or a winning `steal` */
		let value = unsafe { (*array_ptr).get(bottom) };

		if top == bottom {
			/* last element: race any concurrent thief for it */
			let won = self
				.top
				.compare_exchange_strong(top, top.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
				.is_ok();

			self.bottom.store(bottom.wrapping_add(1), Ordering::Relaxed);

			if !won {
				return None;
			}
		}

		Some(value)
	}

	/// Attempt to steal a value from the top of the queue.
	///
	/// May be called from any thread. Returns `None` if the queue appeared
	/// empty, or if this thief lost a race for the last element.
	pub fn steal(&self) -> Option<T> {
		let top = self.top.load(Ordering::Acquire);

		fence(Ordering::SeqCst);

		let bottom = self.bottom.load(Ordering::Acquire);

		if top >= bottom {
			return None;
		}

		let array_ptr = self.array.load(Ordering::Acquire);

		/* Safety: `top < bottom` means slot `top` was published by a `push`;
		 * growth keeps superseded arrays alive via the `previous` chain, so
		 * `array_ptr` (read above, possibly stale) is still valid to read
		 * from even if the owner has since grown the queue */
		let value = unsafe { (*array_ptr).get(top) };

		self.top
			.compare_exchange_strong(top, top.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
			.map(|_| value)
			.ok()
	}
}

impl<T: Copy> Default for WaitFreeQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Copy> Drop for WaitFreeQueue<T> {
	fn drop(&mut self) {
		let array_ptr = *self.array.get_mut();

		/* Safety: `&mut self` proves exclusive access; no thief can be
		 * concurrently reading through `array_ptr` */
		drop(unsafe { Box::from_raw(array_ptr) });
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::thread;

	use super::*;

	#[test]
	fn push_pop_is_lifo_for_the_owner() {
		let queue = WaitFreeQueue::new();

		for i in 0..8 {
			queue.push(i);
		}

		for i in (0..8).rev() {
			assert_eq!(queue.pop(), Some(i));
		}

		assert_eq!(queue.pop(), None);
	}

	#[test]
	fn grows_past_the_starting_capacity() {
		let queue = WaitFreeQueue::new();

		for i in 0..(STARTING_CAPACITY * 4) {
			queue.push(i);
		}

		let mut popped = Vec::new();

		while let Some(value) = queue.pop() {
			popped.push(value);
		}

		popped.reverse();
		assert_eq!(popped, (0..(STARTING_CAPACITY * 4)).collect::<Vec<_>>());
	}

	#[test]
	fn thieves_and_owner_partition_every_element_exactly_once() {
		const COUNT: usize = 10_000;

		let queue = Arc::new(WaitFreeQueue::new());

		for i in 0..COUNT {
			queue.push(i);
		}

		let stolen = Arc::new(std::sync::Mutex::new(Vec::new()));

		let thieves: Vec<_> = (0..4)
			.map(|_| {
				let queue = Arc::clone(&queue);
				let stolen = Arc::clone(&stolen);

				thread::spawn(move || {
					let mut local = Vec::new();

					while let Some(value) = queue.steal() {
						local.push(value);
					}

					stolen.lock().unwrap().extend(local);
				})
			})
			.collect();

		let mut owned = Vec::new();

		while let Some(value) = queue.pop() {
			owned.push(value);
		}

		for thief in thieves {
			thief.join().unwrap();
		}

		let mut all = owned;
		all.extend(stolen.lock().unwrap().iter().copied());
		all.sort_unstable();

		assert_eq!(all, (0..COUNT).collect::<Vec<_>>());
	}
}
