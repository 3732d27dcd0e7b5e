//! Thin convenience wrappers over the core task/counter API: splitting a
//! slice into chunks run as tasks ([`parallel_for`]), and submitting a
//! plain closure as a task without hand-rolling a `{fn, arg}` pair
//! ([`spawn_fn`]).
//!
//! Grounded on `original_source/include/ftl/parallel_for.h` (chunking) and
//! `original_source/include/ftl/contrib/trampoline.h` (closure adapter).
//! Neither bypasses the core: both are built entirely from
//! [`Scheduler::add_task`]/[`Scheduler::add_tasks`] and
//! [`crate::counter::TaskCounter`]. Per `SPEC_FULL.md` §1/§4.8, these are
//! convenience layered on top of the scheduler, not new core engineering.

use crate::counter::TaskCounter;
use crate::scheduler::{Scheduler, Task};

/// One chunk's worth of work handed to [`chunk_trampoline`]. Lives in a
/// `Vec` on [`parallel_for`]'s stack frame for the duration of the call; the
/// `Vec` is sized exactly to the number of chunks up front so pushing never
/// reallocates and invalidates a pointer a task has already been queued
/// with.
struct ChunkArgs<'data, T, F> {
	chunk: &'data mut [T],
	func: &'data F
}

fn chunk_trampoline<T, F>(scheduler: &Scheduler, arg: *const ())
where
	F: Fn(&Scheduler, &mut T) + Sync
{
	/* Safety: `arg` is always a live `*const ChunkArgs<'_, T, F>` built by
	 * `parallel_for` below, whose stack frame outlives every task it
	 * submits -- it doesn't return until `wait_for_counter` says they've
	 * all run. */
	let args = unsafe { &*arg.cast::<ChunkArgs<'_, T, F>>() };

	for item in args.chunk.iter_mut() {
		(args.func)(scheduler, item);
	}
}

/// Split `data` into chunks of at most `batch_size` elements, run `func`
/// over every element of each chunk as one task against a scratch
/// [`TaskCounter`], and block until all of them finish.
///
/// # Panics
/// if `batch_size` is zero.
pub fn parallel_for<T, F>(scheduler: &Scheduler, data: &mut [T], batch_size: usize, func: F)
where
	F: Fn(&Scheduler, &mut T) + Sync
{
	assert!(batch_size > 0, "parallel_for: batch_size must be nonzero");

	if data.is_empty() {
		return;
	}

	let num_chunks = data.len().div_ceil(batch_size);
	let counter = TaskCounter::with_slots(scheduler, 0, 1);
	let mut chunk_args: Vec<ChunkArgs<'_, T, F>> = Vec::with_capacity(num_chunks);
	let mut remaining = data;

	for _ in 0..num_chunks {
		let take = batch_size.min(remaining.len());
		let (chunk, rest) = remaining.split_at_mut(take);

		remaining = rest;
		chunk_args.push(ChunkArgs { chunk, func: &func });
	}

	let tasks: Vec<Task> = chunk_args
		.iter()
		.map(|args| {
			let arg_ptr: *const ChunkArgs<'_, T, F> = args;

			Task::new(chunk_trampoline::<T, F>, arg_ptr.cast())
		})
		.collect();

	scheduler.add_tasks(&tasks, Some(&counter));
	scheduler.wait_for_counter(&counter, 0, false);
}

fn boxed_fn_trampoline<F>(scheduler: &Scheduler, arg: *const ())
where
	F: FnOnce(&Scheduler) + Send
{
	/* Safety: `arg` is a `Box<Option<F>>` leaked by `spawn_fn` below, and
	 * the scheduler runs each queued task exactly once, so this is the
	 * one place that reclaims it. */
	let boxed = unsafe { Box::from_raw(arg.cast::<Option<F>>().cast_mut()) };

	if let Some(func) = *boxed {
		func(scheduler);
	}
}

/// Submit `func` as a task without hand-rolling a `{fn, arg}` pair: boxes
/// the closure, erases it behind a plain function pointer (one allocation
/// per spawn, not a vtable -- see `SPEC_FULL.md` §9's note on dynamic
/// dispatch), and frees it after the call. Optionally bumps `counter` the
/// way [`Scheduler::add_task`] does.
pub fn spawn_fn<F>(scheduler: &Scheduler, counter: Option<&TaskCounter<'_>>, func: F)
where
	F: FnOnce(&Scheduler) + Send + 'static
{
	let boxed = Box::new(Some(func));
	let arg = Box::into_raw(boxed).cast_const().cast::<()>();

	scheduler.add_task(Task::new(boxed_fn_trampoline::<F>, arg), counter);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn chunking_covers_every_element_exactly_once() {
		let len = 23_usize;
		let batch_size = 5_usize;
		let num_chunks = len.div_ceil(batch_size);

		let mut covered = 0;
		let mut remaining = len;

		for _ in 0..num_chunks {
			let take = batch_size.min(remaining);

			covered += take;
			remaining -= take;
		}

		assert_eq!(covered, len);
		assert_eq!(remaining, 0);
	}
}
