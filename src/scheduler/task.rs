//! The unit of work the scheduler queues and steals.

/// A task's entry point. Receives the scheduler it's running under (so it
/// can queue further tasks or wait on counters) and the argument it was
/// queued with.
pub type TaskFn = fn(&crate::Scheduler, *const ());

/// A task queued for execution, with the argument its function expects.
#[derive(Clone, Copy)]
pub struct Task {
	pub func: TaskFn,
	pub arg: *const ()
}

/* Safety: a `Task`'s argument is only ever dereferenced by the single worker
 * that eventually runs it, and the caller of `Scheduler::add_task(s)`
 * guarantees the argument stays valid until then */
unsafe impl Send for Task {}

impl Task {
	#[must_use]
	pub const fn new(func: TaskFn, arg: *const ()) -> Self {
		Self { func, arg }
	}
}

/// A queued task paired with the counter (if any) to decrement once it
/// finishes. What actually flows through each worker's [`crate::deque::WaitFreeQueue`].
///
/// The counter pointer is type-erased (like `Task::arg`) rather than typed
/// as `*const TaskCounter<'_>`, since `TaskBundle` -- unlike `TaskCounter`
/// itself -- carries no lifetime of its own; `Scheduler::add_task`'s caller
/// is trusted to keep the counter alive until the task runs, the same
/// contract `Task::arg` relies on.
#[derive(Clone, Copy)]
pub(crate) struct TaskBundle {
	pub(crate) task: Task,
	pub(crate) counter: *const ()
}

/* Safety: see `Task`'s impl; the counter pointer is valid for the lifetime
 * of the wait it was registered for */
unsafe impl Send for TaskBundle {}
