//! Worker threads, the fiber pool, and the fetch-run-clean loop that ties
//! every other piece of this crate together.
//!
//! A [`Scheduler`] owns a fixed pool of [`crate::fiber::Fiber`]s and a fixed
//! pool of OS threads. Each thread repeatedly: hands off any ready fiber
//! waiting for it, otherwise pulls a task from its own [`crate::deque::WaitFreeQueue`]
//! or steals one from a sibling, runs it to completion (or until the task
//! parks itself via [`crate::counter::TaskCounter`], [`crate::wait_group::WaitGroup`],
//! or [`crate::fibtex::Fibtex`]), and otherwise falls back to its configured
//! [`EmptyQueueBehavior`].
//!
//! # Publish-after-switch
//! No fiber may become visible to another worker (returned to the pool, or
//! marked ready) until it has fully switched off its previous thread's
//! stack. Every transition defers that publish to the *landing* fiber's
//! first act after a switch, [`Scheduler::cleanup_previous`], driven by a
//! pair of TLS fields (`old_fiber_index`, `old_fiber_destination`) set by
//! whichever side initiated the switch. See `DESIGN.md` for the full
//! argument.

mod task;

pub use task::{Task, TaskFn};
pub(crate) use task::TaskBundle;

use std::cell::Cell as StdCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

use crate::cell::{Cell, UnsafeCell};
use crate::counter::{TaskCounter, WaitOutcome};
use crate::deque::WaitFreeQueue;
use crate::error::{Error, ErrorKind};
use crate::fiber::{Fiber, Start};
use crate::sync::SpinLock;

/// Sentinel for "no fiber"/"no pinned thread" in the scalar index fields
/// threaded through this module and the synchronization primitives that
/// borrow a [`Scheduler`].
pub(crate) const INVALID_INDEX: usize = usize::MAX;

const DEFAULT_FIBER_POOL_SIZE: usize = 400;
const DEFAULT_STACK_SIZE: usize = 512 * 1024;
const FAILED_POP_THRESHOLD: u32 = 5;
const FREE_FIBER_SCAN_WARN_ROUNDS: u32 = 10;

/// How a worker behaves when it finds no task and no ready fiber.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum EmptyQueueBehavior {
	/// Loop immediately. Lowest latency, burns a core.
	#[default]
	Spin,
	/// `std::thread::yield_now` between attempts.
	Yield,
	/// Park on a condition variable after a run of failed attempts, woken by
	/// a new task or a ready-fiber handoff.
	Sleep
}

/// Coarse state a fiber is in, reported to [`Callbacks::fiber_state_changed`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FiberState {
	/// Executing a task or the main task.
	Running,
	/// Parked, waiting on a counter, wait group, or Fibtex.
	Waiting,
	/// The worker has no task and no ready fiber (only reachable under
	/// [`EmptyQueueBehavior::Sleep`]).
	Idle
}

type ThreadCallback = Box<dyn Fn(usize) + Send + Sync>;
type FiberStateCallback = Box<dyn Fn(usize, FiberState) + Send + Sync>;

/// Optional lifecycle hooks, fired from the thread/fiber they describe.
#[derive(Default)]
pub struct Callbacks {
	/// Fired once from the initializing thread with the number of worker
	/// threads created.
	pub threads_created: Option<ThreadCallback>,
	/// Fired once from the initializing thread with the fiber pool size.
	pub fibers_created: Option<ThreadCallback>,
	/// Fired from each worker thread (including the repurposed calling
	/// thread) with its index, just after it starts.
	pub thread_started: Option<ThreadCallback>,
	/// Fired from each worker thread with its index, just before it returns.
	pub thread_ended: Option<ThreadCallback>,
	/// Fired whenever a fiber on a given worker transitions between
	/// [`FiberState`]s.
	pub fiber_state_changed: Option<FiberStateCallback>
}

/// Construction options for [`Scheduler::init`].
pub struct Options {
	/// Number of fibers in the fixed pool. Default 400, matching the
	/// original C++ library's default.
	pub fiber_pool_size: usize,
	/// Number of worker threads. `0` auto-detects via
	/// `std::thread::available_parallelism`.
	pub thread_pool_size: usize,
	pub empty_queue_behavior: EmptyQueueBehavior,
	pub callbacks: Callbacks
}

impl Default for Options {
	fn default() -> Self {
		Self {
			fiber_pool_size: DEFAULT_FIBER_POOL_SIZE,
			thread_pool_size: 0,
			empty_queue_behavior: EmptyQueueBehavior::Spin,
			callbacks: Callbacks::default()
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FiberDestination {
	None,
	ToPool,
	ToWaiting
}

struct ReadyFiber {
	fiber_index: usize,
	switched_flag: *const AtomicBool
}

/* Safety: a `ReadyFiber` is only ever read after its `switched_flag` has
 * been observed `true`, at which point the fiber it names is no longer
 * running anywhere */
unsafe impl Send for ReadyFiber {}

/// A value protected by a [`SpinLock`], for state a worker touches briefly
/// and infrequently enough that a full mutex would be overkill but that
/// genuinely needs cross-thread access (unlike the plain `Cell` fields
/// alongside it in `ThreadLocalStorage`, which only the owning worker ever
/// touches).
struct Guarded<T> {
	lock: SpinLock,
	value: UnsafeCell<T>
}

impl<T> Guarded<T> {
	const fn new(value: T) -> Self {
		Self { lock: SpinLock::new(), value: UnsafeCell::new(value) }
	}

	fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
		self.lock.lock();

		/* Safety: the spin lock just above gives us exclusive access to
		 * `value` until `unlock` runs */
		let result = f(unsafe { self.value.as_mut() });

		self.lock.unlock();
		result
	}
}

/* Safety: `lock` mediates every access to `value` */
unsafe impl<T: Send> Sync for Guarded<T> {}

struct ThreadLocalStorage {
	/// Placeholder representing the OS thread's own stack. Only ever used
	/// as a `switch` source/destination, never started.
	thread_fiber: UnsafeCell<Fiber>,
	current_fiber_index: Cell<usize>,
	old_fiber_index: Cell<usize>,
	old_fiber_destination: Cell<FiberDestination>,
	old_fiber_stored_flag: Cell<*const AtomicBool>,
	queue: WaitFreeQueue<TaskBundle>,
	last_successful_steal: Cell<usize>,
	ready_fibers: Guarded<Vec<ReadyFiber>>,
	failed_pop_attempts: Mutex<u32>,
	failed_pop_cv: Condvar
}

/* Safety: the `Cell` fields are touched only by the worker thread that owns
 * this slot; `queue`, `ready_fibers`, and the mutex/condvar pair are each
 * already sound for cross-thread access on their own */
unsafe impl Sync for ThreadLocalStorage {}

impl ThreadLocalStorage {
	fn new() -> Self {
		Self {
			thread_fiber: UnsafeCell::new(Fiber::main()),
			current_fiber_index: Cell::new(INVALID_INDEX),
			old_fiber_index: Cell::new(INVALID_INDEX),
			old_fiber_destination: Cell::new(FiberDestination::None),
			old_fiber_stored_flag: Cell::new(ptr::null()),
			queue: WaitFreeQueue::new(),
			last_successful_steal: Cell::new(0),
			ready_fibers: Guarded::new(Vec::new()),
			failed_pop_attempts: Mutex::new(0),
			failed_pop_cv: Condvar::new()
		}
	}
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

cfg_if::cfg_if! {
	if #[cfg(target_os = "linux")] {
		fn set_thread_affinity(index: usize) {
			/* Safety: `set` is a correctly-sized, stack-local `cpu_set_t`
			 * initialized by `CPU_ZERO` before any `CPU_SET` call */
			unsafe {
				let mut set: libc::cpu_set_t = std::mem::zeroed();

				libc::CPU_ZERO(&mut set);
				libc::CPU_SET(index % libc::CPU_SETSIZE as usize, &mut set);

				if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
					crate::warn!("fiberflow: failed to pin worker {index} to a core: {}", std::io::Error::last_os_error());
				}
			}
		}
	} else {
		fn set_thread_affinity(index: usize) {
			let _ = index;
		}
	}
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("<non-string panic payload>")
}

thread_local! {
	static WORKER_INDEX: StdCell<usize> = const { StdCell::new(INVALID_INDEX) };
}

/// Owns the fiber pool and worker threads, and drives the fetch-run-clean
/// loop. Every synchronization primitive in this crate (`TaskCounter`,
/// `WaitGroup`, `Fibtex`) borrows a `Scheduler` rather than owning one.
pub struct Scheduler {
	fibers: Box<[UnsafeCell<Fiber>]>,
	free_fibers: Box<[AtomicBool]>,
	tls: Box<[crate::sync::CachePadded<ThreadLocalStorage>]>,
	num_threads: usize,
	empty_queue_behavior: EmptyQueueBehavior,
	quit: AtomicBool,
	callbacks: Callbacks
}

/// `scheduler` is type-erased (rather than a typed `&Scheduler`) purely to
/// sidestep naming a lifetime for the boxed closure below; `main_fiber_trampoline`
/// only ever runs while `run_main_thread`'s stack frame is still live, so the
/// pointer is valid for as long as anyone can reach it.
struct MainArgs {
	scheduler: *const Scheduler,
	main: Option<Box<dyn FnOnce(&Scheduler) + Send>>
}

/// # Safety
/// `arg` must be the `*const Scheduler` bound to every pool fiber by
/// `Scheduler::init`.
unsafe fn fiber_entry_trampoline(arg: *const ()) {
	/* Safety: guaranteed by caller; the scheduler outlives every worker
	 * fiber, since `init` doesn't return until they've all exited */
	let scheduler = unsafe { &*arg.cast::<Scheduler>() };

	scheduler.cleanup_previous();
	scheduler.worker_loop();

	let index = scheduler.current_thread_index();
	let tls = &scheduler.tls[index];
	let current = tls.current_fiber_index.get();

	/* Safety: quitting; hand control back to the OS thread's own stack so
	 * it can unwind and return from the worker's entry point */
	unsafe { Fiber::switch(scheduler.fiber_ptr(current), tls.thread_fiber.get()) };

	unreachable!("a fiber must not return from its entry point");
}

/// # Safety
/// `arg` must be a live `*mut MainArgs`, reachable only from the thread
/// parked at the switch that resumed this fiber.
unsafe fn main_fiber_trampoline(arg: *const ()) {
	/* Safety: guaranteed by caller */
	let args = unsafe { &mut *arg.cast::<MainArgs>().cast_mut() };

	#[allow(clippy::expect_used)]
	let main = args.main.take().expect("the main fiber trampoline runs exactly once");

	/* Safety: `args.scheduler` was set by `run_main_thread` to the same
	 * `&Scheduler` it was called with, which outlives this whole call */
	let scheduler = unsafe { &*args.scheduler };

	if let Err(payload) = catch_unwind(AssertUnwindSafe(|| main(scheduler))) {
		crate::error!("fiberflow: main task panicked: {}", panic_message(&payload));
	}

	scheduler.quit.store(true, Ordering::Release);
	scheduler.wake_all_sleepers();

	let index = scheduler.current_thread_index();
	let tls = &scheduler.tls[index];
	let current = tls.current_fiber_index.get();

	/* Safety: the calling thread (worker 0) is parked at the switch in
	 * `run_main_thread`, waiting for this exact resume */
	unsafe { Fiber::switch(scheduler.fiber_ptr(current), tls.thread_fiber.get()) };

	unreachable!("a fiber must not return from its entry point");
}

fn resolve_thread_count(requested: usize) -> usize {
	if requested != 0 {
		return requested;
	}

	thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn run_main_thread(scheduler: &Scheduler, main: impl FnOnce(&Scheduler) + Send + 'static) {
	scheduler.set_current_thread_index(0);
	set_thread_affinity(0);

	if let Some(callback) = &scheduler.callbacks.thread_started {
		callback(0);
	}

	let tls = &scheduler.tls[0];
	let fiber_index = scheduler.next_free_fiber();

	tls.current_fiber_index.set(fiber_index);

	let mut args = MainArgs { scheduler: ptr::from_ref(scheduler), main: Some(Box::new(main)) };
	let args_ptr: *mut MainArgs = &mut args;

	/* Safety: `fiber_index` was just claimed and isn't running anywhere;
	 * `args` outlives the switch below since this stack frame doesn't
	 * return until the main fiber has finished with it */
	unsafe {
		(*scheduler.fiber_ptr(fiber_index))
			.set_start(Start::new(main_fiber_trampoline, args_ptr.cast_const().cast()));
		Fiber::switch(tls.thread_fiber.get(), scheduler.fiber_ptr(fiber_index));
	}

	scheduler.cleanup_previous();

	if let Some(callback) = &scheduler.callbacks.thread_ended {
		callback(0);
	}
}

fn worker_thread_main(scheduler: &Scheduler, index: usize) {
	scheduler.set_current_thread_index(index);
	set_thread_affinity(index);

	if let Some(callback) = &scheduler.callbacks.thread_started {
		callback(index);
	}

	let tls = &scheduler.tls[index];
	let fiber_index = scheduler.next_free_fiber();

	tls.current_fiber_index.set(fiber_index);

	/* Safety: `thread_fiber` is this thread's own placeholder; the claimed
	 * pool fiber is already bound to `fiber_entry_trampoline` by `init` */
	unsafe { Fiber::switch(tls.thread_fiber.get(), scheduler.fiber_ptr(fiber_index)) };

	if let Some(callback) = &scheduler.callbacks.thread_ended {
		callback(index);
	}
}

impl Scheduler {
	/// Build the fiber pool and worker threads from `options`, then run
	/// `main` as the scheduler's first task, with the calling thread as
	/// worker 0. Blocks until `main` returns, every worker has observed
	/// `quit`, and all worker threads have joined -- there is no separate
	/// `join`; this call is both the entry point and the shutdown point.
	///
	/// # Errors
	/// if a worker thread fails to spawn.
	pub fn init(options: Options, main: impl FnOnce(&Scheduler) + Send + 'static) -> crate::Result<()> {
		let Options { fiber_pool_size, thread_pool_size, empty_queue_behavior, callbacks } = options;
		let num_threads = resolve_thread_count(thread_pool_size);

		let fibers: Box<[UnsafeCell<Fiber>]> = (0..fiber_pool_size)
			.map(|_| UnsafeCell::new(Fiber::new(DEFAULT_STACK_SIZE)))
			.collect();
		let free_fibers: Box<[AtomicBool]> =
			(0..fiber_pool_size).map(|_| AtomicBool::new(true)).collect();
		let tls: Box<[crate::sync::CachePadded<ThreadLocalStorage>]> = (0..num_threads)
			.map(|_| crate::sync::CachePadded(ThreadLocalStorage::new()))
			.collect();

		let scheduler = Self { fibers, free_fibers, tls, num_threads, empty_queue_behavior, quit: AtomicBool::new(false), callbacks };

		let scheduler_ptr: *const Self = &scheduler;

		for fiber in scheduler.fibers.iter() {
			/* Safety: none of these fibers have been switched to yet; `scheduler`
			 * is a local that outlives every switch, since `init` doesn't return
			 * until all workers (and the repurposed calling thread) have
			 * finished with it */
			unsafe {
				(*fiber.get()).set_start(Start::new(fiber_entry_trampoline, scheduler_ptr.cast()));
			}
		}

		if let Some(callback) = &scheduler.callbacks.threads_created {
			callback(num_threads);
		}

		if let Some(callback) = &scheduler.callbacks.fibers_created {
			callback(fiber_pool_size);
		}

		thread::scope(|scope| -> crate::Result<()> {
			let mut handles = Vec::with_capacity(num_threads.saturating_sub(1));

			for index in 1..num_threads {
				let spawned = thread::Builder::new()
					.name(format!("fiberflow-worker-{index}"))
					.spawn_scoped(scope, || worker_thread_main(&scheduler, index));

				match spawned {
					Ok(handle) => handles.push(handle),
					Err(source) => {
						/* let already-spawned workers observe quit instead of
						 * leaving them spinning forever once we bail out */
						scheduler.quit.store(true, Ordering::Release);
						scheduler.wake_all_sleepers();

						for handle in handles {
							drop(handle.join());
						}

						return Err(Error::new(ErrorKind::ThreadSpawnFailed, source.to_string()));
					}
				}
			}

			run_main_thread(&scheduler, main);

			for handle in handles {
				drop(handle.join());
			}

			Ok(())
		})
	}

	#[must_use]
	pub fn current_thread_index(&self) -> usize {
		WORKER_INDEX.with(StdCell::get)
	}

	fn set_current_thread_index(&self, index: usize) {
		WORKER_INDEX.with(|cell| cell.set(index));
	}

	#[must_use]
	pub const fn thread_count(&self) -> usize {
		self.num_threads
	}

	/// The fiber pool index of whatever is currently running on this
	/// thread. Used by [`crate::wait_group::WaitGroup`] and
	/// [`crate::fibtex::Fibtex`] to build the waiter node they link into
	/// their intrusive queue; never exposed to user code directly.
	pub(crate) fn current_fiber_index(&self) -> usize {
		let index = self.current_thread_index();

		self.tls[index].current_fiber_index.get()
	}

	fn fiber_ptr(&self, index: usize) -> *mut Fiber {
		self.fibers[index].get()
	}

	fn set_fiber_state(&self, index: usize, state: FiberState) {
		if let Some(callback) = &self.callbacks.fiber_state_changed {
			callback(index, state);
		}
	}

	/// Queue `task`, optionally against `counter` (bumped by one before the
	/// task becomes visible to any worker). May only be called from the
	/// main task or from within a running task.
	pub fn add_task(&self, task: Task, counter: Option<&TaskCounter<'_>>) {
		if let Some(counter) = counter {
			counter.add(1);
		}

		let index = self.current_thread_index();

		self.tls[index].queue.push(TaskBundle {
			task,
			counter: counter.map_or(ptr::null(), |c| ptr::from_ref(c).cast())
		});

		if self.empty_queue_behavior == EmptyQueueBehavior::Sleep {
			self.wake_all_sleepers();
		}
	}

	/// Queue every task in `tasks`, optionally against `counter` (bumped by
	/// `tasks.len()` before any of them become visible).
	pub fn add_tasks(&self, tasks: &[Task], counter: Option<&TaskCounter<'_>>) {
		if let Some(counter) = counter {
			counter.add(u32::try_from(tasks.len()).unwrap_or(u32::MAX));
		}

		let index = self.current_thread_index();
		let queue = &self.tls[index].queue;
		let counter_ptr = counter.map_or(ptr::null(), |c| ptr::from_ref(c).cast());

		for &task in tasks {
			queue.push(TaskBundle { task, counter: counter_ptr });
		}

		if self.empty_queue_behavior == EmptyQueueBehavior::Sleep {
			self.wake_all_sleepers();
		}
	}

	/// Park the current fiber until `counter` reaches `target`. If `pin` is
	/// `true`, the fiber resumes on this same worker; otherwise it may
	/// resume on any worker.
	pub fn wait_for_counter(&self, counter: &TaskCounter<'_>, target: u32, pin: bool) {
		if counter.get() == target {
			return;
		}

		let index = self.current_thread_index();
		let fiber_index = self.tls[index].current_fiber_index.get();
		let pinned_thread_index = if pin { index } else { INVALID_INDEX };

		match counter.add_to_wait_list(fiber_index, target, pinned_thread_index) {
			WaitOutcome::AlreadyDone => {}
			WaitOutcome::Parked(switched_flag) => self.park(switched_flag)
		}
	}

	/// Place a ready, condition-satisfied fiber on the target worker's
	/// ready-fiber list -- `pinned_thread_index` if given, otherwise
	/// whichever worker is doing the signalling. Called by
	/// [`TaskCounter`], [`crate::wait_group::WaitGroup`], and
	/// [`crate::fibtex::Fibtex`]; never by user code.
	pub(crate) fn add_ready_fiber(
		&self, pinned_thread_index: usize, fiber_index: usize, switched_flag: *const AtomicBool
	) {
		let target =
			if pinned_thread_index == INVALID_INDEX { self.current_thread_index() } else { pinned_thread_index };

		self.tls[target]
			.ready_fibers
			.with(|list| list.push(ReadyFiber { fiber_index, switched_flag }));

		if self.empty_queue_behavior == EmptyQueueBehavior::Sleep {
			self.wake_worker(target);
		}
	}

	/// Claim a fresh fiber, mark the current one as parked (resumable once
	/// `switched_flag` reads `true`), and switch to it. Called by every
	/// synchronization primitive's slow path; never by user code directly.
	pub(crate) fn park(&self, switched_flag: *const AtomicBool) {
		let index = self.current_thread_index();
		let tls = &self.tls[index];
		let current = tls.current_fiber_index.get();
		let free = self.next_free_fiber();

		tls.old_fiber_index.set(current);
		tls.old_fiber_destination.set(FiberDestination::ToWaiting);
		tls.old_fiber_stored_flag.set(switched_flag);
		tls.current_fiber_index.set(free);

		self.set_fiber_state(index, FiberState::Waiting);

		/* Safety: `free` was just claimed from the pool and is bound to the
		 * generic worker entry point, which begins with `cleanup_previous` */
		unsafe { Fiber::switch(self.fiber_ptr(current), self.fiber_ptr(free)) };

		self.cleanup_previous();
		self.set_fiber_state(self.current_thread_index(), FiberState::Running);
	}

	/// The deferred "publish" step described in this module's docs: runs as
	/// the very first thing after any `switch`, on the landing fiber.
	fn cleanup_previous(&self) {
		let index = self.current_thread_index();
		let tls = &self.tls[index];

		match tls.old_fiber_destination.get() {
			FiberDestination::ToPool => {
				self.free_fibers[tls.old_fiber_index.get()].store(true, Ordering::Release);
			}
			FiberDestination::ToWaiting => {
				let flag = tls.old_fiber_stored_flag.get();

				/* Safety: sound precisely because we've reached this point --
				 * the fiber that parked here has, by construction, already
				 * switched off of its own stack */
				unsafe { (*flag).store(true, Ordering::Relaxed) };
			}
			FiberDestination::None => {}
		}

		tls.old_fiber_destination.set(FiberDestination::None);
		tls.old_fiber_index.set(INVALID_INDEX);
	}

	fn next_free_fiber(&self) -> usize {
		let mut rounds: u32 = 0;

		loop {
			for (index, free) in self.free_fibers.iter().enumerate() {
				if !free.load(Ordering::Relaxed) {
					continue;
				}

				if free
					.compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
					.is_ok()
				{
					return index;
				}
			}

			rounds += 1;

			if rounds == FREE_FIBER_SCAN_WARN_ROUNDS {
				crate::warn!("fiberflow: scanned the fiber pool {FREE_FIBER_SCAN_WARN_ROUNDS} times with no free fiber (possible deadlock, or the pool is undersized)");
			}

			std::hint::spin_loop();
		}
	}

	fn wake_worker(&self, index: usize) {
		let tls = &self.tls[index];

		*lock_ignore_poison(&tls.failed_pop_attempts) = 0;
		tls.failed_pop_cv.notify_one();
	}

	fn wake_all_sleepers(&self) {
		for index in 0..self.num_threads {
			self.wake_worker(index);
		}
	}

	fn try_ready_fiber_handoff(&self, index: usize) -> bool {
		let tls = &self.tls[index];

		let ready = tls.ready_fibers.with(|list| {
			let position = list.iter().position(|ready| {
				/* Safety: the flag lives in the parked fiber's wait slot or
				 * intrusive node, which outlives this read by the
				 * publish-after-switch discipline documented on this module */
				unsafe { (*ready.switched_flag).load(Ordering::Acquire) }
			});

			position.map(|position| list.remove(position))
		});

		let Some(ready) = ready else {
			return false;
		};

		let current = tls.current_fiber_index.get();

		tls.old_fiber_index.set(current);
		tls.old_fiber_destination.set(FiberDestination::ToPool);
		tls.current_fiber_index.set(ready.fiber_index);

		self.set_fiber_state(index, FiberState::Running);

		/* Safety: `ready.fiber_index` was parked with destination `ToWaiting`
		 * and its switched-out flag just read `true`, so it's off its prior
		 * thread's stack and safe to resume here */
		unsafe { Fiber::switch(self.fiber_ptr(current), self.fiber_ptr(ready.fiber_index)) };

		self.cleanup_previous();
		true
	}

	fn get_next_task(&self, index: usize) -> Option<TaskBundle> {
		let tls = &self.tls[index];

		if let Some(bundle) = tls.queue.pop() {
			return Some(bundle);
		}

		let start = tls.last_successful_steal.get();

		for offset in 0..self.num_threads {
			let victim = (start + offset) % self.num_threads;

			if victim == index {
				continue;
			}

			if let Some(bundle) = self.tls[victim].queue.steal() {
				tls.last_successful_steal.set(victim);
				return Some(bundle);
			}
		}

		None
	}

	fn try_run_task(&self, index: usize) -> bool {
		let Some(bundle) = self.get_next_task(index) else {
			return false;
		};

		self.set_fiber_state(index, FiberState::Running);

		/* the core never unwinds across a fiber switch boundary; a task's
		 * panic is caught here, logged, and treated as task completion so
		 * sibling tasks and their counter aren't wedged by one bad task */
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (bundle.task.func)(self, bundle.task.arg))) {
			crate::error!("fiberflow: task panicked: {}", panic_message(&payload));
		}

		if !bundle.counter.is_null() {
			/* Safety: `Scheduler::add_task`/`add_tasks`'s caller guarantees
			 * the counter outlives every task registered against it */
			unsafe { (*bundle.counter.cast::<TaskCounter<'_>>()).decrement() };
		}

		true
	}

	fn sleep_if_idle(&self, index: usize) {
		let tls = &self.tls[index];

		self.set_fiber_state(index, FiberState::Idle);

		let mut attempts = lock_ignore_poison(&tls.failed_pop_attempts);

		if !tls.ready_fibers.with(Vec::is_empty) {
			return;
		}

		*attempts = attempts.saturating_add(1);

		if *attempts < FAILED_POP_THRESHOLD {
			return;
		}

		drop(
			tls.failed_pop_cv
				.wait_while(attempts, |attempts| {
					*attempts >= FAILED_POP_THRESHOLD && !self.quit.load(Ordering::Acquire)
				})
				.unwrap_or_else(PoisonError::into_inner)
		);
	}

	fn worker_loop(&self) {
		let index = self.current_thread_index();

		loop {
			if self.quit.load(Ordering::Acquire) {
				return;
			}

			if self.try_ready_fiber_handoff(index) {
				continue;
			}

			if self.try_run_task(index) {
				continue;
			}

			match self.empty_queue_behavior {
				EmptyQueueBehavior::Spin => {}
				EmptyQueueBehavior::Yield => thread::yield_now(),
				EmptyQueueBehavior::Sleep => self.sleep_if_idle(index)
			}
		}
	}
}

/* every field is `Sync` on its own (see `ThreadLocalStorage` and `Guarded`'s
 * impls above), so `Scheduler` gets `Sync` for free via the usual auto-trait
 * rules -- no manual impl needed */
