//! A fiber-based task scheduler: a user-space concurrency runtime that
//! multiplexes many lightweight cooperative fibers onto a fixed pool of
//! worker threads. A fiber that must wait for other work does not block its
//! worker — the worker detaches the waiting fiber, picks up other runnable
//! work, and resumes the waiter only once its condition is satisfied.
//!
//! The pieces, leaves first:
//! - [`fiber`] — the suspendable stack and context-switch primitive.
//! - [`deque`] — the Chase-Lev work-stealing queue each worker owns.
//! - [`scheduler`] — worker threads, the fiber pool, and the fetch-run-clean
//!   loop that ties everything together.
//! - [`counter`] and [`wait_group`] — ways to park a fiber until some amount
//!   of outstanding work completes.
//! - [`fibtex`] — a mutex whose blocked waiter is a fiber, not a thread.

pub mod cell;
pub mod counter;
pub mod deque;
pub mod error;
pub mod fiber;
pub mod fibtex;
pub mod log;
pub mod macros;
pub mod opt;
pub mod parallel_for;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod wait_group;

extern crate self as fiberflow;

#[cfg(feature = "logger")]
pub extern crate ctor;
#[cfg(feature = "logger")]
pub extern crate lazy_static;

pub use error::{Error, ErrorKind, Result};
pub use scheduler::{Callbacks, EmptyQueueBehavior, Options, Scheduler};
