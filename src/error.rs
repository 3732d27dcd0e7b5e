//! A small owned error type for the scheduler's synchronous, fallible setup
//! path (`Scheduler::init`, stack allocation). This crate's concurrency
//! primitives otherwise treat capacity exhaustion and invariant violations
//! as programmer errors (`panic!`/`debug_assert!`, see the crate-level docs
//! and `SPEC_FULL.md` §7) rather than threading a `Result` through every
//! hot-path call, so this type stays intentionally small.

use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::{error, result};

pub type Result<T> = result::Result<T, Error>;

#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
	/// `Scheduler::init` was called a second time.
	AlreadyInitialized,
	/// A worker thread failed to spawn.
	ThreadSpawnFailed,
	/// The host OS refused to map or protect a fiber's stack.
	StackAllocationFailed,
	Other
}

impl ErrorKind {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::AlreadyInitialized => "scheduler already initialized",
			Self::ThreadSpawnFailed => "failed to spawn worker thread",
			Self::StackAllocationFailed => "failed to allocate a guarded fiber stack",
			Self::Other => "error"
		}
	}
}

pub struct Error {
	kind: ErrorKind,
	message: Option<String>,
	source: Option<Box<dyn error::Error + Send + Sync + 'static>>
}

impl Error {
	#[must_use]
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self { kind, message: Some(message.into()), source: None }
	}

	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		self.kind
	}
}

impl Display for Error {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
		match &self.message {
			Some(message) => write!(fmt, "{}: {}", self.kind.as_str(), message),
			None => write!(fmt, "{}", self.kind.as_str())
		}
	}
}

impl Debug for Error {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
		Display::fmt(self, fmt)
	}
}

impl error::Error for Error {
	fn source(&self) -> Option<&(dyn error::Error + 'static)> {
		self.source.as_ref().map(|source| &**source as _)
	}
}

impl From<io::Error> for Error {
	fn from(source: io::Error) -> Self {
		Self {
			kind: ErrorKind::Other,
			message: Some(source.to_string()),
			source: Some(Box::new(source))
		}
	}
}
