//! Guard-paged stack allocation.
//!
//! A fiber's stack is `page | usable | page`: the usable region is bracketed
//! by two inaccessible pages so that overrunning either end of the stack
//! faults immediately instead of silently corrupting an adjacent mapping.

use std::io;
use std::ptr;

use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

use crate::error::{Error, ErrorKind};

fn page_size() -> usize {
	/* Safety: querying a well-known sysconf name never fails in a way we need
	 * to handle; falling back to the common 4 KiB page size is harmless since
	 * we'd simply over-round the guard pages on the rare platform where it's
	 * wrong */
	let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

	usize::try_from(size).unwrap_or(4096)
}

/// An owned, guarded fiber stack, or the empty placeholder standing in for a
/// worker thread's own OS-provided stack (see [`super::Fiber::main`]).
pub struct Stack {
	base: *mut c_void,
	mapped_len: usize,
	usable_len: usize
}

/* Safety: the mapping is exclusively owned by this `Stack` and never aliased
 * while the owning fiber isn't running */
unsafe impl Send for Stack {}

impl Stack {
	#[must_use]
	pub const fn none() -> Self {
		Self { base: ptr::null_mut(), mapped_len: 0, usable_len: 0 }
	}

	pub fn allocate(size: usize) -> crate::Result<Self> {
		let page = page_size();
		let usable_len = size.div_ceil(page).max(1) * page;
		let mapped_len = usable_len + 2 * page;

		/* Safety: requesting a fresh anonymous mapping, not backed by any file
		 * and not aliasing any existing allocation */
		let base = unsafe {
			libc::mmap(
				ptr::null_mut(),
				mapped_len,
				PROT_NONE,
				MAP_PRIVATE | MAP_ANONYMOUS,
				-1,
				0
			)
		};

		if base == MAP_FAILED {
			return Err(Error::new(
				ErrorKind::StackAllocationFailed,
				io::Error::last_os_error().to_string()
			));
		}

		/* Safety: `base` is a fresh mapping at least `mapped_len` bytes long;
		 * `page` bytes in is still within it, leaving the first page as the
		 * low guard */
		let usable = unsafe { base.add(page) };

		/* Safety: `usable..usable+usable_len` lies entirely within the
		 * mapping just created above */
		let protected = unsafe { libc::mprotect(usable, usable_len, PROT_READ | PROT_WRITE) };

		if protected != 0 {
			let err = io::Error::last_os_error();

			/* Safety: undoing the mapping created above */
			unsafe { libc::munmap(base, mapped_len) };

			return Err(Error::new(ErrorKind::StackAllocationFailed, err.to_string()));
		}

		Ok(Self { base, mapped_len, usable_len })
	}

	/// Address of the low end of the usable region (one page above the low
	/// guard page). Combined with [`Self::usable_len`], the context switch
	/// code computes the top of the stack, matching the direction a stack
	/// grows on every architecture this crate supports.
	#[must_use]
	pub fn addr(&self) -> *mut () {
		if self.base.is_null() {
			return ptr::null_mut();
		}

		/* Safety: within the mapping */
		unsafe { self.base.add(page_size()).cast() }
	}

	#[must_use]
	pub const fn usable_len(&self) -> usize {
		self.usable_len
	}
}

impl Drop for Stack {
	fn drop(&mut self) {
		if self.base.is_null() {
			return;
		}

		/* Safety: releasing the mapping this `Stack` exclusively owns */
		unsafe {
			libc::munmap(self.base, self.mapped_len);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn allocates_a_page_aligned_usable_region() {
		let stack = Stack::allocate(64 * 1024).expect("allocation should succeed");

		assert!(stack.usable_len() >= 64 * 1024);
		assert_eq!(stack.usable_len() % page_size(), 0);
		assert!(!stack.addr().is_null());
	}

	#[test]
	fn none_reports_a_null_address() {
		let stack = Stack::none();

		assert!(stack.addr().is_null());
		assert_eq!(stack.usable_len(), 0);
	}
}
