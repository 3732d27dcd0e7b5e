//! Tiny branch and unreachability hints used on the hot paths in `fiber`,
//! `deque`, and the synchronization primitives.

pub mod hint;
