pub mod cache_padded;
pub mod spin_lock;
pub(crate) mod wait_queue;

#[doc(inline)]
pub use cache_padded::*;
#[doc(inline)]
pub use spin_lock::*;
