#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(not(feature = "loom"))]
pub use std::thread;
