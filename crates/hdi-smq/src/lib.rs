//! Shared-memory queue synchronization for HDI drivers.
//!
//! A driver that moves bulk data between processes maps one shared segment,
//! places a ring buffer in it, and coordinates the producer and consumer with
//! a single 32-bit [`SyncWord`]. Each bit of the word is an independent
//! condition; waiting and waking go through a futex with a bitset filter so a
//! wake on one bit never releases a waiter blocked on another.
//!
//! # Layers
//!
//! - [`futex`]: the raw `FUTEX_WAIT_BITSET` / `FUTEX_WAKE_BITSET` calls, plus a
//!   process-local fallback for platforms without bitset futexes.
//! - [`SyncWord`]: the wait/wake protocol (clear-and-check, re-check after
//!   wake, idempotent wake).
//! - [`SharedMemQueueSyncer`]: a sync word pinned to an address inside a
//!   mapping the syncer does not own.
//! - [`SpscRing`]: the lock-free single-producer single-consumer ring.
//! - [`SharedMemQueue`]: the ring and the syncer combined into blocking
//!   `read`/`write` with deadlines.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model the sync word protocol and the ring
//! under every interleaving.
//!
//! ```text
//! cargo test -p hdi-smq --features loom
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod futex;
pub mod meta;
#[cfg(unix)]
pub mod mmap;
pub mod queue;
pub mod region;
pub mod spsc;
pub mod sync;
pub mod syncer;
pub mod syncword;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;

pub use meta::QueueMeta;
#[cfg(unix)]
pub use mmap::MmapRegion;
pub use queue::{
    LayoutError, QueueBits, QueueConfig, QueueError, QueueHeader, QueueReader, QueueWriter,
    SharedMemQueue,
};
pub use region::{HeapRegion, Region, RegionError};
pub use spsc::{RingStatus, SpscConsumer, SpscProducer, SpscRing, SpscRingHeader};
pub use syncer::SharedMemQueueSyncer;
pub use syncword::{SyncStats, SyncStatsSnapshot, SyncWord, WaitError, WakeError, WakeOutcome};
