use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;

use crate::syncword::{
    SyncStats, SyncStatsSnapshot, SyncWord, WaitError, WakeError, WakeOutcome, timeout_nanos,
};

/// A [`SyncWord`] pinned to one address inside a shared mapping.
///
/// The syncer does not own the memory. The `'m` lifetime ties it to whoever
/// owns the mapping, so the borrow checker refuses to let it outlive the
/// segment. When the word is only reachable through a raw pointer (a region
/// shared with another process), [`SharedMemQueueSyncer::from_raw`] moves that
/// obligation to the caller, who must drain all waiters before unmapping.
pub struct SharedMemQueueSyncer<'m> {
    word: NonNull<SyncWord>,
    stats: SyncStats,
    _mapping: PhantomData<&'m SyncWord>,
}

// SAFETY: all access to the word goes through atomics.
unsafe impl Send for SharedMemQueueSyncer<'_> {}
unsafe impl Sync for SharedMemQueueSyncer<'_> {}

impl<'m> SharedMemQueueSyncer<'m> {
    pub fn new(word: &'m SyncWord) -> Self {
        Self {
            word: NonNull::from(word),
            stats: SyncStats::default(),
            _mapping: PhantomData,
        }
    }

    /// Bind to a sync word by address.
    ///
    /// # Safety
    ///
    /// `word` must be non-null, 4-byte aligned, point to an initialized
    /// [`SyncWord`], and stay mapped for all of `'m`.
    pub unsafe fn from_raw(word: *const SyncWord) -> Self {
        Self {
            // SAFETY: caller guarantees non-null.
            word: unsafe { NonNull::new_unchecked(word as *mut SyncWord) },
            stats: SyncStats::default(),
            _mapping: PhantomData,
        }
    }

    #[inline]
    fn word(&self) -> &SyncWord {
        // SAFETY: valid for 'm by construction.
        unsafe { self.word.as_ref() }
    }

    /// Block until a bit of `bitset` is signaled; `timeout_ns <= 0` waits
    /// indefinitely.
    pub fn wait(&self, bitset: u32, timeout_ns: i64) -> Result<(), WaitError> {
        self.word().wait(bitset, timeout_ns, &self.stats)
    }

    /// [`wait`](Self::wait) with a [`Duration`]; `None` waits indefinitely.
    pub fn wait_timeout(&self, bitset: u32, timeout: Option<Duration>) -> Result<(), WaitError> {
        self.wait(bitset, timeout_nanos(timeout))
    }

    /// Signal `bitset`, waking only waiters on overlapping bits.
    pub fn wake(&self, bitset: u32) -> Result<WakeOutcome, WakeError> {
        self.word().wake(bitset, &self.stats)
    }

    /// Current value of the word.
    pub fn bits(&self) -> u32 {
        self.word().load()
    }

    /// Address of the pinned word.
    pub fn as_ptr(&self) -> *const SyncWord {
        self.word.as_ptr()
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for SharedMemQueueSyncer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemQueueSyncer")
            .field("word", &self.word.as_ptr())
            .field("bits", &format_args!("{:#010x}", self.bits()))
            .finish()
    }
}
