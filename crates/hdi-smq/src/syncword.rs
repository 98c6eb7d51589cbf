//! The sync word wait/wake protocol.
//!
//! A [`SyncWord`] is one `u32` in shared memory. Every bit is a separate
//! condition: set means "signaled and not yet consumed".
//!
//! - `wake(b)` ORs `b` into the word and issues a futex wake only if at least
//!   one of those bits was previously clear.
//! - `wait(b)` atomically clears `b`. If any of it was set, the condition was
//!   already signaled and the call returns without blocking. Otherwise it
//!   sleeps on the futex while the word still holds the value it just saw,
//!   then clears `b` again after waking; an empty result means another waiter
//!   consumed the signal first and the wait starts over.
//!
//! Both sides only ever use `fetch_and` / `fetch_or`, never a plain
//! read-modify-write: the reader and writer may be unrelated processes.

use std::sync::atomic::AtomicU64 as StatCounter;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::futex::{self, FutexError, Timespec};
use crate::sync::{AtomicU32, Ordering};

/// A shared 32-bit condition register.
///
/// Lives inside a mapped segment; both endpoints hold non-owning references.
#[repr(transparent)]
pub struct SyncWord {
    bits: AtomicU32,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SyncWord>() == 4);

impl SyncWord {
    pub fn new(bits: u32) -> Self {
        Self {
            bits: AtomicU32::new(bits),
        }
    }

    /// Current bits (diagnostics only; the value may change immediately).
    #[inline]
    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }

    /// Set `bits` without waking anybody. Returns the previous value.
    #[inline]
    pub fn set_quiet(&self, bits: u32) -> u32 {
        self.bits.fetch_or(bits, Ordering::SeqCst)
    }

    /// Clear `bits`. Returns the previous value.
    #[inline]
    pub fn clear(&self, bits: u32) -> u32 {
        self.bits.fetch_and(!bits, Ordering::SeqCst)
    }

    /// One pass of the wait protocol.
    ///
    /// Returns [`WaitError::Interrupted`] when the futex returned without the
    /// condition being observed (signal, value change, or a wake consumed by
    /// another waiter). [`SyncWord::wait`] retries those.
    pub fn wait_once(
        &self,
        bitset: u32,
        deadline: Option<Timespec>,
        stats: &SyncStats,
    ) -> Result<(), WaitError> {
        if bitset == 0 {
            return Err(WaitError::EmptyBitset);
        }

        let old = self.clear(bitset);
        if old & bitset != 0 {
            stats.fast_path_waits.fetch_add(1, Ordering::Relaxed);
            trace!(bitset, old, "sync word already signaled");
            return Ok(());
        }

        let expected = old & !bitset;
        stats.wait_syscalls.fetch_add(1, Ordering::Relaxed);
        match futex::wait_bitset(&self.bits, expected, bitset, deadline) {
            Ok(()) => {
                let old = self.clear(bitset);
                if old & bitset == 0 {
                    trace!(bitset, old, "woken without the condition set");
                    Err(WaitError::Interrupted)
                } else {
                    Ok(())
                }
            }
            Err(FutexError::TimedOut) => Err(WaitError::TimedOut),
            Err(err) if err.is_retryable() => Err(WaitError::Interrupted),
            Err(err) => {
                let errno = match err {
                    FutexError::Os(errno) => errno,
                    _ => 0,
                };
                warn!(bitset, errno, "sync word wait failed");
                Err(WaitError::Os(errno))
            }
        }
    }

    /// Wait until any bit of `bitset` is signaled, consuming it.
    ///
    /// `timeout_ns <= 0` waits indefinitely. A positive value is converted once
    /// into an absolute monotonic deadline that every retry shares, so signals
    /// and spurious wakes never extend the total wait.
    pub fn wait(&self, bitset: u32, timeout_ns: i64, stats: &SyncStats) -> Result<(), WaitError> {
        if bitset == 0 {
            return Err(WaitError::EmptyBitset);
        }
        let deadline = (timeout_ns > 0)
            .then(|| futex::deadline_after(futex::monotonic_now(), timeout_ns));

        loop {
            match self.wait_once(bitset, deadline, stats) {
                Err(WaitError::Interrupted) => continue,
                Err(WaitError::TimedOut) => {
                    stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(bitset, timeout_ns, "sync word wait timed out");
                    return Err(WaitError::TimedOut);
                }
                other => return other,
            }
        }
    }

    /// Signal every bit of `bitset`.
    ///
    /// The bits stay set even when the futex wake itself fails, so a later
    /// waiter still observes them; the failure is reported but nothing needs
    /// to be undone.
    pub fn wake(&self, bitset: u32, stats: &SyncStats) -> Result<WakeOutcome, WakeError> {
        if bitset == 0 {
            return Err(WakeError::EmptyBitset);
        }

        let old = self.set_quiet(bitset);
        if !old & bitset == 0 {
            trace!(bitset, old, "sync word bits already set");
            return Ok(WakeOutcome::AlreadySignaled);
        }

        stats.wake_syscalls.fetch_add(1, Ordering::Relaxed);
        match futex::wake_bitset(&self.bits, bitset) {
            Ok(woken) => {
                trace!(bitset, woken, "sync word woken");
                Ok(WakeOutcome::Woken(woken))
            }
            Err(err) => {
                stats.wake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(bitset, error = %err, "sync word wake failed; bits remain set");
                let errno = match err {
                    FutexError::Os(errno) => errno,
                    _ => 0,
                };
                Err(WakeError::Os(errno))
            }
        }
    }
}

impl std::fmt::Debug for SyncWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyncWord({:#010x})", self.load())
    }
}

/// What a successful wake did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Every requested bit was already set; no syscall was issued.
    AlreadySignaled,
    /// The bits were published and a futex wake released this many waiters.
    Woken(u32),
}

/// Errors returned by a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No condition bits were requested.
    EmptyBitset,
    /// Returned without observing the condition. Only surfaced by
    /// [`SyncWord::wait_once`].
    Interrupted,
    /// The deadline passed without the condition being signaled.
    TimedOut,
    /// The futex call failed for another reason (errno).
    Os(i32),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyBitset => write!(f, "wait bitset must not be empty"),
            Self::Interrupted => write!(f, "wait interrupted before the condition was observed"),
            Self::TimedOut => write!(f, "wait timed out"),
            Self::Os(errno) => write!(f, "wait failed with errno {}", errno),
        }
    }
}

impl std::error::Error for WaitError {}

/// Errors returned by a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeError {
    /// No condition bits were given.
    EmptyBitset,
    /// The futex wake failed (errno). The bits were still published.
    Os(i32),
}

impl std::fmt::Display for WakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyBitset => write!(f, "wake bitset must not be empty"),
            Self::Os(errno) => write!(f, "wake failed with errno {} (bits remain set)", errno),
        }
    }
}

impl std::error::Error for WakeError {}

/// Per-endpoint counters (process-local, never placed in shared memory).
#[derive(Debug, Default)]
pub struct SyncStats {
    pub wait_syscalls: StatCounter,
    pub wake_syscalls: StatCounter,
    pub fast_path_waits: StatCounter,
    pub timeouts: StatCounter,
    pub wake_failures: StatCounter,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            wait_syscalls: self.wait_syscalls.load(Ordering::Relaxed),
            wake_syscalls: self.wake_syscalls.load(Ordering::Relaxed),
            fast_path_waits: self.fast_path_waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            wake_failures: self.wake_failures.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic snapshot of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub wait_syscalls: u64,
    pub wake_syscalls: u64,
    pub fast_path_waits: u64,
    pub timeouts: u64,
    pub wake_failures: u64,
}

/// Convert an optional [`Duration`] into the nanosecond timeout convention
/// (`<= 0` waits forever).
pub fn timeout_nanos(timeout: Option<Duration>) -> i64 {
    match timeout {
        None => 0,
        Some(d) if d.is_zero() => 1,
        Some(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn wait_rejects_empty_bitset() {
        let word = SyncWord::new(0);
        let stats = SyncStats::default();
        assert_eq!(word.wait(0, 0, &stats), Err(WaitError::EmptyBitset));
        assert_eq!(word.wait_once(0, None, &stats), Err(WaitError::EmptyBitset));
        assert_eq!(stats.snapshot(), SyncStatsSnapshot::default());
    }

    #[test]
    fn wait_consumes_pending_signal_without_syscall() {
        let word = SyncWord::new(0b101);
        let stats = SyncStats::default();
        assert_eq!(word.wait(0b001, 0, &stats), Ok(()));
        assert_eq!(word.load(), 0b100);

        let snap = stats.snapshot();
        assert_eq!(snap.fast_path_waits, 1);
        assert_eq!(snap.wait_syscalls, 0);
    }

    #[test]
    fn timed_out_wait_leaves_other_bits_alone() {
        let word = SyncWord::new(0b100);
        let stats = SyncStats::default();
        assert_eq!(word.wait(0b001, 2_000_000, &stats), Err(WaitError::TimedOut));
        assert_eq!(word.load(), 0b100);
        assert_eq!(stats.snapshot().timeouts, 1);
    }

    #[test]
    fn second_wake_is_a_no_op() {
        let word = SyncWord::new(0);
        let stats = SyncStats::default();

        assert!(matches!(word.wake(0b10, &stats), Ok(WakeOutcome::Woken(0))));
        assert_eq!(word.wake(0b10, &stats), Ok(WakeOutcome::AlreadySignaled));
        assert_eq!(word.load(), 0b10);
        assert_eq!(stats.snapshot().wake_syscalls, 1);
    }

    #[test]
    fn partially_set_wake_still_signals() {
        let word = SyncWord::new(0b01);
        let stats = SyncStats::default();
        assert!(matches!(word.wake(0b11, &stats), Ok(WakeOutcome::Woken(_))));
        assert_eq!(word.load(), 0b11);
    }

    #[test]
    fn wake_rejects_empty_bitset() {
        let word = SyncWord::new(0);
        let stats = SyncStats::default();
        assert_eq!(word.wake(0, &stats), Err(WakeError::EmptyBitset));
    }

    /// Issue bare futex wakes on `word` every few milliseconds until `done`,
    /// without setting any bit: what a waiter sees when a competing waiter
    /// consumed the signal first.
    #[cfg(target_os = "linux")]
    fn stale_wakes_until(word: &SyncWord, done: &std::sync::atomic::AtomicBool) {
        while !done.load(std::sync::atomic::Ordering::Acquire) {
            let _ = futex::wake_bitset(&word.bits, 0b1);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn wake_without_the_bit_is_reported_as_interrupted() {
        use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};

        let word = SyncWord::new(0);
        let stats = SyncStats::default();
        let done = AtomicBool::new(false);
        let deadline = futex::deadline_after(futex::monotonic_now(), 2_000_000_000);

        let result = std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let r = word.wait_once(0b1, Some(deadline), &stats);
                done.store(true, StdOrdering::Release);
                r
            });
            stale_wakes_until(&word, &done);
            waiter.join().unwrap()
        });

        assert_eq!(result, Err(WaitError::Interrupted));
        assert_eq!(word.load(), 0);
        assert_eq!(stats.snapshot().wait_syscalls, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_wakes_do_not_extend_the_deadline() {
        use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
        use std::time::Instant;

        let word = SyncWord::new(0);
        let stats = SyncStats::default();
        let done = AtomicBool::new(false);
        let timeout = Duration::from_millis(100);

        let (result, elapsed) = std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let start = Instant::now();
                let r = word.wait(0b1, timeout.as_nanos() as i64, &stats);
                done.store(true, StdOrdering::Release);
                (r, start.elapsed())
            });
            stale_wakes_until(&word, &done);
            waiter.join().unwrap()
        });

        assert_eq!(result, Err(WaitError::TimedOut));
        assert!(elapsed >= timeout, "returned early: {:?}", elapsed);
        assert!(
            elapsed < timeout + Duration::from_millis(100),
            "retries stretched the wait: {:?}",
            elapsed
        );
        let snap = stats.snapshot();
        assert!(snap.wait_syscalls > 1, "no retry observed: {:?}", snap);
        assert_eq!(snap.timeouts, 1);
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_nanos(None), 0);
        assert_eq!(timeout_nanos(Some(Duration::ZERO)), 1);
        assert_eq!(timeout_nanos(Some(Duration::from_millis(3))), 3_000_000);
        assert_eq!(timeout_nanos(Some(Duration::MAX)), i64::MAX);
    }
}
