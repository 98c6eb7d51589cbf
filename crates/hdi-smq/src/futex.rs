//! Bitset futex wait/wake.
//!
//! On Linux these are the real `FUTEX_WAIT_BITSET` / `FUTEX_WAKE_BITSET`
//! operations. The futex is *shared* (no `FUTEX_PRIVATE_FLAG`): the word lives
//! in a mapping that other processes also see, and the kernel keys waiters by
//! the backing page rather than by this process's address space.
//!
//! A waiter registers a bitset and is released only by a wake whose bitset
//! overlaps it (`wait_bits & wake_bits != 0`). This is what lets one word carry
//! several independent conditions.
//!
//! Other platforms fall back to [`parking`], which emulates the overlap rule
//! with condition variables keyed by address. The fallback only sees waiters in
//! the current process.

use std::time::Duration;

use crate::sync::AtomicU32;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A point on the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    /// Signed distance from `self` to `later`, in nanoseconds.
    pub fn nanos_until(self, later: Timespec) -> i64 {
        (later.sec - self.sec)
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(later.nsec - self.nsec)
    }
}

/// Errors from a single futex call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    /// `EINTR`: a signal arrived while blocked.
    Interrupted,
    /// `EAGAIN`: the word no longer held the expected value at entry.
    Changed,
    /// `ETIMEDOUT`: the absolute deadline passed.
    TimedOut,
    /// Any other errno.
    Os(i32),
}

impl FutexError {
    /// `EINTR` and `EAGAIN` are absorbed by the sync word's retry loop.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, FutexError::Interrupted | FutexError::Changed)
    }

    #[cfg(all(target_os = "linux", not(feature = "loom")))]
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINTR => FutexError::Interrupted,
            libc::EAGAIN => FutexError::Changed,
            libc::ETIMEDOUT => FutexError::TimedOut,
            other => FutexError::Os(other),
        }
    }
}

impl std::fmt::Display for FutexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupted => write!(f, "futex wait interrupted"),
            Self::Changed => write!(f, "futex word changed before sleeping"),
            Self::TimedOut => write!(f, "futex wait timed out"),
            Self::Os(errno) => write!(f, "futex failed with errno {}", errno),
        }
    }
}

impl std::error::Error for FutexError {}

/// Compute the absolute deadline `timeout_ns` after `now`.
///
/// `timeout_ns` must be positive and `now.nsec` in `0..NSEC_PER_SEC`. The
/// nanosecond part is carried into seconds so the result is always normalized,
/// and second arithmetic saturates instead of overflowing.
pub fn deadline_after(now: Timespec, timeout_ns: i64) -> Timespec {
    let mut sec = now.sec.saturating_add(timeout_ns / NSEC_PER_SEC);
    let mut rem = timeout_ns % NSEC_PER_SEC;
    if now.nsec + rem >= NSEC_PER_SEC {
        sec = sec.saturating_add(1);
        rem -= NSEC_PER_SEC;
    }
    Timespec {
        sec,
        nsec: now.nsec + rem,
    }
}

/// Current `CLOCK_MONOTONIC` time.
#[cfg(unix)]
pub fn monotonic_now() -> Timespec {
    // SAFETY: all-zero is a valid `timespec`.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: CLOCK_MONOTONIC always exists and `ts` is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    Timespec {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    }
}

/// Current monotonic time, measured from the first call in this process.
#[cfg(not(unix))]
pub fn monotonic_now() -> Timespec {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BASE: OnceLock<Instant> = OnceLock::new();
    let elapsed = BASE.get_or_init(Instant::now).elapsed();
    Timespec {
        sec: elapsed.as_secs() as i64,
        nsec: elapsed.subsec_nanos() as i64,
    }
}

/// Nanoseconds left until `deadline`; zero or negative once it has passed.
#[inline]
pub fn remaining_nanos(deadline: Timespec) -> i64 {
    monotonic_now().nanos_until(deadline)
}

/// Block while `*word == expected` until a wake whose bitset overlaps `bitset`
/// or until `deadline`.
pub fn wait_bitset(
    word: &AtomicU32,
    expected: u32,
    bitset: u32,
    deadline: Option<Timespec>,
) -> Result<(), FutexError> {
    imp::wait(word, expected, bitset, deadline)
}

/// Release every waiter whose bitset overlaps `bitset`. Returns how many were
/// woken.
pub fn wake_bitset(word: &AtomicU32, bitset: u32) -> Result<u32, FutexError> {
    imp::wake(word, bitset)
}

#[cfg(all(target_os = "linux", not(feature = "loom")))]
mod imp {
    use std::{io, ptr};

    use super::{FutexError, Timespec};
    use crate::sync::AtomicU32;

    fn last_error() -> FutexError {
        FutexError::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub(super) fn wait(
        word: &AtomicU32,
        expected: u32,
        bitset: u32,
        deadline: Option<Timespec>,
    ) -> Result<(), FutexError> {
        let ts = deadline.map(|deadline| {
            // SAFETY: all-zero is a valid `timespec`.
            let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
            ts.tv_sec = deadline.sec as _;
            ts.tv_nsec = deadline.nsec as _;
            ts
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: `word` is a live, 4-byte aligned u32. The kernel only reads
        // it and the timespec, and FUTEX_WAIT_BITSET ignores uaddr2.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT_BITSET,
                expected,
                ts_ptr,
                ptr::null::<u32>(),
                bitset,
            )
        };
        if rc == 0 { Ok(()) } else { Err(last_error()) }
    }

    pub(super) fn wake(word: &AtomicU32, bitset: u32) -> Result<u32, FutexError> {
        // SAFETY: as above; FUTEX_WAKE_BITSET ignores the timeout and uaddr2.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE_BITSET,
                i32::MAX,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                bitset,
            )
        };
        if rc >= 0 {
            Ok(rc as u32)
        } else {
            Err(last_error())
        }
    }
}

#[cfg(all(not(target_os = "linux"), not(feature = "loom")))]
mod imp {
    use super::{FutexError, Timespec, parking};
    use crate::sync::AtomicU32;

    pub(super) fn wait(
        word: &AtomicU32,
        expected: u32,
        bitset: u32,
        deadline: Option<Timespec>,
    ) -> Result<(), FutexError> {
        parking::wait(word, expected, bitset, deadline)
    }

    pub(super) fn wake(word: &AtomicU32, bitset: u32) -> Result<u32, FutexError> {
        parking::wake(word, bitset)
    }
}

// Under loom every wait is a spurious return after a yield; the sync word's
// re-check loop has to cope with that anyway.
#[cfg(feature = "loom")]
mod imp {
    use super::{FutexError, Timespec};
    use crate::sync::AtomicU32;

    pub(super) fn wait(
        _word: &AtomicU32,
        _expected: u32,
        _bitset: u32,
        _deadline: Option<Timespec>,
    ) -> Result<(), FutexError> {
        loom::thread::yield_now();
        Ok(())
    }

    pub(super) fn wake(_word: &AtomicU32, _bitset: u32) -> Result<u32, FutexError> {
        Ok(0)
    }
}

/// Process-local emulation of bitset futexes.
///
/// Waiters park on one of a fixed set of condition variables chosen by the
/// word's address. A waiter returns once any bit of its bitset is set in the
/// word, which gives the same overlap rule as the kernel primitive.
#[cfg(not(feature = "loom"))]
pub mod parking {
    use parking_lot::{Condvar, Mutex};

    use super::{Duration, FutexError, Timespec, remaining_nanos};
    use crate::sync::{AtomicU32, Ordering};

    const BUCKETS: usize = 64;

    struct Bucket {
        lock: Mutex<()>,
        cond: Condvar,
    }

    impl Bucket {
        const fn new() -> Self {
            Self {
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }
        }
    }

    static TABLE: [Bucket; BUCKETS] = [const { Bucket::new() }; BUCKETS];

    fn bucket_for(word: &AtomicU32) -> &'static Bucket {
        let addr = word.as_ptr() as usize;
        &TABLE[(addr >> 2) % BUCKETS]
    }

    pub fn wait(
        word: &AtomicU32,
        expected: u32,
        bitset: u32,
        deadline: Option<Timespec>,
    ) -> Result<(), FutexError> {
        let bucket = bucket_for(word);
        let mut guard = bucket.lock.lock();
        if word.load(Ordering::SeqCst) != expected {
            return Err(FutexError::Changed);
        }
        loop {
            if word.load(Ordering::SeqCst) & bitset != 0 {
                return Ok(());
            }
            match deadline {
                None => bucket.cond.wait(&mut guard),
                Some(deadline) => {
                    let remaining = remaining_nanos(deadline);
                    if remaining <= 0 {
                        return Err(FutexError::TimedOut);
                    }
                    let _ = bucket
                        .cond
                        .wait_for(&mut guard, Duration::from_nanos(remaining as u64));
                }
            }
        }
    }

    pub fn wake(word: &AtomicU32, _bitset: u32) -> Result<u32, FutexError> {
        let bucket = bucket_for(word);
        // Taking the lock orders this wake after any waiter's value check.
        let _guard = bucket.lock.lock();
        Ok(bucket.cond.notify_all() as u32)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn deadline_without_carry() {
        let now = Timespec { sec: 10, nsec: 100 };
        assert_eq!(
            deadline_after(now, 2 * NSEC_PER_SEC + 50),
            Timespec { sec: 12, nsec: 150 }
        );
    }

    #[test]
    fn deadline_carries_into_seconds() {
        let now = Timespec {
            sec: 5,
            nsec: 500_000_000,
        };
        assert_eq!(
            deadline_after(now, 1_700_000_000),
            Timespec {
                sec: 7,
                nsec: 200_000_000
            }
        );

        let edge = Timespec {
            sec: 5,
            nsec: NSEC_PER_SEC - 1,
        };
        assert_eq!(deadline_after(edge, 1), Timespec { sec: 6, nsec: 0 });
    }

    #[test]
    fn deadline_saturates_on_huge_timeouts() {
        let now = Timespec {
            sec: i64::MAX - 1,
            nsec: 999_999_999,
        };
        let deadline = deadline_after(now, i64::MAX);
        assert_eq!(deadline.sec, i64::MAX);
        assert!(deadline.nsec >= 0 && deadline.nsec < NSEC_PER_SEC);
    }

    #[test]
    fn nanos_until_is_signed() {
        let a = Timespec { sec: 1, nsec: 0 };
        let b = Timespec {
            sec: 2,
            nsec: 500,
        };
        assert_eq!(a.nanos_until(b), NSEC_PER_SEC + 500);
        assert_eq!(b.nanos_until(a), -(NSEC_PER_SEC + 500));
    }

    #[test]
    fn wait_on_stale_value_reports_change() {
        let word = AtomicU32::new(1);
        assert_eq!(
            wait_bitset(&word, 0, 1, None),
            Err(FutexError::Changed)
        );
    }

    #[test]
    fn wait_times_out_at_deadline() {
        let word = AtomicU32::new(0);
        let deadline = deadline_after(monotonic_now(), 5_000_000);
        assert_eq!(
            wait_bitset(&word, 0, 1, Some(deadline)),
            Err(FutexError::TimedOut)
        );
        assert!(remaining_nanos(deadline) <= 0);
    }

    #[test]
    fn wake_without_waiters_wakes_nobody() {
        let word = AtomicU32::new(0);
        assert_eq!(wake_bitset(&word, 1), Ok(0));
    }

    #[test]
    fn parking_fallback_honours_bitset() {
        use crate::sync::Ordering;
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let word = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let word = word.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                let result = loop {
                    let current = word.load(Ordering::SeqCst);
                    match parking::wait(&word, current, 0b10, None) {
                        Err(FutexError::Changed) => continue,
                        other => break other,
                    }
                };
                released.store(true, Ordering::SeqCst);
                result
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        word.fetch_or(0b01, Ordering::SeqCst);
        parking::wake(&word, 0b01).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!released.load(Ordering::SeqCst));

        word.fetch_or(0b10, Ordering::SeqCst);
        parking::wake(&word, 0b10).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn parking_fallback_times_out() {
        let word = AtomicU32::new(0);
        let deadline = deadline_after(monotonic_now(), 2_000_000);
        assert_eq!(
            parking::wait(&word, 0, 1, Some(deadline)),
            Err(FutexError::TimedOut)
        );
    }
}
