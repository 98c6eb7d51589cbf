//! Single-producer single-consumer ring in shared memory.
//!
//! The header (positions and capacity) lives in the region next to the
//! entries. The peer may rewrite any of it, so the geometry is copied into
//! the local [`SpscRing`] at `init`/`attach` and every position read from
//! the header is checked against that copy before it is used to address an
//! entry. A position outside the ring is treated as corruption: nothing is
//! copied and a warning is logged.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr;

use tracing::warn;

use crate::queue::LayoutError;
use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// Ring indices, one cache line each so the producer and consumer never
/// write the same line.
#[repr(C)]
pub struct SpscRingHeader {
    /// Elements published so far (written by the producer only).
    pub write_pos: AtomicU64,
    _pad1: [u8; 56],

    /// Elements consumed so far (written by the consumer only).
    pub read_pos: AtomicU64,
    _pad2: [u8; 56],

    /// Slot count, a power of two fixed at init.
    pub capacity: u32,
    _pad3: [u8; 60],
}

#[cfg(not(feature = "loom"))]
static_assertions::const_assert_eq!(size_of::<SpscRingHeader>(), 192);

impl SpscRingHeader {
    fn new(capacity: u32) -> Self {
        Self {
            write_pos: AtomicU64::new(0),
            _pad1: [0; 56],
            read_pos: AtomicU64::new(0),
            _pad2: [0; 56],
            capacity,
            _pad3: [0; 60],
        }
    }

    /// Elements published and not yet consumed.
    #[inline]
    pub fn len(&self) -> u64 {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A lock-free single-producer single-consumer ring of `T` placed in a
/// [`Region`].
///
/// The ring never takes ownership of the memory: positions and entries live
/// entirely in the region, so two processes that map the same bytes and
/// attach at the same offset operate on the same ring.
pub struct SpscRing<T> {
    region: Region,
    header_offset: usize,
    entries_offset: usize,
    // Local copy taken at init/attach; the header's copy is never trusted.
    capacity: u32,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Bytes needed for a ring of `capacity` elements, header included.
    pub const fn required_len(capacity: u32) -> usize {
        size_of::<SpscRingHeader>() + capacity as usize * size_of::<T>()
    }

    /// Initialize an empty ring at `header_offset`.
    ///
    /// # Safety
    ///
    /// The region must be writable and not yet shared with the peer.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a non-zero power of two, the offset is not
    /// 64-byte aligned, or the region is too small.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        assert!(
            header_offset.is_multiple_of(64),
            "ring header must be 64-byte aligned"
        );
        assert!(align_of::<T>() <= 64, "entry alignment must be <= 64");
        assert!(
            header_offset + Self::required_len(capacity) <= region.len(),
            "region too small for ring"
        );

        // SAFETY: in bounds and aligned (checked above); exclusive per the
        // caller's contract. `write` so the zeroed bytes are never dropped.
        unsafe {
            ptr::write(
                region.offset(header_offset) as *mut SpscRingHeader,
                SpscRingHeader::new(capacity),
            );
        }

        Self {
            region,
            header_offset,
            entries_offset: header_offset + size_of::<SpscRingHeader>(),
            capacity,
            _marker: PhantomData,
        }
    }

    /// Attach to a ring some other endpoint initialized.
    ///
    /// # Safety
    ///
    /// The bytes at `header_offset` must hold a ring header written by
    /// [`SpscRing::init`] for the same `T`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, LayoutError> {
        if !header_offset.is_multiple_of(64)
            || header_offset + size_of::<SpscRingHeader>() > region.len()
        {
            return Err(LayoutError::RegionTooSmall {
                required: header_offset + size_of::<SpscRingHeader>(),
                actual: region.len(),
            });
        }

        // SAFETY: bounds checked above; contents guaranteed by the caller.
        let capacity = unsafe { region.get::<SpscRingHeader>(header_offset) }.capacity;
        if !capacity.is_power_of_two() {
            return Err(LayoutError::InvalidCapacity(capacity));
        }
        let required = header_offset + Self::required_len(capacity);
        if required > region.len() {
            return Err(LayoutError::RegionTooSmall {
                required,
                actual: region.len(),
            });
        }

        Ok(Self {
            region,
            header_offset,
            entries_offset: header_offset + size_of::<SpscRingHeader>(),
            capacity,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &SpscRingHeader {
        // SAFETY: validated by init/attach.
        unsafe { self.region.get::<SpscRingHeader>(self.header_offset) }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    #[inline]
    fn entry_ptr(&self, slot: usize) -> *mut T {
        debug_assert!(slot < self.capacity as usize);
        // SAFETY: slot < capacity, so the entry lies inside the region.
        unsafe {
            self.region
                .offset(self.entries_offset)
                .add(slot * size_of::<T>()) as *mut T
        }
    }

    /// The producing half. Only one may exist across all mappings.
    pub fn producer(&self) -> SpscProducer<'_, T> {
        SpscProducer {
            ring: self,
            local_write: self.header().write_pos.load(Ordering::Acquire),
        }
    }

    /// The consuming half. Only one may exist across all mappings.
    pub fn consumer(&self) -> SpscConsumer<'_, T> {
        SpscConsumer {
            ring: self,
            local_read: self.header().read_pos.load(Ordering::Acquire),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.header().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header().is_empty()
    }

    pub fn status(&self) -> RingStatus {
        let header = self.header();
        let write_pos = header.write_pos.load(Ordering::Acquire);
        let read_pos = header.read_pos.load(Ordering::Acquire);
        RingStatus {
            write_pos,
            read_pos,
            capacity: self.capacity,
            len: write_pos.wrapping_sub(read_pos) as u32,
        }
    }

    /// Copy `src` into the ring starting at absolute position `pos`, splitting
    /// at the wrap point.
    fn copy_in(&self, pos: u64, src: &[T]) {
        let mask = self.mask();
        let cap = self.capacity as usize;
        debug_assert!(src.len() <= cap);
        let start = (pos & mask) as usize;
        let first = src.len().min(cap - start);
        // SAFETY: both runs stay inside the entry array, and the producer owns
        // these slots until it publishes them.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.entry_ptr(start), first);
            ptr::copy_nonoverlapping(
                src.as_ptr().add(first),
                self.entry_ptr(0),
                src.len() - first,
            );
        }
    }

    fn copy_out(&self, pos: u64, dst: &mut [T]) {
        let mask = self.mask();
        let cap = self.capacity as usize;
        debug_assert!(dst.len() <= cap);
        let start = (pos & mask) as usize;
        let first = dst.len().min(cap - start);
        // SAFETY: as copy_in; the consumer owns published slots until it
        // advances read_pos.
        unsafe {
            ptr::copy_nonoverlapping(self.entry_ptr(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(
                self.entry_ptr(0),
                dst.as_mut_ptr().add(first),
                dst.len() - first,
            );
        }
    }
}

/// Producer handle. Publishes with a release store of `write_pos`.
pub struct SpscProducer<'a, T> {
    ring: &'a SpscRing<T>,
    local_write: u64,
}

/// Consumer handle. Frees slots with a release store of `read_pos`.
pub struct SpscConsumer<'a, T> {
    ring: &'a SpscRing<T>,
    local_read: u64,
}

impl<T: Copy> SpscProducer<'_, T> {
    /// Slots the producer can fill right now.
    #[inline]
    ///
    /// A peer-written `read_pos` ahead of our writes or more than a ring
    /// behind them reports no space.
    pub fn free_space(&self) -> usize {
        let read = self.ring.header().read_pos.load(Ordering::Acquire);
        let used = self.local_write.wrapping_sub(read);
        let cap = self.ring.capacity as u64;
        if used > cap {
            warn!(
                write = self.local_write,
                read, capacity = cap, "ring read position out of range"
            );
            return 0;
        }
        (cap - used) as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Push one element, handing it back when the ring is full.
    pub fn try_push(&mut self, entry: T) -> Result<(), T> {
        if self.push_slice(core::slice::from_ref(&entry)) == 1 {
            Ok(())
        } else {
            Err(entry)
        }
    }

    /// Push as many leading elements of `items` as fit. Returns the count.
    ///
    /// All of them become visible to the consumer at once.
    pub fn push_slice(&mut self, items: &[T]) -> usize {
        let n = items.len().min(self.free_space());
        if n == 0 {
            return 0;
        }
        self.ring.copy_in(self.local_write, &items[..n]);
        self.local_write = self.local_write.wrapping_add(n as u64);
        self.ring
            .header()
            .write_pos
            .store(self.local_write, Ordering::Release);
        n
    }
}

impl<T: Copy> SpscConsumer<'_, T> {
    /// Elements available to pop right now.
    #[inline]
    ///
    /// A peer-written `write_pos` behind our reads or more than a ring ahead
    /// of them reports nothing available.
    pub fn available(&self) -> usize {
        let write = self.ring.header().write_pos.load(Ordering::Acquire);
        let published = write.wrapping_sub(self.local_read);
        let cap = self.ring.capacity as u64;
        if published > cap {
            warn!(
                write,
                read = self.local_read,
                capacity = cap,
                "ring write position out of range"
            );
            return 0;
        }
        published as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let header = self.ring.header();
        let slot = (self.local_read & self.ring.mask()) as usize;
        // SAFETY: the slot was published by the producer (acquire in
        // is_empty) and is not reused until read_pos moves past it.
        let entry = unsafe { ptr::read(self.ring.entry_ptr(slot)) };
        self.local_read = self.local_read.wrapping_add(1);
        header.read_pos.store(self.local_read, Ordering::Release);
        Some(entry)
    }

    /// Pop up to `dst.len()` elements into `dst`. Returns the count.
    pub fn pop_slice(&mut self, dst: &mut [T]) -> usize {
        let n = dst.len().min(self.available());
        if n == 0 {
            return 0;
        }
        self.ring.copy_out(self.local_read, &mut dst[..n]);
        self.local_read = self.local_read.wrapping_add(n as u64);
        self.ring
            .header()
            .read_pos
            .store(self.local_read, Ordering::Release);
        n
    }
}

/// Snapshot of ring positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub write_pos: u64,
    pub read_pos: u64,
    pub capacity: u32,
    pub len: u32,
}

impl std::fmt::Display for RingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write={} read={} len={}/{}",
            self.write_pos, self.read_pos, self.len, self.capacity
        )
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    #[test]
    fn push_pop_in_order() {
        let owner = HeapRegion::new_zeroed(4096);
        let ring: SpscRing<u32> = unsafe { SpscRing::init(owner.region(), 0, 4) };
        let mut tx = ring.producer();
        let mut rx = ring.consumer();

        for i in 0..4 {
            tx.try_push(i).unwrap();
        }
        assert_eq!(tx.try_push(99), Err(99));
        assert!(tx.is_full());
        assert_eq!(ring.len(), 4);

        for i in 0..4 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn slices_wrap_around_the_end() {
        let owner = HeapRegion::new_zeroed(4096);
        let ring: SpscRing<u16> = unsafe { SpscRing::init(owner.region(), 64, 8) };
        let mut tx = ring.producer();
        let mut rx = ring.consumer();

        assert_eq!(tx.push_slice(&[1, 2, 3, 4, 5, 6]), 6);
        let mut buf = [0u16; 5];
        assert_eq!(rx.pop_slice(&mut buf), 5);
        assert_eq!(buf, [1, 2, 3, 4, 5]);

        // Positions 6..13 straddle the wrap at 8.
        assert_eq!(tx.push_slice(&[7, 8, 9, 10, 11, 12, 13, 14, 15]), 7);
        let mut out = [0u16; 16];
        let n = rx.pop_slice(&mut out);
        assert_eq!(&out[..n], &[6, 7, 8, 9, 10, 11, 12, 13]);

        let status = ring.status();
        assert_eq!(status.write_pos, 13);
        assert_eq!(status.read_pos, 13);
        assert_eq!(status.to_string(), "write=13 read=13 len=0/8");
    }

    #[test]
    fn attached_view_shares_state() {
        let owner = HeapRegion::new_zeroed(4096);
        let ring: SpscRing<u64> = unsafe { SpscRing::init(owner.region(), 0, 16) };
        let peer: SpscRing<u64> = unsafe { SpscRing::attach(owner.region(), 0) }.unwrap();
        assert_eq!(peer.capacity(), 16);

        ring.producer().push_slice(&[10, 20, 30]);
        let mut rx = peer.consumer();
        assert_eq!(rx.available(), 3);
        assert_eq!(rx.try_pop(), Some(10));
        assert_eq!(ring.producer().free_space(), 14);
    }

    #[test]
    fn attach_rejects_garbage_capacity() {
        let owner = HeapRegion::new_zeroed(4096);
        let region = owner.region();
        unsafe { *region.get_mut::<u32>(128) = 12 };
        let err = unsafe { SpscRing::<u8>::attach(region, 0) }.err();
        assert_eq!(err, Some(LayoutError::InvalidCapacity(12)));
    }

    #[test]
    fn attach_rejects_short_region() {
        let owner = HeapRegion::new_zeroed(256);
        let region = owner.region();
        unsafe { *region.get_mut::<u32>(128) = 1024 };
        assert!(matches!(
            unsafe { SpscRing::<u64>::attach(region, 0) },
            Err(LayoutError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn positions_outside_the_ring_are_ignored() {
        let owner = HeapRegion::new_zeroed(4096);
        let region = owner.region();
        let ring: SpscRing<u32> = unsafe { SpscRing::init(region, 0, 4) };
        let header = unsafe { region.get::<SpscRingHeader>(0) };
        let mut tx = ring.producer();
        let mut rx = ring.consumer();
        assert_eq!(tx.push_slice(&[1, 2]), 2);

        // read_pos ahead of every write.
        header.read_pos.store(50, Ordering::Release);
        assert_eq!(tx.free_space(), 0);
        assert_eq!(tx.push_slice(&[3; 8]), 0);

        // write_pos a full lap ahead of the consumer.
        header.write_pos.store(2 + 4 + 1, Ordering::Release);
        let mut out = [0u32; 8];
        assert_eq!(rx.available(), 0);
        assert_eq!(rx.pop_slice(&mut out), 0);
        assert_eq!(rx.try_pop(), None);

        // Back in range, the real data is still there.
        header.write_pos.store(2, Ordering::Release);
        assert_eq!(rx.pop_slice(&mut out), 2);
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn init_rejects_odd_capacity() {
        let owner = HeapRegion::new_zeroed(4096);
        let _ = unsafe { SpscRing::<u8>::init(owner.region(), 0, 3) };
    }
}
