//! Blocking single-producer single-consumer queue in shared memory.
//!
//! Segment layout:
//!
//! ```text
//! [QueueHeader: 64][SpscRingHeader: 192][capacity * size_of::<T>()]
//! ```
//!
//! The header's sync word carries three conditions. The writer waits on
//! [`QueueBits::SPACE_AVAILABLE`] and signals [`QueueBits::DATA_AVAILABLE`];
//! the reader does the opposite. [`QueueBits::SHUTDOWN`] is set once and never
//! cleared, and is only ever inspected, not waited on, so waking for it
//! cannot consume it.

use core::mem::{align_of, size_of};
use core::ptr;
use std::sync::atomic::AtomicBool;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::futex::{self, Timespec};
use crate::meta::QueueMeta;
use crate::region::Region;
use crate::spsc::{RingStatus, SpscConsumer, SpscProducer, SpscRing};
use crate::sync::Ordering;
use crate::syncer::SharedMemQueueSyncer;
use crate::syncword::{SyncStatsSnapshot, SyncWord, WaitError};

/// Magic bytes at offset 0 of every queue segment.
pub const QUEUE_MAGIC: [u8; 8] = *b"HDISMQ\0\0";
/// Layout version.
pub const QUEUE_VERSION: u32 = 1;

bitflags! {
    /// Condition bits of the queue's sync word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueBits: u32 {
        const DATA_AVAILABLE = 1;
        const SPACE_AVAILABLE = 1 << 1;
        const SHUTDOWN = 1 << 2;
    }
}

/// Queue segment header (64 bytes, one cache line).
#[repr(C, align(64))]
pub struct QueueHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub element_size: u32,
    pub capacity: u32,
    pub sync_word: SyncWord,
    _reserved: [u8; 40],
}

#[cfg(not(feature = "loom"))]
static_assertions::const_assert_eq!(size_of::<QueueHeader>(), 64);

const RING_OFFSET: usize = size_of::<QueueHeader>();

impl QueueHeader {
    fn new(capacity: u32, element_size: u32) -> Self {
        Self {
            magic: QUEUE_MAGIC,
            version: QUEUE_VERSION,
            element_size,
            capacity,
            sync_word: SyncWord::new(0),
            _reserved: [0; 40],
        }
    }

    /// Check magic, version, and element geometry against `T`.
    pub fn validate<T>(&self) -> Result<(), LayoutError> {
        if self.magic != QUEUE_MAGIC {
            return Err(LayoutError::BadMagic(self.magic));
        }
        if self.version != QUEUE_VERSION {
            return Err(LayoutError::UnsupportedVersion(self.version));
        }
        if self.element_size as usize != size_of::<T>() {
            return Err(LayoutError::ElementSizeMismatch {
                expected: size_of::<T>() as u32,
                found: self.element_size,
            });
        }
        if !self.capacity.is_power_of_two() {
            return Err(LayoutError::InvalidCapacity(self.capacity));
        }
        Ok(())
    }
}

/// Settings for [`SharedMemQueue::create`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Element slots; must be a non-zero power of two.
    pub capacity: u32,
    /// Label carried in [`QueueMeta`] so the peer can tell queues apart.
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            name: String::from("smq"),
        }
    }
}

/// A blocking SPSC queue of `T` over a shared region.
///
/// Each process builds its own `SharedMemQueue` over its own mapping of the
/// segment: one side with [`create`](Self::create), the peer with
/// [`attach`](Self::attach). Within a process, [`writer`](Self::writer) and
/// [`reader`](Self::reader) each hand out at most one live endpoint.
pub struct SharedMemQueue<T> {
    region: Region,
    ring: SpscRing<T>,
    syncer: SharedMemQueueSyncer<'static>,
    name: String,
    writer_taken: AtomicBool,
    reader_taken: AtomicBool,
}

impl<T: Copy> SharedMemQueue<T> {
    /// Segment bytes needed for `capacity` elements.
    pub const fn required_len(capacity: u32) -> usize {
        RING_OFFSET + SpscRing::<T>::required_len(capacity)
    }

    /// Lay out a fresh queue in `region`.
    ///
    /// # Safety
    ///
    /// The region must be writable, not concurrently accessed during the call,
    /// and must outlive the returned queue and every endpoint and syncer
    /// derived from it.
    pub unsafe fn create(region: Region, config: &QueueConfig) -> Result<Self, LayoutError> {
        check_element::<T>()?;
        if !config.capacity.is_power_of_two() {
            return Err(LayoutError::InvalidCapacity(config.capacity));
        }
        let required = Self::required_len(config.capacity);
        if required > region.len() {
            return Err(LayoutError::RegionTooSmall {
                required,
                actual: region.len(),
            });
        }

        let header_ptr = region.as_ptr() as *mut QueueHeader;
        // SAFETY: region is 64-byte aligned and large enough (checked above);
        // exclusive per the caller's contract.
        unsafe {
            ptr::write(
                header_ptr,
                QueueHeader::new(config.capacity, size_of::<T>() as u32),
            );
        }
        // SAFETY: same contract; geometry validated above so init cannot panic.
        let ring = unsafe { SpscRing::init(region, RING_OFFSET, config.capacity) };
        // SAFETY: the header was just written; it lives as long as the region.
        let syncer = unsafe { SharedMemQueueSyncer::from_raw(&raw const (*header_ptr).sync_word) };

        debug!(
            name = %config.name,
            capacity = config.capacity,
            element_size = size_of::<T>(),
            "created shared memory queue"
        );
        Ok(Self::assemble(region, ring, syncer, config.name.clone()))
    }

    /// Attach to a queue the peer created, checking it against the descriptor
    /// the peer sent.
    ///
    /// # Safety
    ///
    /// As [`create`](Self::create), except that the region is expected to be
    /// shared already; its header must have been written by `create`.
    pub unsafe fn attach(region: Region, meta: &QueueMeta) -> Result<Self, LayoutError> {
        check_element::<T>()?;
        if region.len() < RING_OFFSET {
            return Err(LayoutError::RegionTooSmall {
                required: RING_OFFSET,
                actual: region.len(),
            });
        }

        // SAFETY: in bounds; contents checked right after.
        let header = unsafe { region.get::<QueueHeader>(0) };
        header.validate::<T>()?;
        if header.capacity != meta.capacity
            || header.element_size != meta.element_size
            || (region.len() as u64) < meta.segment_len
        {
            return Err(LayoutError::MetaMismatch);
        }

        // SAFETY: the ring header follows a validated queue header.
        let ring = unsafe { SpscRing::<T>::attach(region, RING_OFFSET) }?;
        if ring.capacity() != header.capacity {
            return Err(LayoutError::InvalidCapacity(ring.capacity()));
        }
        // SAFETY: the header stays mapped for the region's lifetime.
        let syncer = unsafe { SharedMemQueueSyncer::from_raw(&header.sync_word) };

        debug!(name = %meta.name, capacity = header.capacity, "attached shared memory queue");
        Ok(Self::assemble(region, ring, syncer, meta.name.clone()))
    }

    fn assemble(
        region: Region,
        ring: SpscRing<T>,
        syncer: SharedMemQueueSyncer<'static>,
        name: String,
    ) -> Self {
        Self {
            region,
            ring,
            syncer,
            name,
            writer_taken: AtomicBool::new(false),
            reader_taken: AtomicBool::new(false),
        }
    }

    /// The producing endpoint.
    pub fn writer(&self) -> Result<QueueWriter<'_, T>, QueueError> {
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            return Err(QueueError::EndpointTaken);
        }
        Ok(QueueWriter {
            queue: self,
            producer: self.ring.producer(),
        })
    }

    /// The consuming endpoint.
    pub fn reader(&self) -> Result<QueueReader<'_, T>, QueueError> {
        if self.reader_taken.swap(true, Ordering::AcqRel) {
            return Err(QueueError::EndpointTaken);
        }
        Ok(QueueReader {
            queue: self,
            consumer: self.ring.consumer(),
        })
    }

    /// Mark the queue shut down and release any blocked endpoint, in this
    /// process or the peer's.
    pub fn shutdown(&self) {
        let word = self.sync_word();
        let old = word.set_quiet(QueueBits::SHUTDOWN.bits());
        if old & QueueBits::SHUTDOWN.bits() != 0 {
            return;
        }
        debug!(name = %self.name, "shutting down shared memory queue");
        // Failure is logged by the sync word; the SHUTDOWN bit is already
        // visible to the next check either way.
        let _ = self
            .syncer
            .wake((QueueBits::DATA_AVAILABLE | QueueBits::SPACE_AVAILABLE).bits());
    }

    pub fn is_shutdown(&self) -> bool {
        QueueBits::from_bits_truncate(self.syncer.bits()).contains(QueueBits::SHUTDOWN)
    }

    /// Descriptor the peer passes to [`attach`](Self::attach).
    pub fn meta(&self) -> QueueMeta {
        QueueMeta {
            name: self.name.clone(),
            capacity: self.ring.capacity(),
            element_size: size_of::<T>() as u32,
            segment_len: Self::required_len(self.ring.capacity()) as u64,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }

    /// The syncer bound to this queue's sync word.
    pub fn syncer(&self) -> &SharedMemQueueSyncer<'static> {
        &self.syncer
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.syncer.stats()
    }

    fn sync_word(&self) -> &SyncWord {
        // SAFETY: the header is valid for the lifetime of the region.
        unsafe { &self.region.get::<QueueHeader>(0).sync_word }
    }

    fn signal(&self, bits: QueueBits) {
        let _ = self.syncer.wake(bits.bits());
    }

    /// Block on `bits` until signaled, the deadline passes, or shutdown.
    fn wait_for(
        &self,
        bits: QueueBits,
        deadline: Option<Timespec>,
        transferred: usize,
    ) -> Result<(), QueueError> {
        let timeout_ns = match deadline {
            None => 0,
            Some(deadline) => {
                let left = futex::remaining_nanos(deadline);
                if left <= 0 {
                    return Err(QueueError::TimedOut { transferred });
                }
                left
            }
        };
        match self.syncer.wait(bits.bits(), timeout_ns) {
            Ok(()) => Ok(()),
            Err(WaitError::TimedOut) => Err(QueueError::TimedOut { transferred }),
            Err(e) => Err(QueueError::Wait(e)),
        }
    }
}

impl<T> std::fmt::Debug for SharedMemQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemQueue")
            .field("name", &self.name)
            .field("len", &self.region.len())
            .field("syncer", &self.syncer)
            .finish()
    }
}

fn check_element<T>() -> Result<(), LayoutError> {
    if size_of::<T>() == 0 {
        return Err(LayoutError::ZeroSizedElement);
    }
    if align_of::<T>() > 64 {
        return Err(LayoutError::ElementAlignment(align_of::<T>()));
    }
    Ok(())
}

fn deadline_for(timeout_ns: i64) -> Option<Timespec> {
    (timeout_ns > 0).then(|| futex::deadline_after(futex::monotonic_now(), timeout_ns))
}

/// Producing endpoint of a [`SharedMemQueue`].
pub struct QueueWriter<'q, T> {
    queue: &'q SharedMemQueue<T>,
    producer: SpscProducer<'q, T>,
}

impl<T: Copy> QueueWriter<'_, T> {
    /// Write every element of `items`, blocking while the ring is full.
    ///
    /// `timeout_ns <= 0` waits indefinitely; otherwise the whole call shares
    /// one deadline. Elements are published as space appears, so on error the
    /// `transferred` count says how many the reader can already see.
    pub fn write(&mut self, items: &[T], timeout_ns: i64) -> Result<(), QueueError> {
        let deadline = deadline_for(timeout_ns);
        let mut written = 0;
        loop {
            if self.queue.is_shutdown() {
                return Err(QueueError::Shutdown {
                    transferred: written,
                });
            }
            let n = self.producer.push_slice(&items[written..]);
            if n > 0 {
                written += n;
                self.queue.signal(QueueBits::DATA_AVAILABLE);
            }
            if written == items.len() {
                trace!(written, "queue write complete");
                return Ok(());
            }
            self.queue
                .wait_for(QueueBits::SPACE_AVAILABLE, deadline, written)?;
        }
    }

    /// Write as many elements as fit without waiting. Returns the count.
    pub fn write_nonblocking(&mut self, items: &[T]) -> Result<usize, QueueError> {
        if self.queue.is_shutdown() {
            return Err(QueueError::Shutdown { transferred: 0 });
        }
        let n = self.producer.push_slice(items);
        if n > 0 {
            self.queue.signal(QueueBits::DATA_AVAILABLE);
        }
        Ok(n)
    }

    pub fn free_space(&self) -> usize {
        self.producer.free_space()
    }
}

impl<T> Drop for QueueWriter<'_, T> {
    fn drop(&mut self) {
        self.queue.writer_taken.store(false, Ordering::Release);
    }
}

/// Consuming endpoint of a [`SharedMemQueue`].
pub struct QueueReader<'q, T> {
    queue: &'q SharedMemQueue<T>,
    consumer: SpscConsumer<'q, T>,
}

impl<T: Copy> QueueReader<'_, T> {
    /// Fill `buf`, blocking while the ring is empty.
    ///
    /// Data already in the ring is still delivered after shutdown; the call
    /// fails with [`QueueError::Shutdown`] only once it would have to wait.
    pub fn read(&mut self, buf: &mut [T], timeout_ns: i64) -> Result<(), QueueError> {
        let deadline = deadline_for(timeout_ns);
        let mut read = 0;
        loop {
            let n = self.consumer.pop_slice(&mut buf[read..]);
            if n > 0 {
                read += n;
                self.queue.signal(QueueBits::SPACE_AVAILABLE);
            }
            if read == buf.len() {
                trace!(read, "queue read complete");
                return Ok(());
            }
            if self.queue.is_shutdown() {
                return Err(QueueError::Shutdown { transferred: read });
            }
            self.queue
                .wait_for(QueueBits::DATA_AVAILABLE, deadline, read)?;
        }
    }

    /// Read whatever is available without waiting. Returns the count.
    pub fn read_nonblocking(&mut self, buf: &mut [T]) -> Result<usize, QueueError> {
        let n = self.consumer.pop_slice(buf);
        if n > 0 {
            self.queue.signal(QueueBits::SPACE_AVAILABLE);
        } else if self.queue.is_shutdown() {
            return Err(QueueError::Shutdown { transferred: 0 });
        }
        Ok(n)
    }

    pub fn available(&self) -> usize {
        self.consumer.available()
    }
}

impl<T> Drop for QueueReader<'_, T> {
    fn drop(&mut self) {
        self.queue.reader_taken.store(false, Ordering::Release);
    }
}

/// The segment does not hold a queue compatible with this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    BadMagic([u8; 8]),
    UnsupportedVersion(u32),
    /// Capacity is zero or not a power of two.
    InvalidCapacity(u32),
    ElementSizeMismatch {
        expected: u32,
        found: u32,
    },
    /// Element alignment above the 64-byte segment alignment.
    ElementAlignment(usize),
    ZeroSizedElement,
    RegionTooSmall {
        required: usize,
        actual: usize,
    },
    /// The header disagrees with the descriptor the peer sent.
    MetaMismatch,
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic(found) => write!(f, "bad queue magic {:02x?}", found),
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported queue version {} (expected {})", v, QUEUE_VERSION)
            }
            Self::InvalidCapacity(c) => write!(f, "capacity {} is not a power of two", c),
            Self::ElementSizeMismatch { expected, found } => write!(
                f,
                "element size mismatch: expected {}, segment has {}",
                expected, found
            ),
            Self::ElementAlignment(a) => write!(f, "element alignment {} exceeds 64", a),
            Self::ZeroSizedElement => write!(f, "zero-sized elements are not supported"),
            Self::RegionTooSmall { required, actual } => write!(
                f,
                "region too small: need {} bytes, have {}",
                required, actual
            ),
            Self::MetaMismatch => write!(f, "queue header does not match descriptor"),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Errors from queue endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was shut down. `transferred` elements went through first.
    Shutdown { transferred: usize },
    /// The deadline passed. `transferred` elements went through first.
    TimedOut { transferred: usize },
    /// The sync word wait failed.
    Wait(WaitError),
    /// This process already holds that endpoint.
    EndpointTaken,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown { transferred } => {
                write!(f, "queue shut down after {} elements", transferred)
            }
            Self::TimedOut { transferred } => {
                write!(f, "queue timed out after {} elements", transferred)
            }
            Self::Wait(e) => write!(f, "wait failed: {}", e),
            Self::EndpointTaken => write!(f, "queue endpoint already in use"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wait(e) => Some(e),
            _ => None,
        }
    }
}
