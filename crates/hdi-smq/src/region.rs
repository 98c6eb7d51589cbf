use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::io;
use std::ptr::NonNull;

/// A view of a contiguous memory region.
///
/// `Region` carries no ownership. Whoever created the backing memory
/// ([`HeapRegion`], [`crate::MmapRegion`], or a foreign mapping) must keep it
/// alive for as long as any structure built on the view is in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a Region is just an address range; synchronization is the job of
// the structures placed in it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// the region is used, and 64-byte aligned.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        debug_assert!(!base.is_null());
        debug_assert!((base as usize).is_multiple_of(64));
        Self {
            // SAFETY: caller guarantees non-null.
            base: unsafe { NonNull::new_unchecked(base) },
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if `offset > len`.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: in bounds (one-past-the-end allowed).
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// # Safety
    ///
    /// `offset` must be suitably aligned for `T`, `offset + size_of::<T>()`
    /// must be within the region, and the bytes must hold a valid `T`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + size_of::<T>() <= self.len);
        // SAFETY: upheld by the caller.
        unsafe { &*(self.offset(offset) as *const T) }
    }

    /// # Safety
    ///
    /// As [`Region::get`], and no other reference to the same bytes may be
    /// live while the returned one is used.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        debug_assert!(offset + size_of::<T>() <= self.len);
        // SAFETY: upheld by the caller.
        unsafe { &mut *(self.offset(offset) as *mut T) }
    }
}

/// Heap-backed, zeroed, 64-byte aligned memory.
///
/// Stands in for a real mapping in tests and in-process use.
pub struct HeapRegion {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: owned allocation; see Region.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// # Panics
    ///
    /// Panics if `len` is zero or the allocation fails.
    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region length must be > 0");
        let Ok(layout) = Layout::from_size_align(len, 64) else {
            panic!("region length {} is too large", len);
        };
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { base, layout }
    }

    pub fn region(&self) -> Region {
        // SAFETY: the allocation is live for as long as self, aligned to 64.
        unsafe { Region::from_raw(self.base.as_ptr(), self.layout.size()) }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in new_zeroed.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Errors creating or attaching a shared region.
#[derive(Debug)]
pub enum RegionError {
    /// I/O error from open/truncate/mmap.
    Io(io::Error),
    /// The segment has zero length.
    Empty,
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Empty => write!(f, "shared segment is empty"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
