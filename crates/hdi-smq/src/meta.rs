/// Everything a peer needs to attach to a queue segment it did not create.
///
/// The creator sends this alongside the segment's file descriptor or path;
/// [`crate::SharedMemQueue::attach`] checks the mapped header against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMeta {
    pub name: String,
    /// Element slots (power of two).
    pub capacity: u32,
    /// `size_of::<T>()` on the creating side.
    pub element_size: u32,
    /// Minimum mapping length in bytes.
    pub segment_len: u64,
}

impl QueueMeta {
    /// Bytes of element storage, excluding headers.
    pub fn payload_len(&self) -> u64 {
        self.capacity as u64 * self.element_size as u64
    }
}
