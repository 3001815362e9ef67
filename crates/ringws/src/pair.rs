use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// The two shared cursor cells coupling one ring's producer and consumer.
///
/// Each cell has exactly one writing thread and one reading thread for the
/// ring's lifetime: the producer stores `writer`, the consumer stores
/// `reader`, and each only ever loads the other. The cells are padded to a
/// cache line each so cursor publications from the two threads never share a
/// line.
#[derive(Debug)]
pub struct RingCells {
    writer: CachePadded<AtomicPtr<u8>>,
    reader: CachePadded<AtomicPtr<u8>>,
}

impl RingCells {
    pub fn new() -> Self {
        Self {
            writer: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            reader: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Producer-side: publish the writer cursor. `Release` so the payload
    /// bytes written before it are visible to a consumer that `Acquire`-loads
    /// the cell.
    #[inline]
    pub fn publish_writer(&self, ptr: *mut u8) {
        self.writer.store(ptr, Ordering::Release);
    }

    /// Consumer-side: observe the latest published writer cursor.
    #[inline]
    pub fn load_writer(&self) -> *mut u8 {
        self.writer.load(Ordering::Acquire)
    }

    /// Consumer-side: publish the reader cursor so the producer can reclaim
    /// space (and retired buffers) behind it.
    #[inline]
    pub fn publish_reader(&self, ptr: *mut u8) {
        self.reader.store(ptr, Ordering::Release);
    }

    /// Producer-side: observe the latest published reader cursor.
    #[inline]
    pub fn load_reader(&self) -> *mut u8 {
        self.reader.load(Ordering::Acquire)
    }
}

impl Default for RingCells {
    fn default() -> Self {
        Self::new()
    }
}
