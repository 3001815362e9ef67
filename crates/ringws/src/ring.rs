use crate::endian::{read_u32_ne, read_u64_ne, write_u32_ne, write_u64_ne};
use crate::invariants::{
    debug_assert_in_buffer, debug_assert_record_len, debug_assert_writer_behind_reader,
};
use crate::pair::RingCells;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::slice;
use std::sync::{Arc, Mutex};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Each ring couples exactly one producer thread and one consumer thread for
// its whole lifetime. All shared state is two atomic pointer cells (the
// `RingCells` writer/reader cursors); the buffer bytes themselves are never
// accessed concurrently at the same addresses because of the cursor protocol:
//
// **Producer (write path):**
// 1. Load the published `reader` cell with Acquire (only when space is tight)
// 2. Write record bytes between its private cursor and the buffer edge
// 3. Store the new `writer` cursor with Release (done in a batch by the
//    ring update queue, not per record)
//
// **Consumer (read path):**
// 1. Load the published `writer` cell with Acquire
// 2. Read record bytes between its private cursor and that writer
// 3. Store the new `reader` cursor with Release (batched, like the producer)
//
// The Release store publishes every byte written before it; the Acquire load
// on the opposite side synchronizes with it. On TSO hardware a relaxed store
// plus compiler fences would be enough, since stores are not reordered with
// earlier stores; portable code uses release/acquire unconditionally.
//
// ## Cursor equality
//
// The cursors are raw addresses into the current buffer. Equality always and
// only means "empty": the producer keeps strictly behind the reader while
// wrapped, and a reserve never lets the writer land exactly on the reader.
//
// ## In-band markers
//
// The byte stream is a sequence of `len:u32 | bytes` records. Two reserved
// length values are markers the consumer must recognize before interpreting
// anything after them:
//
// - `WRAP`: jump to the base of the current buffer.
// - `MOVE`: the next 8 bytes are the address of a replacement buffer; jump
//   to its base. The old buffer is reclaimed by the producer once the
//   published reader has left it.
//
// Every reserve keeps `MARKER_SLACK` writable bytes ahead of the cursor, so
// a marker itself can always be written without further checks.
//
// =============================================================================

/// Reserved record-length values; real record lengths stay below this.
pub(crate) const MARKER_MIN: u32 = u32::MAX - 1;
const WRAP: u32 = u32::MAX;
const MOVE: u32 = u32::MAX - 1;

const LEN_PREFIX: usize = 4;
/// Room for the largest marker: a MOVE record (`len` + 8-byte address).
const MARKER_SLACK: usize = LEN_PREFIX + 8;

/// One heap allocation backing (part of) a ring's byte stream.
struct Buffer {
    base: *mut u8,
    cap: usize,
    layout: Layout,
}

// SAFETY: the raw base pointer is only dereferenced by the producer/consumer
// cursor protocol; the Buffer itself is just an owning handle.
unsafe impl Send for Buffer {}

impl Buffer {
    fn alloc(cap: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(cap, align)
            .expect("ring buffer size overflows the allocator limit");
        // SAFETY: layout has non-zero size (callers round up past MARKER_SLACK).
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            // Allocation failure in the data plane is fatal by policy; abort
            // like every other std allocation does.
            handle_alloc_error(layout);
        }
        Self { base, cap, layout }
    }

    #[inline]
    fn contains(&self, ptr: *mut u8) -> bool {
        let p = ptr as usize;
        let base = self.base as usize;
        p >= base && p < base + self.cap
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: base/layout come from the alloc in Buffer::alloc and are
        // freed exactly once, here.
        unsafe { dealloc(self.base, self.layout) }
    }
}

/// State shared by a ring's two halves: the cursor cells, plus the registry
/// of live buffers so that whichever half is dropped last frees them all.
///
/// The registry mutex is only taken on the cold paths (growth, reclamation,
/// drop); reserve/consume never lock.
pub struct RingShared {
    cells: RingCells,
    bufs: Mutex<Vec<Buffer>>,
}

impl RingShared {
    /// The shared cursor cells, for batched publication via the update queue.
    #[inline]
    pub fn cells(&self) -> &RingCells {
        &self.cells
    }
}

/// Creates a ring of `initial_size` bytes and returns its two halves.
///
/// `alloc_multiplier` scales replacement buffers on growth; `cache_line_size`
/// aligns every buffer allocation.
pub fn ring(
    initial_size: usize,
    alloc_multiplier: usize,
    cache_line_size: usize,
) -> (RingProducer, RingConsumer) {
    assert!(alloc_multiplier >= 2, "alloc_multiplier must be at least 2");
    assert!(
        cache_line_size.is_power_of_two(),
        "cache_line_size must be a power of two"
    );
    let cap = initial_size.max(MARKER_SLACK * 2);
    let buf = Buffer::alloc(cap, cache_line_size);
    let base = buf.base;

    let shared = Arc::new(RingShared {
        cells: RingCells::new(),
        bufs: Mutex::new(vec![buf]),
    });
    shared.cells.publish_writer(base);
    shared.cells.publish_reader(base);

    let producer = RingProducer {
        shared: Arc::clone(&shared),
        base,
        cap,
        writer: base,
        pending: None,
        alloc_multiplier,
        align: cache_line_size,
    };
    let consumer = RingConsumer {
        shared,
        base,
        reader: base,
    };
    (producer, consumer)
}

/// The writing half of a ring. Owned by exactly one thread.
pub struct RingProducer {
    shared: Arc<RingShared>,
    /// Base of the buffer the writer cursor is currently in.
    base: *mut u8,
    cap: usize,
    /// Private cursor; becomes visible to the consumer only when published.
    writer: *mut u8,
    /// Byte count of the outstanding reserve, if any.
    pending: Option<usize>,
    alloc_multiplier: usize,
    align: usize,
}

// SAFETY: a producer half may be moved to its owning thread; the cursor
// protocol (one writer cell writer, one reader cell reader) makes the raw
// pointer accesses race-free.
unsafe impl Send for RingProducer {}

impl RingProducer {
    #[inline]
    fn end(&self) -> *mut u8 {
        // SAFETY: base/cap describe one live allocation.
        unsafe { self.base.add(self.cap) }
    }

    /// The cursor value to hand to the ring update queue after a commit.
    #[inline]
    pub fn writer_pos(&self) -> *mut u8 {
        self.writer
    }

    /// The shared half, for cursor publication through the update queue.
    #[inline]
    pub fn shared(&self) -> &Arc<RingShared> {
        &self.shared
    }

    /// Publishes the writer cursor directly, bypassing the update queue.
    #[inline]
    pub fn publish_writer(&self) {
        self.shared.cells().publish_writer(self.writer);
    }

    /// Reserves a contiguous region of exactly `n` payload bytes, wrapping or
    /// replacing the buffer as needed. Always leaves marker slack ahead of
    /// the cursor, so growth can never be wedged.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        assert!(self.pending.is_none(), "previous reserve was never committed");
        debug_assert_record_len!(n);
        let need = LEN_PREFIX + n + MARKER_SLACK;

        let reader = self.shared.cells().load_reader();
        let in_current = {
            let r = reader as usize;
            let base = self.base as usize;
            r >= base && r < base + self.cap
        };
        let wrapped = in_current && (reader as usize) > self.writer as usize;

        let fits_at_tail = if wrapped {
            // The unread region is [writer, reader); stay strictly behind
            // the reader so cursor equality keeps meaning "empty".
            (reader as usize) - (self.writer as usize) > need
        } else {
            // Unwrapped — or the reader is still in a retired buffer, in
            // which case everything up to the buffer edge is the producer's.
            self.end() as usize - self.writer as usize >= need
        };

        if !fits_at_tail {
            let can_wrap =
                in_current && !wrapped && (reader as usize) - (self.base as usize) > need;
            if can_wrap {
                self.write_marker(WRAP, None);
                self.writer = self.base;
                debug_assert_writer_behind_reader!(self.writer, reader);
            } else {
                self.grow(n);
            }
        }

        self.pending = Some(n);
        // SAFETY: the region [writer + 4, writer + 4 + n) is inside the
        // current buffer (the fit checks above guarantee it) and is not
        // readable by the consumer until the cursor past it is published.
        unsafe { slice::from_raw_parts_mut(self.writer.add(LEN_PREFIX), n) }
    }

    /// Commits `n` bytes of the outstanding reserve (`n` may be smaller than
    /// reserved). The record only becomes visible once the cursor is
    /// published through the update queue.
    pub fn commit(&mut self, n: usize) {
        let reserved = self
            .pending
            .take()
            .expect("commit without a matching reserve");
        assert!(n <= reserved, "cannot commit more than reserved");
        // SAFETY: reserve left LEN_PREFIX bytes for this prefix right at the
        // cursor.
        unsafe {
            let mut prefix = [0u8; LEN_PREFIX];
            write_u32_ne(&mut prefix, n as u32);
            std::ptr::copy_nonoverlapping(prefix.as_ptr(), self.writer, LEN_PREFIX);
            self.writer = self.writer.add(LEN_PREFIX + n);
        }
        debug_assert_in_buffer!(self.writer, self.base, self.cap);
    }

    /// Copies `bytes` into the ring as one record. Convenience over
    /// reserve/commit for callers that already hold the full record.
    pub fn push_record(&mut self, bytes: &[u8]) {
        let region = self.reserve(bytes.len());
        region.copy_from_slice(bytes);
        self.commit(bytes.len());
    }

    /// Replaces the buffer with a larger one, linking it from the old buffer
    /// with a forwarding record.
    fn grow(&mut self, n: usize) {
        let min = LEN_PREFIX + n + MARKER_SLACK;
        let new_cap = self
            .alloc_multiplier
            .saturating_mul(self.cap + n)
            .max(min);
        let new_buf = Buffer::alloc(new_cap, self.align);
        let new_base = new_buf.base;

        self.write_marker(MOVE, Some(new_base as u64));

        {
            let mut bufs = self.shared.bufs.lock().expect("ring buffer registry poisoned");
            bufs.push(new_buf);
            // Reclaim every buffer the published reader has already left.
            // The registry is in growth order, which is also the order the
            // reader traverses buffers in, so everything before the buffer
            // holding the reader is provably crossed.
            let reader = self.shared.cells().load_reader();
            if let Some(idx) = bufs.iter().position(|b| b.contains(reader)) {
                bufs.drain(..idx);
            }
        }

        self.base = new_base;
        self.cap = new_cap;
        self.writer = new_base;
    }

    /// Writes a marker record at the cursor. Marker slack maintained by every
    /// reserve guarantees it fits.
    fn write_marker(&mut self, marker: u32, addr: Option<u64>) {
        let mut bytes = [0u8; MARKER_SLACK];
        write_u32_ne(&mut bytes, marker);
        let len = if marker == MOVE {
            write_u64_ne(&mut bytes[LEN_PREFIX..], addr.unwrap_or(0));
            MARKER_SLACK
        } else {
            LEN_PREFIX
        };
        // SAFETY: reserve's fit checks keep MARKER_SLACK writable bytes ahead
        // of the cursor at all times.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.writer, len);
        }
    }
}

/// The reading half of a ring. Owned by exactly one thread.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    /// Base of the buffer the reader cursor is currently in; WRAP jumps here.
    base: *mut u8,
    /// Private cursor; becomes visible to the producer only when published.
    reader: *mut u8,
}

// SAFETY: see RingProducer.
unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// The cursor value to hand to the ring update queue after a drain batch.
    #[inline]
    pub fn reader_pos(&self) -> *mut u8 {
        self.reader
    }

    /// The shared half, for reader-cursor publication.
    #[inline]
    pub fn shared(&self) -> &Arc<RingShared> {
        &self.shared
    }

    /// True if nothing is published past the reader cursor. Markers are
    /// only ever followed by a committed record, so "not empty" always
    /// means a real record is available.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reader == self.shared.cells().load_writer()
    }

    /// Returns the next record, following wrap and forwarding markers, or
    /// `None` once the published writer cursor is reached.
    pub fn next_record(&mut self) -> Option<&[u8]> {
        loop {
            let writer = self.shared.cells().load_writer();
            if self.reader == writer {
                return None;
            }
            // SAFETY: [reader, writer) was fully written before the producer's
            // Release store of `writer`, which our Acquire load synchronized
            // with; the producer never rewrites bytes behind the published
            // reader cursor.
            let len = unsafe {
                read_u32_ne(slice::from_raw_parts(self.reader, LEN_PREFIX))
            };
            match len {
                WRAP => {
                    self.reader = self.base;
                }
                MOVE => {
                    // SAFETY: a MOVE record always carries the 8-byte address
                    // of the replacement buffer right after its length.
                    let addr = unsafe {
                        read_u64_ne(slice::from_raw_parts(self.reader.add(LEN_PREFIX), 8))
                    };
                    self.base = addr as *mut u8;
                    self.reader = self.base;
                }
                len => {
                    // SAFETY: same publication argument as above, now for the
                    // record body.
                    let record = unsafe {
                        slice::from_raw_parts(self.reader.add(LEN_PREFIX), len as usize)
                    };
                    self.reader = unsafe { self.reader.add(LEN_PREFIX + len as usize) };
                    return Some(record);
                }
            }
        }
    }

    /// Publishes the reader cursor directly, bypassing the update queue.
    /// Used by drains that just emptied every ring and are about to park.
    pub fn publish_reader(&mut self) {
        self.shared.cells().publish_reader(self.reader);
    }
}
