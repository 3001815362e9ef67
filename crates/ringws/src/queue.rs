use crate::ring::RingShared;
use crate::wake::WakePort;
use crate::IoResult;
use std::sync::Arc;

/// Which cursor of a ring a pending update publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorKind {
    /// A producer's writer cursor; the target consumer may need waking.
    Writer,
    /// A consumer's reader cursor; nobody sleeps waiting for space, so no
    /// wake is attached.
    Reader,
}

struct PendingUpdate {
    ring: Arc<RingShared>,
    cursor: *mut u8,
    kind: CursorKind,
    wake: Option<Arc<WakePort>>,
}

// SAFETY: the raw cursor is just a value to be stored into an atomic cell;
// the queue lives and dies on its owning thread.
unsafe impl Send for PendingUpdate {}

/// Batches cursor publications so one processing batch costs one flush pass
/// instead of one store-plus-wake per ring write.
///
/// Owned by one thread. Entries for the same ring coalesce to the newest
/// cursor; a full queue flushes itself before accepting the new entry. The
/// owner must also flush at the end of every processing batch (a worker's
/// readiness epoch, an app callback return).
pub struct RingUpdateQueue {
    pending: Vec<PendingUpdate>,
    size: usize,
}

impl RingUpdateQueue {
    /// Creates a queue that holds at most `size` distinct ring updates
    /// between flushes.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "update queue size must be at least 1");
        Self {
            pending: Vec::with_capacity(size),
            size,
        }
    }

    /// Queues a writer-cursor publication toward the consumer behind `wake`.
    pub fn enqueue_writer(
        &mut self,
        ring: &Arc<RingShared>,
        cursor: *mut u8,
        wake: &Arc<WakePort>,
    ) -> IoResult {
        self.enqueue(ring, cursor, CursorKind::Writer, Some(wake))
    }

    /// Queues a reader-cursor publication toward the producer.
    pub fn enqueue_reader(&mut self, ring: &Arc<RingShared>, cursor: *mut u8) -> IoResult {
        self.enqueue(ring, cursor, CursorKind::Reader, None)
    }

    fn enqueue(
        &mut self,
        ring: &Arc<RingShared>,
        cursor: *mut u8,
        kind: CursorKind,
        wake: Option<&Arc<WakePort>>,
    ) -> IoResult {
        if let Some(entry) = self
            .pending
            .iter_mut()
            .find(|e| e.kind == kind && Arc::ptr_eq(&e.ring, ring))
        {
            entry.cursor = cursor;
            return Ok(());
        }
        if self.pending.len() == self.size {
            self.flush()?;
        }
        self.pending.push(PendingUpdate {
            ring: Arc::clone(ring),
            cursor,
            kind,
            wake: wake.map(Arc::clone),
        });
        Ok(())
    }

    /// Publishes every queued cursor in queue order, waking any consumer
    /// whose sleep flag is set after its writer cursor lands.
    pub fn flush(&mut self) -> IoResult {
        for update in self.pending.drain(..) {
            match update.kind {
                CursorKind::Writer => {
                    update.ring.cells().publish_writer(update.cursor);
                    if let Some(wake) = &update.wake {
                        // Fences with the consumer's park protocol; see the
                        // handshake writeup in wake.rs.
                        wake.wake_if_asleep()?;
                    }
                }
                CursorKind::Reader => {
                    update.ring.cells().publish_reader(update.cursor);
                }
            }
        }
        Ok(())
    }

    /// Number of distinct updates currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
