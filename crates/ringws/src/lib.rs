//! ringws — the shared-nothing ring transport between WebSocket worker
//! threads and app threads.
//!
//! A process runs `W` worker threads (socket I/O) and `A` app threads
//! (message handling). Each (worker, app) pair owns exactly two
//! single-producer single-consumer byte rings: inbound (worker publishes
//! decoded messages and lifecycle events, app consumes) and outbound (app
//! publishes framed messages plus addressing headers, worker consumes).
//! No ring ever has a second producer or consumer, so the whole data plane
//! needs no locks on its hot paths.
//!
//! # Key pieces
//!
//! - [`ring`]: growable SPSC byte ring with in-band wrap/forwarding markers
//! - [`RingUpdateQueue`]: batched cursor publication plus consumer wakes
//! - [`WakePort`]: per-thread sleep flag and eventfd doorbell
//! - [`ClientId`]: the 64-bit (worker, peer slot) routing token
//! - [`record`]: the outbound routing-record and inbound event layouts
//!
//! # Example
//!
//! ```
//! use ringws::ring::ring;
//!
//! let (mut producer, mut consumer) = ring(4096, 2, 64);
//!
//! let region = producer.reserve(5);
//! region.copy_from_slice(b"hello");
//! producer.commit(5);
//! producer.publish_writer();
//!
//! assert_eq!(consumer.next_record(), Some(&b"hello"[..]));
//! assert_eq!(consumer.next_record(), None);
//! ```

mod client_id;
mod config;
pub mod endian;
mod err;
mod invariants;
mod pair;
mod queue;
pub mod record;
pub mod ring;
mod time;
mod wake;

pub use client_id::ClientId;
pub use config::Config;
pub use err::{IoErr, IoResult};
pub use pair::RingCells;
pub use queue::RingUpdateQueue;
pub use ring::{RingConsumer, RingProducer, RingShared};
pub use time::monotonic_ms;
pub use wake::{EventFd, SleepState, WakePort};
