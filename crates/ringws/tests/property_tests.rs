//! Property-based tests for the transport invariants.
//!
//! The central law: for every ring, over any sequence of reserves, commits,
//! wraps and growths, the consumer's observed byte stream equals the
//! producer's published stream, in order. The marker-following and
//! buffer-replacement machinery must be invisible to the consumer.

use proptest::prelude::*;
use ringws::endian::{hton16, hton32, hton64, ntoh16, ntoh32, ntoh64};
use ringws::ring::ring;
use ringws::ClientId;

proptest! {
    /// Consumer observes exactly the producer's record sequence, across
    /// wraps and buffer replacements forced by a tiny initial ring.
    #[test]
    fn prop_ring_stream_is_producer_prefix(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..60),
        drain_every in 1usize..8,
    ) {
        let (mut producer, mut consumer) = ring(256, 2, 64);
        let mut observed = Vec::new();

        for (i, record) in records.iter().enumerate() {
            producer.push_record(record);
            producer.publish_writer();

            if i % drain_every == 0 {
                while let Some(rec) = consumer.next_record() {
                    observed.push(rec.to_vec());
                }
                consumer.publish_reader();
            }
        }
        while let Some(rec) = consumer.next_record() {
            observed.push(rec.to_vec());
        }

        prop_assert_eq!(observed, records);
    }

    /// An unpublished record is never observable.
    #[test]
    fn prop_unpublished_stays_hidden(record in prop::collection::vec(any::<u8>(), 1..100)) {
        let (mut producer, mut consumer) = ring(1024, 2, 64);
        producer.push_record(&record);
        prop_assert!(consumer.next_record().is_none());
        producer.publish_writer();
        prop_assert_eq!(consumer.next_record(), Some(record.as_slice()));
    }

    /// pack then unpack returns the original (worker, peer slot) pair.
    #[test]
    fn prop_client_id_round_trip(worker_i in any::<u32>(), peer_i in any::<u32>()) {
        let id = ClientId::pack(worker_i, peer_i);
        prop_assert_eq!(id.unpack(), (worker_i, peer_i));
        prop_assert_eq!(ClientId::from(id.as_u64()), id);
    }

    /// hton∘ntoh and ntoh∘hton are both the identity, for all three widths.
    #[test]
    fn prop_endian_round_trips(a in any::<u16>(), b in any::<u32>(), c in any::<u64>()) {
        prop_assert_eq!(ntoh16(hton16(a)), a);
        prop_assert_eq!(hton16(ntoh16(a)), a);
        prop_assert_eq!(ntoh32(hton32(b)), b);
        prop_assert_eq!(hton32(ntoh32(b)), b);
        prop_assert_eq!(ntoh64(hton64(c)), c);
        prop_assert_eq!(hton64(ntoh64(c)), c);
    }
}
