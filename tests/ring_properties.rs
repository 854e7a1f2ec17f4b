//! Property-based tests using proptest.
//!
//! These verify the transaction-ring and checkpoint invariants for
//! arbitrary workloads and acknowledgement orders, plus the pure-function
//! properties of topic naming and wire-format framing.

use bottledwater::encoder::{decode_avro_frame, frame_avro, WIRE_FORMAT_MAGIC};
use bottledwater::mapper::{topic_name, GENERATED_SCHEMA_NAMESPACE, TOPIC_NAME_BUFFER_LENGTH};
use bottledwater::{
    Delivery, Encoder, ErrorPolicy, FrameHandler, KafkaSink, MockLink, MockSink, NullRegistry,
    OutputFormat, Producer, Shutdown, StreamState, TableMapper, TransactionEntry, TransactionRing,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Ring boundary properties
// =============================================================================

proptest! {
    /// The ring reports full exactly at capacity and empty exactly at zero,
    /// for any capacity and fill level.
    #[test]
    fn ring_full_and_empty_boundaries(capacity in 1usize..32, fill in 0usize..32) {
        let fill = fill.min(capacity);
        let mut ring = TransactionRing::new(capacity);

        for xid in 0..fill {
            prop_assert!(!ring.is_full());
            ring.begin(xid as u32 + 1);
        }

        prop_assert_eq!(ring.len(), fill);
        prop_assert_eq!(ring.is_empty(), fill == 0);
        prop_assert_eq!(ring.is_full(), fill == capacity);
    }

    /// Draining from any fill level lands back on empty, through any
    /// wraparound position.
    #[test]
    fn ring_drains_to_empty(capacity in 1usize..16, rounds in 1usize..64) {
        let mut ring = TransactionRing::new(capacity);
        for round in 0..rounds {
            ring.begin(round as u32 + 1);
            ring.advance_tail();
            prop_assert!(ring.is_empty());
        }
    }
}

// =============================================================================
// Checkpoint / counter invariants under arbitrary ack orders
// =============================================================================

/// A generated workload: per-transaction event counts, plus a permutation
/// used to shuffle delivery acknowledgements.
fn workload() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    prop::collection::vec(0u8..4, 1..8).prop_flat_map(|events| {
        let total: usize = events.iter().map(|&n| n as usize).sum();
        let order: Vec<usize> = (0..total).collect();
        (Just(events), Just(order).prop_shuffle())
    })
}

fn live_entries(ring: &TransactionRing) -> Vec<TransactionEntry> {
    (0..)
        .take_while(|&slot| ring.get(slot).is_some())
        .filter(|&slot| ring.contains(slot))
        .filter_map(|slot| ring.get(slot).copied())
        .collect()
}

fn commit_lsn_for(index: usize) -> u64 {
    (index as u64 + 1) * 0x100
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For every transaction in the ring, at every step:
    /// `received_events >= pending_events >= 0`; the fsync-LSN never moves
    /// backwards; and the ring drains exactly when every ack has arrived.
    #[test]
    fn checkpoint_invariants_hold((events, ack_order) in workload()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async move {
            let mapper = TableMapper::new(Arc::new(NullRegistry), None);
            let mut producer = Producer::new(
                Encoder::new(OutputFormat::Json),
                ErrorPolicy::Exit,
                mapper,
                MockSink::new(),
                MockLink::new(vec![]),
                StreamState::new("bottledwater"),
                Shutdown::new(),
            )
            .with_ring_capacity(events.len() + 1);

            let row_schema = format!(
                r#"{{"type":"record","name":"users","namespace":"{}.public","fields":[{{"name":"id","type":"long"}}]}}"#,
                GENERATED_SCHEMA_NAMESPACE
            );
            producer.on_table_schema(0, 42, None, &row_schema).await.unwrap();

            // Stream every transaction: begin, events, commit.
            for (i, &event_count) in events.iter().enumerate() {
                let xid = i as u32 + 1;
                let base = commit_lsn_for(i);
                producer.on_begin_txn(base - 2, xid).await.unwrap();
                for event in 0..event_count {
                    producer
                        .on_insert_row(base - 1, 42, Some(b"key"), &[event])
                        .await
                        .unwrap();
                }
                producer.on_commit_txn(base, xid).await.unwrap();

                for entry in live_entries(producer.ring()) {
                    prop_assert!(entry.received_events >= entry.pending_events);
                }
            }

            // Collect all deliveries, then handle them in the shuffled order.
            producer.sink_mut().ack_all();
            let deliveries: Vec<Delivery> = producer.sink_mut().poll(Duration::ZERO);
            prop_assert_eq!(deliveries.len(), ack_order.len());

            let mut last_fsync = producer.stream().fsync_lsn;
            for &index in &ack_order {
                producer.on_delivery(deliveries[index].clone()).unwrap();

                let fsync = producer.stream().fsync_lsn;
                prop_assert!(fsync >= last_fsync, "fsync-LSN moved backwards");
                last_fsync = fsync;

                for entry in live_entries(producer.ring()) {
                    prop_assert!(entry.received_events >= entry.pending_events);
                }
            }

            // Every message acked: the tail has caught up with the head and
            // the checkpoint sits at the last commit.
            prop_assert!(producer.ring().is_empty());
            prop_assert_eq!(
                producer.stream().fsync_lsn,
                commit_lsn_for(events.len() - 1)
            );
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// =============================================================================
// Topic naming properties
// =============================================================================

proptest! {
    /// Topic derivation is a pure function: same inputs, same output.
    #[test]
    fn topic_name_deterministic(
        table in "[a-z][a-z0-9_]{0,40}",
        pg_schema in "[a-z][a-z0-9_]{0,20}",
        prefix in prop::option::of("[a-z]{1,10}"),
    ) {
        let namespace = format!("{}.{}", GENERATED_SCHEMA_NAMESPACE, pg_schema);
        let first = topic_name(Some(&namespace), &table, prefix.as_deref());
        let second = topic_name(Some(&namespace), &table, prefix.as_deref());
        prop_assert_eq!(first, second);
    }

    /// Derived names never exceed the buffer bound.
    #[test]
    fn topic_name_bounded(
        table in "[a-z]{1,200}",
        prefix in prop::option::of("[a-z]{1,100}"),
    ) {
        let name = topic_name(None, &table, prefix.as_deref());
        prop_assert!(name.len() < TOPIC_NAME_BUFFER_LENGTH);
    }
}

// =============================================================================
// Wire-format framing properties
// =============================================================================

proptest! {
    /// `decode(encode(bytes, id)) == (id, bytes)` and the header is exactly
    /// the magic byte followed by the schema id in big-endian.
    #[test]
    fn avro_framing_round_trips(
        schema_id in any::<u32>(),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let framed = frame_avro(schema_id, &body);

        prop_assert_eq!(framed[0], WIRE_FORMAT_MAGIC);
        prop_assert_eq!(&framed[1..5], &schema_id.to_be_bytes());

        let (decoded_id, decoded_body) = decode_avro_frame(&framed).unwrap();
        prop_assert_eq!(decoded_id, schema_id);
        prop_assert_eq!(decoded_body, &body[..]);
    }
}
