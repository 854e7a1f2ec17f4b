//! # In-flight transaction tracking
//!
//! A bounded circular buffer of transactions currently somewhere between
//! "first event received from PostgreSQL" and "last message acknowledged by
//! Kafka". The head entry is the transaction being populated from the
//! replication stream; the tail is the oldest transaction not yet
//! checkpointed. The checkpoint engine only ever advances the tail across
//! fully-acknowledged, committed entries, which is what makes the reported
//! fsync-LSN safe as a restart position.

/// The xid PostgreSQL assigns to the synthetic initial-snapshot transaction.
pub const SNAPSHOT_XID: u32 = 0;

/// Maximum number of transactions that may be in flight at once. `begin`
/// events beyond this apply backpressure to the replication stream.
pub const MAX_IN_FLIGHT_TRANSACTIONS: usize = 1000;

/// One tracked transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionEntry {
    /// Postgres transaction identifier (0 for the initial snapshot)
    pub xid: u32,
    /// Number of row-level events received so far for this transaction
    pub received_events: u64,
    /// Number of enqueued messages not yet acknowledged by Kafka
    pub pending_events: u64,
    /// WAL position of the transaction's commit event, 0 while still open
    pub commit_lsn: u64,
}

impl TransactionEntry {
    fn open(xid: u32) -> Self {
        Self {
            xid,
            ..Self::default()
        }
    }

    /// Whether the checkpoint engine may advance past this entry.
    ///
    /// An entry is closed once every enqueued message has been acknowledged
    /// and the commit frame has been seen. The snapshot transaction counts
    /// as closed even before its commit frame, because its begin may carry
    /// WAL position zero.
    pub fn is_closed(&self) -> bool {
        self.pending_events == 0 && (self.commit_lsn > 0 || self.xid == SNAPSHOT_XID)
    }
}

/// Fixed-capacity circular buffer of in-flight transactions.
///
/// The backing storage holds one slot more than the capacity so that a full
/// buffer can be distinguished from an empty one without an extra flag.
/// Slot indices are stable for the lifetime of an entry, so message
/// envelopes can carry `(slot, xid)` and be validated on acknowledgement.
#[derive(Debug)]
pub struct TransactionRing {
    entries: Vec<TransactionEntry>,
    head: usize,
    tail: usize,
}

impl TransactionRing {
    /// Create a ring that admits up to `capacity` in-flight transactions.
    pub fn new(capacity: usize) -> Self {
        let slots = capacity.max(1) + 1;
        Self {
            entries: vec![TransactionEntry::default(); slots],
            // Tail one ahead of head means the buffer starts out empty.
            head: slots - 1,
            tail: 0,
        }
    }

    fn slots(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries between tail and head inclusive.
    pub fn len(&self) -> usize {
        // Normalise negative length in case of wraparound.
        (self.slots() + self.head + 1 - self.tail) % self.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.slots() - 1
    }

    /// Slot index of the entry currently being populated from the stream.
    pub fn head_slot(&self) -> usize {
        self.head
    }

    /// Slot index of the oldest entry not yet checkpointed.
    pub fn tail_slot(&self) -> usize {
        self.tail
    }

    /// Open a new head entry for `xid`.
    ///
    /// The caller must have cleared space first; beginning a transaction on
    /// a full ring is an invariant violation.
    pub fn begin(&mut self, xid: u32) -> usize {
        debug_assert!(!self.is_full(), "begin on a full transaction ring");
        self.head = (self.head + 1) % self.slots();
        self.entries[self.head] = TransactionEntry::open(xid);
        self.head
    }

    pub fn head(&self) -> &TransactionEntry {
        &self.entries[self.head]
    }

    pub fn head_mut(&mut self) -> &mut TransactionEntry {
        &mut self.entries[self.head]
    }

    pub fn tail(&self) -> &TransactionEntry {
        &self.entries[self.tail]
    }

    pub fn get(&self, slot: usize) -> Option<&TransactionEntry> {
        self.entries.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut TransactionEntry> {
        self.entries.get_mut(slot)
    }

    /// Move the tail past the current oldest entry.
    pub fn advance_tail(&mut self) {
        debug_assert!(!self.is_empty(), "advance_tail on an empty ring");
        self.tail = (self.tail + 1) % self.slots();
    }

    /// Whether `slot` currently holds a live (un-checkpointed) entry.
    ///
    /// Freed slots keep their old contents until reused, so acknowledgement
    /// handling checks liveness before trusting the slot's xid.
    pub fn contains(&self, slot: usize) -> bool {
        if slot >= self.slots() || self.is_empty() {
            return false;
        }
        let offset = (self.slots() + slot - self.tail) % self.slots();
        offset < self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ring_is_empty() {
        let ring = TransactionRing::new(3);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.tail_slot(), 0);
    }

    #[test]
    fn test_fill_to_capacity() {
        let mut ring = TransactionRing::new(3);
        for xid in 1..=3 {
            ring.begin(xid);
        }
        assert_eq!(ring.len(), 3);
        assert!(ring.is_full());
        assert!(!ring.is_empty());
    }

    #[test]
    fn test_slack_slot_distinguishes_full_from_empty() {
        // Capacity 1: two slots backing one in-flight transaction.
        let mut ring = TransactionRing::new(1);
        assert!(ring.is_empty());
        ring.begin(7);
        assert!(ring.is_full());
        assert!(!ring.is_empty());
        ring.advance_tail();
        assert!(ring.is_empty());
        assert!(!ring.is_full());
    }

    #[test]
    fn test_wraparound() {
        let mut ring = TransactionRing::new(2);
        for round in 0..10u32 {
            let slot = ring.begin(round + 1);
            assert_eq!(ring.head().xid, round + 1);
            assert_eq!(ring.head_slot(), slot);
            ring.advance_tail();
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_entry_closed_conditions() {
        let mut e = TransactionEntry::open(42);
        assert!(!e.is_closed()); // no commit yet
        e.commit_lsn = 0x100;
        assert!(e.is_closed());
        e.pending_events = 1;
        assert!(!e.is_closed()); // waiting on acks

        let snapshot = TransactionEntry::open(SNAPSHOT_XID);
        assert!(snapshot.is_closed()); // snapshot counts as closed pre-commit
    }

    #[test]
    fn test_contains_tracks_live_window() {
        let mut ring = TransactionRing::new(3);
        assert!(!ring.contains(0)); // empty ring holds nothing

        let first = ring.begin(1);
        let second = ring.begin(2);
        assert!(ring.contains(first));
        assert!(ring.contains(second));
        assert!(!ring.contains(99));

        ring.advance_tail();
        assert!(!ring.contains(first)); // checkpointed
        assert!(ring.contains(second));
    }

    #[test]
    fn test_counters_reset_on_reused_slot() {
        let mut ring = TransactionRing::new(1);
        let slot = ring.begin(1);
        ring.head_mut().received_events = 5;
        ring.head_mut().pending_events = 5;
        ring.head_mut().commit_lsn = 0x10;
        ring.advance_tail();

        let slot2 = ring.begin(2);
        assert_eq!(slot, slot2);
        assert_eq!(ring.head().received_events, 0);
        assert_eq!(ring.head().pending_events, 0);
        assert_eq!(ring.head().commit_lsn, 0);
        assert_eq!(ring.head().xid, 2);
    }
}
