//! Tracks which change sequences are fully resolved.
//!
//! Work items finish out of order (batches run concurrently, documents
//! within a batch succeed or fail independently), but the checkpoint may
//! only move past a sequence once it and everything before it has been
//! resolved. [`SequenceMap`] assigns each sequence an ordinal, counts its
//! outstanding revisions, and reports the highest sequence whose prefix is
//! complete.

use docsync_protocol::Sequence;
use std::collections::{BTreeMap, HashSet};

/// Handle for one sequence registered in a [`SequenceMap`].
pub type SequenceId = u64;

#[derive(Debug)]
struct Entry {
    sequence: Sequence,
    outstanding: usize,
    doc_id: Option<String>,
}

/// Ordered record of pending sequences.
#[derive(Debug, Default)]
pub struct SequenceMap {
    next_id: SequenceId,
    pending: BTreeMap<SequenceId, Entry>,
    checkpointed: Option<Sequence>,
}

impl SequenceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sequence carrying `revisions` work items for `doc_id`.
    ///
    /// A sequence with no revisions is resolved immediately.
    pub fn add(&mut self, sequence: Sequence, doc_id: Option<String>, revisions: usize) -> SequenceId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            Entry {
                sequence,
                outstanding: revisions,
                doc_id,
            },
        );
        if revisions == 0 {
            self.advance();
        }
        id
    }

    /// Marks one work item of `id` as resolved. Unknown IDs are ignored.
    pub fn resolve(&mut self, id: SequenceId) {
        if let Some(entry) = self.pending.get_mut(&id) {
            entry.outstanding = entry.outstanding.saturating_sub(1);
            if entry.outstanding == 0 {
                self.advance();
            }
        }
    }

    /// Highest sequence such that it and every earlier one are resolved.
    pub fn checkpointed(&self) -> Option<&Sequence> {
        self.checkpointed.as_ref()
    }

    /// Number of sequences not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.pending
            .values()
            .filter(|entry| entry.outstanding > 0)
            .count()
    }

    /// Returns true if every registered sequence is resolved.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    /// Document IDs with unresolved work.
    pub fn pending_doc_ids(&self) -> HashSet<String> {
        self.pending
            .values()
            .filter(|entry| entry.outstanding > 0)
            .filter_map(|entry| entry.doc_id.clone())
            .collect()
    }

    /// Pops resolved entries off the front and moves the checkpoint.
    fn advance(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if entry.get().outstanding > 0 {
                break;
            }
            self.checkpointed = Some(entry.remove().sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn checkpoint_waits_for_earliest() {
        let mut map = SequenceMap::new();
        let a = map.add(Sequence::from(1), Some("a".into()), 1);
        let b = map.add(Sequence::from(2), Some("b".into()), 1);
        let c = map.add(Sequence::from(3), Some("c".into()), 1);

        map.resolve(c);
        assert!(map.checkpointed().is_none());
        map.resolve(b);
        assert!(map.checkpointed().is_none());
        assert_eq!(map.pending_doc_ids(), HashSet::from(["a".to_string()]));

        map.resolve(a);
        assert_eq!(map.checkpointed(), Some(&Sequence::from(3)));
        assert!(map.is_drained());
    }

    #[test]
    fn multi_revision_entries() {
        let mut map = SequenceMap::new();
        let a = map.add(Sequence::from("7:1"), Some("a".into()), 2);
        map.resolve(a);
        assert!(map.checkpointed().is_none());
        assert_eq!(map.pending_count(), 1);
        map.resolve(a);
        assert_eq!(map.checkpointed(), Some(&Sequence::from("7:1")));
    }

    #[test]
    fn empty_entries_resolve_immediately() {
        let mut map = SequenceMap::new();
        map.add(Sequence::from(4), None, 0);
        assert_eq!(map.checkpointed(), Some(&Sequence::from(4)));

        let pending = map.add(Sequence::from(5), None, 1);
        map.add(Sequence::from(6), None, 0);
        assert_eq!(map.checkpointed(), Some(&Sequence::from(4)));
        map.resolve(pending);
        assert_eq!(map.checkpointed(), Some(&Sequence::from(6)));
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut map = SequenceMap::new();
        map.resolve(42);
        assert!(map.checkpointed().is_none());
    }

    proptest! {
        #[test]
        fn checkpoint_is_monotonic(order in Just((0u64..30).collect::<Vec<_>>()).prop_shuffle()) {
            let mut map = SequenceMap::new();
            let ids: Vec<SequenceId> = (0..30u64)
                .map(|seq| map.add(Sequence::from(seq + 1), None, 1))
                .collect();

            let mut resolved = HashSet::new();
            let mut last = 0u64;
            for index in order {
                map.resolve(ids[index as usize]);
                resolved.insert(index);
                let expected = (0..30u64).take_while(|i| resolved.contains(i)).count() as u64;
                let current = match map.checkpointed() {
                    Some(Sequence::Integer(n)) => *n,
                    _ => 0,
                };
                prop_assert_eq!(current, expected);
                prop_assert!(current >= last);
                last = current;
            }
            prop_assert!(map.is_drained());
        }
    }
}
