use crate::error::bug;

use serde_derive::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A leader term. Starts at 1, indicates no term if 0.
pub type Term = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The state machine command. Opaque to the engine; the host's state
    /// machine interprets it once the entry commits.
    pub command: Vec<u8>,
}

/// The Raft log: a sequence of commands replicated across the cluster and
/// applied in order to each node's state machine.
///
/// In the steady state the log is append-only: the leader appends a proposed
/// command to its own log and replicates it to followers, who splice it into
/// theirs. Once an index is replicated to a majority it is committed and
/// becomes immutable. Uncommitted entries can still be replaced: a deposed
/// leader may hold entries that never reached consensus, and a newer leader
/// will overwrite them when its log disagrees.
///
/// Invariants:
///
/// * Entry indexes are contiguous starting at 1 (no gaps).
/// * Entry terms never decrease from the previous entry.
/// * Entries with the same index and term contain the same command, and so
///   do all entries preceding them (see section 5.3 in the Raft paper).
///
/// The log is kept entirely in memory, with entries stored oldest first for
/// O(1) tail access, append, and truncation. Durability is the host's
/// concern: it must persist the log before any message responding to it is
/// transmitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    /// Creates a new, empty log.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Returns the number of entries in the log.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns true if the log contains no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the last log index and term, or (0, 0) if the log is empty.
    pub fn get_last_index(&self) -> (Index, Term) {
        self.entries.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        let entry = self.entries.get(index as usize - 1)?;
        debug_assert_eq!(entry.index, index, "log index mismatch");
        Some(entry)
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Appends a command to the log under the given term, returning its
    /// index. Only the leader appends directly; followers splice().
    pub fn append(&mut self, term: Term, command: Vec<u8>) -> Index {
        let (last_index, last_term) = self.get_last_index();
        debug_assert!(term > 0, "can't append entry in term 0");
        debug_assert!(term >= last_term, "term regression {last_term} → {term}");
        let entry = Entry { index: last_index + 1, term, command };
        self.entries.push(entry);
        last_index + 1
    }

    /// Returns the entries after the given index, oldest first.
    pub fn scan_from(&self, after: Index) -> &[Entry] {
        let start = (after as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Splices a set of contiguous entries into the log, as instructed by the
    /// leader. Entries already present with the same index and term are
    /// skipped (they are necessarily identical). At the first conflicting
    /// index (same index, different term) the old tail is truncated and the
    /// remaining entries are appended. The first entry must be at or below
    /// last_index + 1, i.e. connect to the existing log.
    ///
    /// Returns the resulting last index. Splicing the same entries twice is a
    /// noop the second time, and a splice never rewrites an entry it already
    /// agrees on, so committed entries are never touched.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Index {
        debug_assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        debug_assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );

        // Skip entries that are already in the log.
        let Some(start) = entries.iter().position(|e| !self.has(e.index, e.term)) else {
            return self.get_last_index().0;
        };

        let first = &entries[start];
        let (last_index, _) = self.get_last_index();
        if first.index == 0 || first.index > last_index + 1 {
            bug!("spliced entry {} does not touch the log at {}", first.index, last_index);
            return last_index;
        }

        // Truncate the conflicting tail (if any), then append the new entries.
        self.entries.truncate(first.index as usize - 1);
        self.entries.extend(entries.into_iter().skip(start));
        self.get_last_index().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a log entry.
    fn entry(index: Index, term: Term, command: &[u8]) -> Entry {
        Entry { index, term, command: command.to_vec() }
    }

    /// Builds a log from (term, command) pairs.
    fn log(entries: &[(Term, &[u8])]) -> Log {
        let mut log = Log::new();
        for (term, command) in entries {
            log.append(*term, command.to_vec());
        }
        log
    }

    #[test]
    fn empty_log() {
        let log = Log::new();
        assert_eq!(log.get_last_index(), (0, 0));
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
        assert_eq!(log.get(0), None);
        assert_eq!(log.get(1), None);
        assert!(!log.has(0, 0));
        assert!(log.scan_from(0).is_empty());
    }

    #[test]
    fn append_assigns_contiguous_indexes() {
        let log = log(&[(1, b"a"), (1, b"b"), (2, b"c")]);
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.len(), 3);
        assert_eq!(log.get(2), Some(&entry(2, 1, b"b")));
        assert!(log.has(3, 2));
        assert!(!log.has(3, 1));
        assert!(!log.has(4, 2));
    }

    #[test]
    fn scan_from_returns_tail() {
        let log = log(&[(1, b"a"), (1, b"b"), (2, b"c")]);
        assert_eq!(log.scan_from(0).len(), 3);
        assert_eq!(log.scan_from(1), &[entry(2, 1, b"b"), entry(3, 2, b"c")]);
        assert!(log.scan_from(3).is_empty());
        assert!(log.scan_from(7).is_empty());
    }

    #[test]
    fn splice_appends_new_entries() {
        let mut log = log(&[(1, b"a")]);
        let last = log.splice(vec![entry(2, 1, b"b"), entry(3, 2, b"c")]);
        assert_eq!(last, 3);
        assert_eq!(log.get_last_index(), (3, 2));
    }

    #[test]
    fn splice_is_idempotent() {
        let mut log = log(&[(1, b"a")]);
        let entries = vec![entry(2, 1, b"b"), entry(3, 2, b"c")];
        log.splice(entries.clone());
        let before = log.clone();
        let last = log.splice(entries);
        assert_eq!(last, 3);
        assert_eq!(log, before);
    }

    #[test]
    fn splice_truncates_conflicting_tail() {
        let mut log = log(&[(1, b"a"), (1, b"b"), (1, b"d")]);
        let last = log.splice(vec![entry(3, 2, b"c")]);
        assert_eq!(last, 3);
        assert_eq!(log.get(3), Some(&entry(3, 2, b"c")));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn splice_skips_matching_prefix() {
        // A matching empty or duplicate splice must not truncate entries
        // beyond it: a delayed message must not drop acknowledged entries.
        let mut log = log(&[(1, b"a"), (1, b"b"), (1, b"c")]);
        let before = log.clone();
        log.splice(vec![entry(1, 1, b"a")]);
        assert_eq!(log, before);
        log.splice(Vec::new());
        assert_eq!(log, before);
    }

    #[test]
    fn splice_replaces_divergent_suffix() {
        let mut log = log(&[(1, b"a"), (2, b"b"), (2, b"c")]);
        log.splice(vec![entry(2, 3, b"x"), entry(3, 3, b"y"), entry(4, 3, b"z")]);
        assert_eq!(log.get_last_index(), (4, 3));
        assert_eq!(log.get(1), Some(&entry(1, 1, b"a")));
        assert_eq!(log.get(2), Some(&entry(2, 3, b"x")));
    }
}
