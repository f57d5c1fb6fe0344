//! The replicated, append-only command log (spec section: "Log and
//! Compaction"). Indices are contiguous and strictly increasing from
//! `snapshot_last_index + 1`. When `persist` is enabled, every mutation is
//! mirrored into a `sled` tree keyed by the 20-digit zero-padded index
//! format spec section "External Interfaces" specifies, so the log
//! survives a restart.

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::RaftError;

/// One entry in the replicated log: `(term, index, command)` from spec
/// section "Data Model". Entries are created once at the leader and never
/// mutated; they are only removed by truncation (conflict resolution) or
/// compaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// A follower's rejection hint, letting the leader back off in O(terms)
/// rather than O(entries) (spec section: "Role State Machine", Follower).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConflictHint {
    pub index: u64,
}

fn encode_index(index: u64) -> String {
    format!("{:020}", index)
}

struct Persistence {
    entries: sled::Tree,
    meta: sled::Tree,
}

/// The replicated log. Entries are kept resident in memory (bounded by
/// `maxLogRetention`-driven compaction) with an optional write-through
/// mirror to disk.
pub struct Log {
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    entries: Vec<LogEntry>,
    persistence: Option<Persistence>,
}

impl Log {
    pub fn new_volatile() -> Self {
        Log {
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            entries: Vec::new(),
            persistence: None,
        }
    }

    /// Opens (or creates) a persistent log backed by the given `sled::Db`,
    /// replaying any entries and snapshot metadata already on disk.
    pub fn open_persistent(db: &sled::Db) -> Result<Self, RaftError> {
        let entries_tree = db.open_tree("log_entries")?;
        let meta = db.open_tree("log_meta")?;

        let snapshot_last_index = meta
            .get(b"snapshot_last_index")?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(0);
        let snapshot_last_term = meta
            .get(b"snapshot_last_term")?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(0);

        let mut entries = Vec::new();
        for item in entries_tree.iter() {
            let (_, v) = item?;
            let entry: LogEntry = rmp_serde::from_slice(&v)?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.index);

        Ok(Log {
            snapshot_last_index,
            snapshot_last_term,
            entries,
            persistence: Some(Persistence {
                entries: entries_tree,
                meta,
            }),
        })
    }

    fn persist_entry(&self, entry: &LogEntry) -> Result<(), RaftError> {
        if let Some(p) = &self.persistence {
            let bytes = rmp_serde::to_vec(entry)?;
            p.entries.insert(encode_index(entry.index), bytes)?;
        }
        Ok(())
    }

    fn persist_truncation(&self, from_index_inclusive: u64) -> Result<(), RaftError> {
        if let Some(p) = &self.persistence {
            let start = encode_index(from_index_inclusive);
            let keys: Vec<_> = p
                .entries
                .range(start.as_bytes().to_vec()..)
                .keys()
                .filter_map(|k| k.ok())
                .collect();
            for k in keys {
                p.entries.remove(k)?;
            }
        }
        Ok(())
    }

    fn persist_snapshot_meta(&self) -> Result<(), RaftError> {
        if let Some(p) = &self.persistence {
            p.meta
                .insert(b"snapshot_last_index", &self.snapshot_last_index.to_be_bytes())?;
            p.meta
                .insert(b"snapshot_last_term", &self.snapshot_last_term.to_be_bytes())?;
        }
        Ok(())
    }

    fn position_of(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let pos = index - self.snapshot_last_index - 1;
        if pos < self.entries.len() as u64 {
            Some(pos as usize)
        } else {
            None
        }
    }

    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        self.position_of(index).map(|p| self.entries[p].clone())
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.position_of(index).map(|p| self.entries[p].term)
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_last_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    pub fn snapshot_last_index(&self) -> u64 {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> u64 {
        self.snapshot_last_term
    }

    /// Leader-only: appends `command` at the next index in `term`.
    pub fn append(&mut self, term: u64, command: Command) -> Result<LogEntry, RaftError> {
        let entry = LogEntry {
            term,
            index: self.last_index() + 1,
            command,
        };
        self.persist_entry(&entry)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn first_index_of_term(&self, term: u64) -> u64 {
        for e in &self.entries {
            if e.term == term {
                return e.index;
            }
        }
        self.snapshot_last_index + 1
    }

    /// Follower-only: attempts to extend the log after `(prev_index,
    /// prev_term)`, truncating any conflicting suffix and appending the
    /// rest idempotently (spec section: "Role State Machine", Follower).
    pub fn append_after(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        new_entries: Vec<LogEntry>,
    ) -> Result<(), ConflictHint> {
        if prev_index > 0 {
            match self.term_at(prev_index) {
                Some(t) if t == prev_term => {}
                Some(t) => {
                    return Err(ConflictHint {
                        index: self.first_index_of_term(t),
                    })
                }
                None => {
                    return Err(ConflictHint {
                        index: self.last_index() + 1,
                    })
                }
            }
        }

        for e in new_entries {
            if let Some(existing) = self.entry(e.index) {
                if existing.term == e.term {
                    continue;
                }
                self.truncate_suffix_after(e.index.saturating_sub(1));
            }
            debug_assert_eq!(e.index, self.last_index() + 1);
            // Infallible for the in-memory path; persistence errors are
            // logged rather than aborting replication, matching spec
            // section "Error Handling Design": log/storage errors pause
            // the applier, not the replication path itself.
            if let Err(e2) = self.persist_entry(&e) {
                log::warn!("failed to persist log entry {}: {}", e.index, e2);
            }
            self.entries.push(e);
        }
        Ok(())
    }

    /// Drops every entry after `index` (exclusive boundary kept).
    pub fn truncate_suffix_after(&mut self, index: u64) {
        if let Err(e) = self.persist_truncation(index + 1) {
            log::warn!("failed to persist truncation after {}: {}", index, e);
        }
        if index < self.snapshot_last_index {
            // Truncating into the snapshot prefix would lose committed
            // history; this should never be requested in practice.
            self.entries.clear();
            return;
        }
        let keep = (index - self.snapshot_last_index) as usize;
        self.entries.truncate(keep.min(self.entries.len()));
    }

    /// Returns up to `max_bytes` worth of entries starting at `index`
    /// (byte budget estimated from the serialized command size).
    pub fn entries_from(&self, index: u64, max_bytes: usize) -> Vec<LogEntry> {
        let mut out = Vec::new();
        let mut budget = max_bytes;
        let mut idx = index;
        while let Some(e) = self.entry(idx) {
            let approx = rmp_serde::to_vec(&e).map(|v| v.len()).unwrap_or(64);
            if !out.is_empty() && approx > budget {
                break;
            }
            budget = budget.saturating_sub(approx);
            out.push(e);
            idx += 1;
        }
        out
    }

    /// True if a candidate whose log ends at `(candidate_last_term,
    /// candidate_last_index)` is at least as up-to-date as ours (spec
    /// section: "Role State Machine", Follower / RequestVote).
    pub fn is_candidate_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let (our_term, our_index) = (self.last_term(), self.last_index());
        candidate_last_term > our_term
            || (candidate_last_term == our_term && candidate_last_index >= our_index)
    }

    /// Replaces the retained prefix through `through_index` with a
    /// snapshot boundary, keeping a term-only sentinel at `through_index`
    /// for `AppendEntries` consistency checks (spec section: "Log and
    /// Compaction").
    pub fn compact_through(&mut self, through_index: u64) -> Result<(), RaftError> {
        if through_index <= self.snapshot_last_index {
            return Ok(());
        }
        let term = self
            .term_at(through_index)
            .ok_or_else(|| RaftError::Protocol("compact index not present in log".into()))?;
        let drop_count = (through_index - self.snapshot_last_index) as usize;
        if let Some(p) = &self.persistence {
            for e in self.entries.iter().take(drop_count) {
                p.entries.remove(encode_index(e.index))?;
            }
        }
        self.entries.drain(0..drop_count.min(self.entries.len()));
        self.snapshot_last_index = through_index;
        self.snapshot_last_term = term;
        self.persist_snapshot_meta()?;
        Ok(())
    }

    /// Follower-only: re-anchors the log at `(last_index, last_term)`
    /// after installing a snapshot, discarding whatever entries it had.
    pub fn install_snapshot_boundary(&mut self, last_index: u64, last_term: u64) -> Result<(), RaftError> {
        if let Some(p) = &self.persistence {
            p.entries.clear()?;
        }
        self.entries.clear();
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
        self.persist_snapshot_meta()?;
        Ok(())
    }

    pub fn retained_len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::command::Command;

    pub fn entry_with_term(index: u64, term: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Command::Put {
                key: format!("k{}", index).into_bytes(),
                value: format!("v{}", index).into_bytes(),
            },
        }
    }

    pub fn log_with_entries(count: u64, term: u64) -> Log {
        let mut log = Log::new_volatile();
        for i in 1..=count {
            log.append(term, entry_with_term(i, term).command).unwrap();
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;

    #[test]
    fn append_assigns_contiguous_indices() {
        let mut log = Log::new_volatile();
        let e1 = log.append(1, entry_with_term(1, 1).command).unwrap();
        let e2 = log.append(1, entry_with_term(2, 1).command).unwrap();
        assert_eq!(e1.index, 1);
        assert_eq!(e2.index, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn append_after_rejects_missing_prev_with_length_hint() {
        let mut log = log_with_entries(3, 1);
        let err = log
            .append_after(10, 1, vec![entry_with_term(11, 1)])
            .unwrap_err();
        assert_eq!(err.index, 4);
    }

    #[test]
    fn append_after_rejects_conflicting_term_with_first_index_of_term() {
        let mut log = Log::new_volatile();
        log.append(1, entry_with_term(1, 1).command).unwrap();
        log.append(2, entry_with_term(2, 2).command).unwrap();
        log.append(2, entry_with_term(3, 2).command).unwrap();
        // Follower thinks index 3 has term 2 (correct) but leader claims
        // prev_term 5 there -> conflict, hint should be the first index of
        // term 2 in our own log (index 2).
        let err = log.append_after(3, 5, vec![]).unwrap_err();
        assert_eq!(err.index, 2);
    }

    #[test]
    fn append_after_truncates_conflicting_suffix() {
        let mut log = log_with_entries(5, 1);
        let new_entry = LogEntry {
            term: 2,
            index: 3,
            command: entry_with_term(3, 2).command,
        };
        log.append_after(2, 1, vec![new_entry]).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
    }

    #[test]
    fn append_after_is_idempotent_for_already_present_entries() {
        let mut log = log_with_entries(3, 1);
        let dup = log.entry(2).unwrap();
        log.append_after(1, 1, vec![dup]).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn compaction_keeps_sentinel_term() {
        let mut log = log_with_entries(5, 1);
        log.compact_through(3).unwrap();
        assert_eq!(log.snapshot_last_index(), 3);
        assert_eq!(log.snapshot_last_term(), 1);
        assert_eq!(log.term_at(3), Some(1));
        assert_eq!(log.retained_len(), 2);
    }

    #[test]
    fn install_snapshot_boundary_discards_entries() {
        let mut log = log_with_entries(5, 1);
        log.install_snapshot_boundary(10, 3).unwrap();
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.retained_len(), 0);
    }

    #[test]
    fn up_to_date_check_matches_spec_rule() {
        let log = log_with_entries(3, 2);
        assert!(log.is_candidate_up_to_date(3, 0));
        assert!(log.is_candidate_up_to_date(2, 3));
        assert!(!log.is_candidate_up_to_date(2, 2));
        assert!(!log.is_candidate_up_to_date(1, 100));
    }

    #[test]
    fn persistent_log_reloads_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        {
            let mut log = Log::open_persistent(&db).unwrap();
            log.append(1, entry_with_term(1, 1).command).unwrap();
            log.append(1, entry_with_term(2, 1).command).unwrap();
            log.compact_through(1).unwrap();
        }
        let reloaded = Log::open_persistent(&db).unwrap();
        assert_eq!(reloaded.last_index(), 2);
        assert_eq!(reloaded.snapshot_last_index(), 1);
        assert_eq!(reloaded.retained_len(), 1);
    }

    #[test]
    fn entries_from_respects_byte_budget_but_always_returns_at_least_one() {
        let log = log_with_entries(10, 1);
        let entries = log.entries_from(1, 1);
        assert!(!entries.is_empty());
        assert!(entries.len() <= 10);
    }
}
