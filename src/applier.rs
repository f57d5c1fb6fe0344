//! The database applier (spec section: "Command Pipeline", "Database
//! Applier"): a dedicated background thread that turns committed log
//! entries into `KvStore` mutations, one index at a time, in order.
//!
//! Kept off the main actor thread so a slow or blocked storage call never
//! stalls election timers or replication; the log itself stays owned
//! exclusively by the actor, which only ever hands the applier owned
//! clones of already-committed entries.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::command::{Command, CommandResult, WriteOp};
use crate::error::RaftError;
use crate::log_store::LogEntry;
use crate::storage::{BatchOp, KvStore};

use super::server::MainThreadMessage;

pub enum ApplierMessage {
    Apply(Vec<LogEntry>),
    Shutdown,
}

pub struct ApplierHandle {
    to_applier: Sender<ApplierMessage>,
    thread: Option<JoinHandle<()>>,
}

impl ApplierHandle {
    pub fn start(db: Arc<dyn KvStore>, to_main: Sender<MainThreadMessage>) -> ApplierHandle {
        let (to_applier, from_main) = channel();
        let thread = thread::spawn(move || applier_main(db, from_main, to_main));
        ApplierHandle {
            to_applier,
            thread: Some(thread),
        }
    }

    pub fn apply(&self, entries: Vec<LogEntry>) {
        let _ = self.to_applier.send(ApplierMessage::Apply(entries));
    }
}

impl Drop for ApplierHandle {
    fn drop(&mut self) {
        let _ = self.to_applier.send(ApplierMessage::Shutdown);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn applier_main(db: Arc<dyn KvStore>, from_main: Receiver<ApplierMessage>, to_main: Sender<MainThreadMessage>) {
    loop {
        let msg = match from_main.recv() {
            Ok(m) => m,
            Err(_) => return,
        };
        match msg {
            ApplierMessage::Shutdown => return,
            ApplierMessage::Apply(entries) => {
                let mut results = Vec::with_capacity(entries.len());
                for entry in entries {
                    let already_applied = db.last_applied_index().unwrap_or(0) >= entry.index;
                    let outcome = if already_applied {
                        Ok(CommandResult::Ok)
                    } else {
                        let outcome = apply_one(&*db, &entry.command);
                        if let Err(e) = db.set_last_applied_index(entry.index) {
                            log::warn!("failed to persist applied index {}: {}", entry.index, e);
                        }
                        outcome
                    };
                    results.push((entry.index, outcome));
                }
                let to_index = results.last().map(|(i, _)| *i).unwrap_or(0);
                if to_index > 0 {
                    let _ = to_main.send(MainThreadMessage::EntriesApplied { to_index, results });
                }
            }
        }
    }
}

fn apply_one(db: &dyn KvStore, command: &Command) -> Result<CommandResult, RaftError> {
    match command {
        Command::Put { key, value } => {
            db.put(key, value)?;
            Ok(CommandResult::Ok)
        }
        Command::Delete { key } => {
            let existed = db.get(key)?.is_some();
            db.delete(key)?;
            Ok(CommandResult::Deleted(existed))
        }
        Command::Batch(ops) => {
            let converted: Vec<BatchOp> = ops
                .iter()
                .map(|op| match op {
                    WriteOp::Put { key, value } => BatchOp::Put(key.clone(), value.clone()),
                    WriteOp::Delete { key } => BatchOp::Delete(key.clone()),
                })
                .collect();
            db.apply_batch(&converted)?;
            Ok(CommandResult::Ok)
        }
        // Topology changes and consensus no-ops are applied as committed
        // log entries (so `last_applied` tracks them for read-index
        // purposes) but never touch the key-value store.
        Command::Join(_) | Command::Leave(_) | Command::Consensus { .. } => Ok(CommandResult::Ok),
        Command::Get { .. } => {
            unreachable!("Get is volatile and is never appended to the log")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::mpsc;
    use std::time::Duration;

    fn entry(index: u64, command: Command) -> LogEntry {
        LogEntry { term: 1, index, command }
    }

    #[test]
    fn applies_put_and_reports_result() {
        let db: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let (to_main, from_applier) = mpsc::channel();
        let handle = ApplierHandle::start(db.clone(), to_main);

        handle.apply(vec![entry(
            1,
            Command::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
        )]);

        match from_applier.recv_timeout(Duration::from_secs(1)).unwrap() {
            MainThreadMessage::EntriesApplied { to_index, results } => {
                assert_eq!(to_index, 1);
                assert!(matches!(results[0].1, Ok(CommandResult::Ok)));
            }
            other => panic!("unexpected message: {:?}", std::mem::discriminant(&other)),
        }
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.last_applied_index().unwrap(), 1);
    }

    #[test]
    fn skips_already_applied_entries_idempotently() {
        let db: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        db.set_last_applied_index(5).unwrap();
        let (to_main, from_applier) = mpsc::channel();
        let handle = ApplierHandle::start(db.clone(), to_main);

        handle.apply(vec![entry(
            3,
            Command::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
        )]);

        let _ = from_applier.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }
}
