//! Store recovery: catalog, transaction decisions, then every durable queue
//! journal, before the store accepts any operation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::core::catalog::QueueDecl;
use crate::core::events::FlowEvents;
use crate::core::journal::geometry::INFO_FILE;
use crate::core::journal::replay::Replay;
use crate::core::journal::{Journal, JournalError, JournalRecord};
use crate::core::queue::Queue;
use crate::core::txn::{TxnDecision, TxnId};
use crate::core::wal::{WalConfig, WalRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Stopped,
    Replaying,
    Ready,
}

/// Summary of one recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub exchanges: usize,
    pub queues: usize,
    /// Durable records restored across all queues.
    pub records: usize,
    pub rolled_forward: usize,
    pub rolled_back: usize,
    /// Queues whose journal could not be replayed.
    pub poisoned: Vec<String>,
    /// Journal directories with no durable queue in the catalog.
    pub orphans: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Commit decisions recorded in the transaction log.
pub(crate) fn committed_transactions(records: &[WalRecord]) -> Result<HashSet<TxnId>, String> {
    let mut committed = HashSet::with_capacity(records.len());
    for record in records {
        let decision = TxnDecision::decode(&record.payload)
            .map_err(|e| format!("decision record {}: {e}", record.id))?;
        debug!(txn = %decision.txn, queues = ?decision.queues, "found commit decision");
        committed.insert(decision.txn);
    }
    Ok(committed)
}

/// A recovered queue and what replay did to it.
#[derive(Debug)]
pub(crate) struct QueueRecovery {
    pub queue: Queue,
    pub records: usize,
    pub rolled_forward: usize,
    pub rolled_back: usize,
    pub poisoned: bool,
}

/// Rebuild one durable queue from its journal directory. A journal that cannot
/// be replayed yields a poisoned queue rather than an error.
pub(crate) fn recover_queue(
    decl: &QueueDecl,
    dir: &Path,
    config: WalConfig,
    committed: &HashSet<TxnId>,
    events: FlowEvents,
) -> QueueRecovery {
    match replay_queue(decl, dir, config, committed, events.clone()) {
        Ok(recovered) => recovered,
        Err(err) => {
            error!(queue = %decl.name, dir = %dir.display(), error = %err, "journal replay failed");
            QueueRecovery {
                queue: Queue::poisoned(decl, err.to_string(), events),
                records: 0,
                rolled_forward: 0,
                rolled_back: 0,
                poisoned: true,
            }
        }
    }
}

fn replay_queue(
    decl: &QueueDecl,
    dir: &Path,
    config: WalConfig,
    committed: &HashSet<TxnId>,
    events: FlowEvents,
) -> Result<QueueRecovery, JournalError> {
    if !dir.join(INFO_FILE).exists() {
        // Declared, but the journal was never created before the crash.
        let geometry = decl.journal.unwrap_or_default();
        warn!(queue = %decl.name, "journal missing, creating an empty one");
        let journal = Journal::create(dir, &decl.name, geometry, config)?;
        return Ok(QueueRecovery {
            queue: Queue::new(decl, Some(journal), events),
            records: 0,
            rolled_forward: 0,
            rolled_back: 0,
            poisoned: false,
        });
    }

    let (journal, scanned) = Journal::open(dir, config)?;
    if journal.queue() != decl.name {
        return Err(JournalError::Corruption(format!(
            "journal in {} belongs to queue {}",
            dir.display(),
            journal.queue()
        )));
    }
    if decl.journal.is_some_and(|g| g != journal.geometry()) {
        info!(
            queue = %decl.name,
            geometry = %journal.geometry(),
            "journal geometry differs from declaration, using the journal's"
        );
    }

    let mut replay = Replay::new();
    for rec in scanned {
        replay
            .apply(rec.rid, rec.record)
            .map_err(JournalError::Corruption)?;
    }

    let mut markers = Vec::new();
    let mut rolled_forward = 0;
    let mut rolled_back = 0;
    for txn in replay.unresolved() {
        let commit = committed.contains(&txn);
        replay.resolve(txn, commit).map_err(JournalError::Corruption)?;
        if commit {
            rolled_forward += 1;
            markers.push(JournalRecord::Commit { txn });
        } else {
            rolled_back += 1;
            markers.push(JournalRecord::Abort { txn });
        }
        info!(queue = %decl.name, %txn, commit, "resolved in-doubt transaction");
    }

    let survivors = replay.into_survivors();
    let live: HashSet<u64> = survivors.iter().map(|r| r.rid).collect();
    journal.retain_live(&live);
    for marker in &markers {
        journal.append(marker)?;
    }
    journal.flush()?;

    let records = survivors.len();
    let queue = Queue::recover(decl, journal, survivors, events)?;
    Ok(QueueRecovery {
        queue,
        records,
        rolled_forward,
        rolled_back,
        poisoned: false,
    })
}

/// Journal directories under `root` that no durable queue claims.
pub(crate) fn orphan_journals(root: &Path, claimed: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut orphans: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !claimed.contains(p))
        .collect();
    orphans.sort();
    for orphan in &orphans {
        error!(dir = %orphan.display(), "journal directory has no durable queue, ignoring it");
    }
    orphans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::journal::JournalGeometry;
    use crate::core::message::Message;

    #[test]
    fn in_doubt_transactions_follow_the_decision_log() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("q");
        let decl = QueueDecl::new("q").durable(true);
        let decided = TxnId::new();
        let undecided = TxnId::new();
        {
            let journal = Journal::create(
                &dir,
                "q",
                JournalGeometry::new(4, 1).unwrap(),
                WalConfig::default(),
            )
            .unwrap();
            for (position, txn) in [(1, decided), (2, undecided)] {
                journal
                    .append(&JournalRecord::Enqueue {
                        txn: Some(txn),
                        position,
                        replaces: None,
                        message: Message::new(&b"x"[..]).durable(true),
                    })
                    .unwrap();
            }
            journal.flush().unwrap();
        }

        let committed: HashSet<TxnId> = [decided].into_iter().collect();
        let recovered = recover_queue(
            &decl,
            &dir,
            WalConfig::default(),
            &committed,
            FlowEvents::default(),
        );
        assert!(!recovered.poisoned);
        assert_eq!(recovered.records, 1);
        assert_eq!((recovered.rolled_forward, recovered.rolled_back), (1, 1));

        // Markers were written, so a second pass has nothing in doubt.
        drop(recovered);
        let again = recover_queue(
            &decl,
            &dir,
            WalConfig::default(),
            &HashSet::new(),
            FlowEvents::default(),
        );
        assert_eq!(again.records, 1);
        assert_eq!((again.rolled_forward, again.rolled_back), (0, 0));
    }

    #[test]
    fn missing_journal_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let decl = QueueDecl::new("q")
            .durable(true)
            .journal(JournalGeometry::new(4, 1).unwrap());
        let recovered = recover_queue(
            &decl,
            &tmp.path().join("q"),
            WalConfig::default(),
            &HashSet::new(),
            FlowEvents::default(),
        );
        assert!(!recovered.poisoned);
        assert!(tmp.path().join("q").join(INFO_FILE).exists());
    }

    #[test]
    fn orphans_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("kept")).unwrap();
        fs::create_dir_all(tmp.path().join("stray")).unwrap();
        let claimed: HashSet<PathBuf> = [tmp.path().join("kept")].into_iter().collect();
        assert_eq!(
            orphan_journals(tmp.path(), &claimed),
            vec![tmp.path().join("stray")]
        );
    }
}
