//! Offline journal resize.
//!
//! Rewrites a stopped queue's journal with a new geometry, keeping only the
//! records still in the queue. The new journal is built in a sibling directory
//! first; only when it is complete are the old files moved into a `_bak`
//! directory inside the journal directory and the new ones moved in. Any failure
//! before that point leaves the original journal untouched.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::core::journal::replay::Replay;
use crate::core::journal::{
    framed_len, Journal, JournalError, JournalGeometry, JournalRecord, SETTLE_RESERVE,
};
use crate::core::wal::WalConfig;

#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("{0} is not a journal directory")]
    NotAJournal(PathBuf),

    #[error("journal of queue {queue} has {count} unresolved transaction(s); open the store once to resolve them")]
    Unresolved { queue: String, count: usize },

    #[error("journal of queue {queue} holds {needed} bytes of records, but {geometry} only admits {limit} bytes")]
    TooSmall {
        queue: String,
        needed: u64,
        limit: u64,
        geometry: JournalGeometry,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeReport {
    pub queue: String,
    pub old_geometry: JournalGeometry,
    pub new_geometry: JournalGeometry,
    /// Enqueue records carried over.
    pub records: usize,
    /// Bytes of record stream written to the new journal.
    pub bytes: u64,
    /// Where the original files were moved.
    pub backup: PathBuf,
}

/// Rewrite the journal in `dir` with `geometry`. The owning store must not be
/// running.
pub fn resize_journal(dir: &Path, geometry: JournalGeometry) -> Result<ResizeReport, ResizeError> {
    geometry
        .validate()
        .map_err(|e| ResizeError::InvalidGeometry(e.to_string()))?;
    if !dir.join(crate::core::journal::geometry::INFO_FILE).is_file() {
        return Err(ResizeError::NotAJournal(dir.to_path_buf()));
    }

    let scan = Journal::scan(dir)?;
    let mut replay = Replay::new();
    for rec in scan.records {
        replay
            .apply(rec.rid, rec.record)
            .map_err(JournalError::Corruption)?;
    }
    let unresolved = replay.unresolved();
    if !unresolved.is_empty() {
        return Err(ResizeError::Unresolved {
            queue: scan.queue,
            count: unresolved.len(),
        });
    }

    // Renumbered from 1: an enqueue, then its delivered marker if it had one.
    let survivors = replay.into_survivors();
    let mut records = Vec::with_capacity(survivors.len());
    let mut needed = 0u64;
    for (i, rec) in survivors.into_iter().enumerate() {
        let enqueue = JournalRecord::Enqueue {
            txn: None,
            position: rec.position,
            replaces: None,
            message: rec.message,
        };
        needed += framed_len(&enqueue)?;
        if rec.delivered {
            needed += framed_len(&JournalRecord::Delivered {
                enq_rid: i as u64 + 1,
            })?;
        }
        records.push((enqueue, rec.delivered));
    }
    // The compacted records must leave room to settle each of them later.
    let limit = geometry.enqueue_limit().min(
        geometry
            .settle_limit()
            .saturating_sub(SETTLE_RESERVE * records.len() as u64),
    );
    if needed > limit {
        return Err(ResizeError::TooSmall {
            queue: scan.queue,
            needed,
            limit,
            geometry,
        });
    }

    let staging = staging_dir(dir)?;
    let written = write_compacted(&staging, &scan.queue, geometry, &records);
    if let Err(err) = written {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    let backup = backup_dir(dir);
    swap_in(dir, &staging, &backup)?;
    info!(
        queue = %scan.queue,
        old = %scan.geometry,
        new = %geometry,
        records = records.len(),
        bytes = needed,
        backup = %backup.display(),
        "journal resized"
    );
    Ok(ResizeReport {
        queue: scan.queue,
        old_geometry: scan.geometry,
        new_geometry: geometry,
        records: records.len(),
        bytes: needed,
        backup,
    })
}

fn write_compacted(
    staging: &Path,
    queue: &str,
    geometry: JournalGeometry,
    records: &[(JournalRecord, bool)],
) -> Result<(), ResizeError> {
    let config = WalConfig {
        fsync_every_n: None,
        fsync_interval: None,
    };
    let journal = Journal::create(staging, queue, geometry, config)?;
    for (enqueue, delivered) in records {
        let rid = journal.append(enqueue)?;
        if *delivered {
            journal.append(&JournalRecord::Delivered { enq_rid: rid })?;
        }
    }
    journal.flush()?;
    Ok(())
}

fn staging_dir(dir: &Path) -> Result<PathBuf, ResizeError> {
    let name = dir
        .file_name()
        .ok_or_else(|| ResizeError::NotAJournal(dir.to_path_buf()))?;
    let mut staging = name.to_os_string();
    staging.push(".resize");
    Ok(dir.with_file_name(staging))
}

/// First free `_bak`, `_bak.1`, `_bak.2`, ... inside `dir`.
fn backup_dir(dir: &Path) -> PathBuf {
    let first = dir.join("_bak");
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("_bak.{n}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Move the current journal files into `backup` and the staged ones into `dir`.
fn swap_in(dir: &Path, staging: &Path, backup: &Path) -> Result<(), ResizeError> {
    fs::create_dir_all(backup)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            let target = backup.join(path.file_name().unwrap_or_default());
            fs::rename(&path, &target)?;
            debug!(from = %path.display(), to = %target.display(), "backed up journal file");
        }
    }
    for entry in fs::read_dir(staging)? {
        let path = entry?.path();
        fs::rename(&path, dir.join(path.file_name().unwrap_or_default()))?;
    }
    fs::remove_dir_all(staging)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;

    fn fill(dir: &Path, count: u64, body: usize) {
        let journal = Journal::create(
            dir,
            "q",
            JournalGeometry::new(8, 24).unwrap(),
            WalConfig::default(),
        )
        .unwrap();
        for position in 1..=count {
            let rid = journal
                .append(&JournalRecord::Enqueue {
                    txn: None,
                    position,
                    replaces: None,
                    message: Message::new(vec![7u8; body]).durable(true),
                })
                .unwrap();
            if position % 2 == 0 {
                journal
                    .append(&JournalRecord::Dequeue { enq_rid: rid, txn: None })
                    .unwrap();
            } else if position == 1 {
                journal
                    .append(&JournalRecord::Delivered { enq_rid: rid })
                    .unwrap();
            }
        }
        journal.flush().unwrap();
    }

    #[test]
    fn compacts_live_records_and_backs_up() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("q");
        fill(&dir, 10, 1000);

        let report = resize_journal(&dir, JournalGeometry::new(4, 1).unwrap()).unwrap();
        assert_eq!(report.records, 5);
        assert!(report.backup.join("journal.toml").exists());

        let (journal, records) = Journal::open(&dir, WalConfig::default()).unwrap();
        assert_eq!(journal.geometry(), JournalGeometry::new(4, 1).unwrap());
        let positions: Vec<u64> = records
            .iter()
            .filter_map(|r| match &r.record {
                JournalRecord::Enqueue { position, .. } => Some(*position),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![1, 3, 5, 7, 9]);
        assert_eq!(records[1].record, JournalRecord::Delivered { enq_rid: 1 });
    }

    #[test]
    fn too_small_leaves_original_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("q");
        fill(&dir, 200, 10_000);
        let before = fs::read_dir(&dir).unwrap().count();

        let err = resize_journal(&dir, JournalGeometry::new(4, 4).unwrap()).unwrap_err();
        assert!(matches!(err, ResizeError::TooSmall { .. }));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), before);
        assert!(!dir.join("_bak").exists());
        assert_eq!(Journal::scan(&dir).unwrap().geometry, JournalGeometry::new(8, 24).unwrap());
    }

    #[test]
    fn geometry_bounds_are_checked_first() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resize_journal(
            tmp.path(),
            JournalGeometry {
                num_files: 3,
                file_size_pages: 1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ResizeError::InvalidGeometry(_)));
    }
}
