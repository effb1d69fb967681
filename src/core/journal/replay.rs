//! Interpretation of a scanned journal: which enqueues survive, which
//! transactions are still undecided.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::JournalRecord;
use crate::core::message::Message;
use crate::core::txn::TxnId;

/// A durable enqueue that is still in the queue after replay.
#[derive(Debug, Clone)]
pub(crate) struct RecoveredRecord {
    pub rid: u64,
    pub position: u64,
    pub message: Message,
    pub delivered: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Replay {
    first_rid: Option<u64>,
    survivors: BTreeMap<u64, RecoveredRecord>,
    positions: HashMap<u64, u64>,
    transient: HashSet<u64>,
    pending: HashMap<TxnId, Vec<(u64, JournalRecord)>>,
    pending_order: Vec<TxnId>,
}

impl Replay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply one record in log order. Errors describe a log that contradicts itself.
    pub(crate) fn apply(&mut self, rid: u64, record: JournalRecord) -> Result<(), String> {
        self.first_rid.get_or_insert(rid);
        match record {
            JournalRecord::Enqueue { txn: Some(txn), .. }
            | JournalRecord::Dequeue { txn: Some(txn), .. } => {
                if !self.pending.contains_key(&txn) {
                    self.pending_order.push(txn);
                }
                self.pending.entry(txn).or_default().push((rid, record));
                Ok(())
            }
            JournalRecord::Commit { txn } => self.resolve(txn, true),
            JournalRecord::Abort { txn } => self.resolve(txn, false),
            JournalRecord::Delivered { enq_rid } => {
                if let Some(rec) = self.survivors.get_mut(&enq_rid) {
                    rec.delivered = true;
                }
                Ok(())
            }
            other => self.apply_effect(rid, other),
        }
    }

    /// Transactions with effects in the log but no commit or abort marker.
    pub(crate) fn unresolved(&self) -> Vec<TxnId> {
        self.pending_order
            .iter()
            .filter(|txn| self.pending.contains_key(txn))
            .copied()
            .collect()
    }

    /// Apply (`commit`) or drop the buffered effects of `txn`.
    pub(crate) fn resolve(&mut self, txn: TxnId, commit: bool) -> Result<(), String> {
        let Some(records) = self.pending.remove(&txn) else {
            return Ok(());
        };
        if commit {
            for (rid, record) in records {
                self.apply_effect(rid, record)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn survivor_count(&self) -> usize {
        self.survivors.len()
    }

    /// Surviving durable enqueues in log order.
    pub(crate) fn into_survivors(self) -> Vec<RecoveredRecord> {
        self.survivors.into_values().collect()
    }

    fn apply_effect(&mut self, rid: u64, record: JournalRecord) -> Result<(), String> {
        match record {
            JournalRecord::Enqueue {
                position,
                replaces,
                message,
                ..
            } => {
                if let Some(old) = replaces {
                    self.remove(old, rid)?;
                }
                if !message.durable {
                    self.transient.insert(rid);
                    return Ok(());
                }
                if let Some(existing) = self.positions.get(&position) {
                    return Err(format!(
                        "record {rid} enqueues at position {position} already held by record {existing}"
                    ));
                }
                self.positions.insert(position, rid);
                self.survivors.insert(
                    rid,
                    RecoveredRecord {
                        rid,
                        position,
                        message,
                        delivered: false,
                    },
                );
                Ok(())
            }
            JournalRecord::Dequeue { enq_rid, .. } => self.remove(enq_rid, rid),
            _ => Ok(()),
        }
    }

    fn remove(&mut self, enq_rid: u64, by: u64) -> Result<(), String> {
        if let Some(rec) = self.survivors.remove(&enq_rid) {
            self.positions.remove(&rec.position);
            return Ok(());
        }
        let before_window = self.first_rid.is_some_and(|first| enq_rid < first);
        if before_window || self.transient.contains(&enq_rid) {
            return Ok(());
        }
        Err(format!(
            "record {by} removes record {enq_rid}, which is not enqueued"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enq(txn: Option<TxnId>, position: u64, body: &'static str) -> JournalRecord {
        JournalRecord::Enqueue {
            txn,
            position,
            replaces: None,
            message: Message::new(body.as_bytes()).durable(true),
        }
    }

    #[test]
    fn uncommitted_effects_are_left_pending() {
        let txn = TxnId::new();
        let mut replay = Replay::new();
        replay.apply(1, enq(None, 1, "a")).unwrap();
        replay.apply(2, enq(Some(txn), 2, "b")).unwrap();
        replay
            .apply(3, JournalRecord::Dequeue { enq_rid: 1, txn: Some(txn) })
            .unwrap();

        assert_eq!(replay.unresolved(), vec![txn]);
        assert_eq!(replay.survivor_count(), 1);

        replay.resolve(txn, false).unwrap();
        let survivors = replay.into_survivors();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].rid, 1);
    }

    #[test]
    fn commit_marker_applies_effects_in_order() {
        let txn = TxnId::new();
        let mut replay = Replay::new();
        replay.apply(1, enq(None, 1, "a")).unwrap();
        replay.apply(2, JournalRecord::Delivered { enq_rid: 1 }).unwrap();
        replay.apply(3, enq(Some(txn), 2, "b")).unwrap();
        replay
            .apply(4, JournalRecord::Dequeue { enq_rid: 1, txn: Some(txn) })
            .unwrap();
        replay.apply(5, JournalRecord::Commit { txn }).unwrap();

        assert!(replay.unresolved().is_empty());
        let survivors = replay.into_survivors();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].position, 2);
        assert!(!survivors[0].delivered);
    }

    #[test]
    fn replacement_takes_over_position() {
        let mut replay = Replay::new();
        replay.apply(1, enq(None, 1, "A1")).unwrap();
        replay
            .apply(
                2,
                JournalRecord::Enqueue {
                    txn: None,
                    position: 1,
                    replaces: Some(1),
                    message: Message::new(&b"A2"[..]).durable(true),
                },
            )
            .unwrap();
        let survivors = replay.into_survivors();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].rid, 2);
        assert_eq!(&survivors[0].message.body[..], b"A2");
    }

    #[test]
    fn dequeue_of_unknown_record_inside_window_is_rejected() {
        let mut replay = Replay::new();
        replay.apply(5, enq(None, 1, "a")).unwrap();
        assert!(replay
            .apply(6, JournalRecord::Dequeue { enq_rid: 3, txn: None })
            .is_ok());
        assert!(replay
            .apply(7, JournalRecord::Dequeue { enq_rid: 6, txn: None })
            .is_err());
    }

    #[test]
    fn transient_records_are_skipped() {
        let mut replay = Replay::new();
        replay
            .apply(
                1,
                JournalRecord::Enqueue {
                    txn: None,
                    position: 1,
                    replaces: None,
                    message: Message::new(&b"t"[..]),
                },
            )
            .unwrap();
        replay
            .apply(2, JournalRecord::Dequeue { enq_rid: 1, txn: None })
            .unwrap();
        assert_eq!(replay.survivor_count(), 0);
    }
}
