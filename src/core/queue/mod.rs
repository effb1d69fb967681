//! Bounded per-queue record structure.
//!
//! A queue keeps its records ordered by position. Each record is either
//! resident (body in memory, counted in the flow state) or paged (body evicted,
//! re-read from the queue's journal on demand). All mutations happen under the
//! queue mutex, and journal appends for a mutation are made while that mutex is
//! held so the log order matches the queue order.

pub mod flow;
pub(crate) mod lvq;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::core::catalog::QueueDecl;
use crate::core::error::StoreError;
use crate::core::events::{FlowCause, FlowEvent, FlowEventKind, FlowEvents};
use crate::core::journal::replay::RecoveredRecord;
use crate::core::journal::{Journal, JournalError, JournalRecord};
use crate::core::message::{
    AdmissionResult, BrowsedMessage, Delivery, DeliveryTag, Message, Residency,
};
use crate::core::txn::TxnId;

use flow::{AdmissionPolicy, FlowState, Overflow, PolicyMode};
use lvq::LvqIndex;

/// Depth and flow figures of a queue at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: u64,
    pub paged: u64,
    pub held: u64,
    pub flow: FlowState,
}

#[derive(Debug, Clone)]
struct Entry {
    /// Body is empty while the entry is paged.
    message: Message,
    size: u64,
    residency: Residency,
    /// Journal record backing this entry, durable or transient.
    rid: Option<u64>,
    redelivered: bool,
    delivered_logged: bool,
    held: Option<DeliveryTag>,
    txn_dequeue: Option<TxnId>,
}

impl Entry {
    fn new(mut message: Message, residency: Residency, rid: Option<u64>) -> Self {
        let size = message.size();
        if residency == Residency::Paged {
            message.body = Bytes::new();
        }
        Self {
            message,
            size,
            residency,
            rid,
            redelivered: false,
            delivered_logged: false,
            held: None,
            txn_dequeue: None,
        }
    }

    fn durably_journaled(&self) -> bool {
        self.rid.is_some() && self.message.durable
    }
}

#[derive(Debug)]
pub(crate) struct QueueState {
    entries: BTreeMap<u64, Entry>,
    flow: FlowState,
    next_position: u64,
    next_tag: u64,
    held: HashMap<DeliveryTag, u64>,
    lvq: Option<LvqIndex>,
    poisoned: Option<String>,
}

impl QueueState {
    fn new(lvq_key: Option<&str>) -> Self {
        Self {
            entries: BTreeMap::new(),
            flow: FlowState::default(),
            next_position: 1,
            next_tag: 1,
            held: HashMap::new(),
            lvq: lvq_key.map(LvqIndex::new),
            poisoned: None,
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    durable: bool,
    policy: Option<AdmissionPolicy>,
    journal: Option<Journal>,
    events: FlowEvents,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Queue {
    pub(crate) fn new(decl: &QueueDecl, journal: Option<Journal>, events: FlowEvents) -> Self {
        Self {
            name: decl.name.clone(),
            durable: decl.durable,
            policy: decl.policy,
            journal,
            events,
            state: Mutex::new(QueueState::new(decl.lvq_key.as_deref())),
            available: Condvar::new(),
        }
    }

    /// A queue whose durable state could not be loaded. Every operation on it
    /// reports `StoreCorruption`.
    pub(crate) fn poisoned(decl: &QueueDecl, detail: String, events: FlowEvents) -> Self {
        let queue = Self::new(decl, None, events);
        queue.state.lock().poisoned = Some(detail);
        queue
    }

    /// Rebuild a durable queue from the records that survived replay.
    ///
    /// Records are admitted again in log order against the policy; LVQ queues
    /// keep only the newest record per key.
    pub(crate) fn recover(
        decl: &QueueDecl,
        journal: Journal,
        records: Vec<RecoveredRecord>,
        events: FlowEvents,
    ) -> Result<Self, JournalError> {
        let queue = Self::new(decl, Some(journal), events);
        let mut records = records;
        if let Some(key) = decl.lvq_key.as_deref() {
            records = queue.collapse_lvq(key, records)?;
        }

        let mut state = queue.state.lock();
        let mut over_limit = false;
        for rec in records {
            let size = rec.message.size();
            let overflow = queue.policy.and_then(|p| p.check(state.flow, size));
            let residency = match (overflow, queue.policy.map(|p| p.mode)) {
                (Some(_), Some(PolicyMode::FlowToDisk)) => Residency::Paged,
                (Some(_), _) => {
                    over_limit = true;
                    Residency::Resident
                }
                (None, _) => Residency::Resident,
            };
            if residency == Residency::Paged {
                queue.emit(&rec.message, FlowEventKind::Paged, FlowCause::Recovery);
            } else {
                state.flow.add(size);
            }
            let key = state
                .lvq
                .as_ref()
                .and_then(|lvq| lvq.key_of(&rec.message).map(str::to_string));
            let mut entry = Entry::new(rec.message, residency, Some(rec.rid));
            entry.redelivered = rec.delivered;
            entry.delivered_logged = rec.delivered;
            state.next_position = state.next_position.max(rec.position + 1);
            state.entries.insert(rec.position, entry);
            if let (Some(lvq), Some(key)) = (state.lvq.as_mut(), key) {
                lvq.insert(&key, rec.position);
            }
        }
        if over_limit {
            warn!(
                queue = %queue.name,
                count = state.flow.count,
                size = state.flow.size,
                "recovered queue exceeds its reject-mode limits"
            );
        }
        drop(state);
        Ok(queue)
    }

    fn collapse_lvq(
        &self,
        key_property: &str,
        records: Vec<RecoveredRecord>,
    ) -> Result<Vec<RecoveredRecord>, JournalError> {
        let mut newest: HashMap<String, u64> = HashMap::new();
        for rec in &records {
            if let Some(key) = rec.message.property(key_property) {
                newest.insert(key.to_string(), rec.rid);
            }
        }
        let mut kept = Vec::with_capacity(records.len());
        for rec in records {
            let superseded = rec
                .message
                .property(key_property)
                .and_then(|key| newest.get(key))
                .is_some_and(|&rid| rid != rec.rid);
            if !superseded {
                kept.push(rec);
                continue;
            }
            if let Some(journal) = &self.journal {
                journal.append(&JournalRecord::Dequeue {
                    enq_rid: rec.rid,
                    txn: None,
                })?;
                journal.release(rec.rid);
            }
            debug!(queue = %self.name, rid = rec.rid, "dropped superseded LVQ record");
        }
        Ok(kept)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn policy(&self) -> Option<AdmissionPolicy> {
        self.policy
    }

    #[cfg(test)]
    pub(crate) fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.state.lock();
        self.check_usable(&state)?;
        let paged = state
            .entries
            .values()
            .filter(|e| e.residency == Residency::Paged)
            .count() as u64;
        Ok(QueueStats {
            depth: state.entries.len() as u64,
            paged,
            held: state.held.len() as u64,
            flow: state.flow,
        })
    }

    /// Flow state derived from the entries rather than the running counters.
    pub fn recompute_flow(&self) -> FlowState {
        let state = self.state.lock();
        let mut flow = FlowState::default();
        for entry in state.entries.values() {
            if entry.residency == Residency::Resident {
                flow.add(entry.size);
            }
        }
        flow
    }

    /// Admit a message outside any transaction.
    pub(crate) fn accept(&self, message: &Message) -> Result<AdmissionResult, StoreError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;

        let key = state
            .lvq
            .as_ref()
            .and_then(|lvq| lvq.key_of(message).map(str::to_string));
        let replaced = key
            .as_deref()
            .and_then(|k| state.lvq.as_ref().and_then(|lvq| lvq.candidate(k)));

        let mut flow = state.flow;
        let mut replaced_rid = None;
        if let Some(old) = replaced.and_then(|p| state.entries.get(&p)) {
            if old.residency == Residency::Resident {
                flow.remove(old.size);
            }
            replaced_rid = old.rid;
        }

        let residency = self.admit(flow, message.size())?;
        let position = replaced.unwrap_or(state.next_position);

        let mut rid = None;
        if let Some(journal) = &self.journal {
            let outcome = if message.durable || residency == Residency::Paged {
                journal
                    .append(&JournalRecord::Enqueue {
                        txn: None,
                        position,
                        replaces: replaced_rid,
                        message: message.clone(),
                    })
                    .map(Some)
            } else if let Some(old) = replaced_rid {
                journal
                    .append(&JournalRecord::Dequeue {
                        enq_rid: old,
                        txn: None,
                    })
                    .map(|_| None)
            } else {
                Ok(None)
            };
            rid = outcome.map_err(|err| self.fail(&mut state, err))?;
        }

        if let Some(old) = replaced {
            self.drop_entry(&mut state, old);
        } else {
            state.next_position += 1;
        }
        if residency == Residency::Resident {
            state.flow.add(message.size());
        } else {
            self.emit(message, FlowEventKind::Paged, FlowCause::Accept);
        }
        state
            .entries
            .insert(position, Entry::new(message.clone(), residency, rid));
        if let (Some(lvq), Some(key)) = (state.lvq.as_mut(), key.as_deref()) {
            lvq.insert(key, position);
        }
        if replaced.is_some() {
            self.promote(&mut state, FlowCause::Dequeue);
        }
        drop(state);
        self.available.notify_all();

        Ok(AdmissionResult {
            residency,
            replaced: replaced.is_some(),
        })
    }

    /// Provisional admission of a transactional enqueue. `provisional` is what
    /// the transaction has already provisionally added to this queue.
    pub(crate) fn check_provisional(
        &self,
        message: &Message,
        provisional: FlowState,
    ) -> Result<Residency, StoreError> {
        let state = self.state.lock();
        self.check_usable(&state)?;
        self.admit(state.flow.plus(provisional), message.size())
    }

    fn admit(&self, flow: FlowState, size: u64) -> Result<Residency, StoreError> {
        let Some(policy) = self.policy else {
            return Ok(Residency::Resident);
        };
        match policy.check(flow, size) {
            None => Ok(Residency::Resident),
            Some(_) if policy.mode == PolicyMode::FlowToDisk && self.journal.is_some() => {
                Ok(Residency::Paged)
            }
            Some(overflow) => Err(self.limit_error(overflow)),
        }
    }

    fn limit_error(&self, overflow: Overflow) -> StoreError {
        StoreError::ResourceLimitExceeded {
            queue: self.name.clone(),
            kind: overflow.kind,
            max: overflow.max,
            current: overflow.current,
        }
    }

    /// Acquire the first available record.
    pub(crate) fn fetch(&self) -> Result<Option<Delivery>, StoreError> {
        let mut state = self.state.lock();
        self.fetch_locked(&mut state)
    }

    pub(crate) fn fetch_timeout(&self, timeout: Duration) -> Result<Option<Delivery>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(delivery) = self.fetch_locked(&mut state)? {
                return Ok(Some(delivery));
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return self.fetch_locked(&mut state);
            }
        }
    }

    fn fetch_locked(&self, state: &mut QueueState) -> Result<Option<Delivery>, StoreError> {
        self.check_usable(state)?;
        let Some((position, rid, needs_marker, residency)) = state
            .entries
            .iter()
            .find(|(_, e)| e.held.is_none())
            .map(|(&p, e)| {
                (
                    p,
                    e.rid,
                    e.durably_journaled() && !e.delivered_logged,
                    e.residency,
                )
            })
        else {
            return Ok(None);
        };

        if let (Some(journal), Some(rid)) = (&self.journal, rid) {
            if needs_marker {
                if let Err(err) = journal.append(&JournalRecord::Delivered { enq_rid: rid }) {
                    return Err(self.fail(state, err));
                }
            }
        }
        let body = match residency {
            Residency::Resident => None,
            Residency::Paged => Some(self.load_body(state, rid)?),
        };

        let tag = DeliveryTag::from_raw(state.next_tag);
        state.next_tag += 1;
        state.held.insert(tag, position);
        let QueueState { entries, lvq, .. } = state;
        let Some(entry) = entries.get_mut(&position) else {
            return Ok(None);
        };
        if needs_marker {
            entry.delivered_logged = true;
        }
        entry.held = Some(tag);
        let redelivered = entry.redelivered;
        entry.redelivered = true;
        if let Some(lvq) = lvq.as_mut() {
            if let Some(key) = lvq.key_of(&entry.message).map(str::to_string) {
                lvq.remove(&key, position);
            }
        }
        let mut message = entry.message.clone();
        if let Some(body) = body {
            message.body = body;
        }
        Ok(Some(Delivery {
            queue: self.name.clone(),
            tag,
            position,
            redelivered,
            message,
        }))
    }

    /// Copies of every queued record in delivery order, without acquiring them.
    pub(crate) fn browse(&self) -> Result<Vec<BrowsedMessage>, StoreError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let snapshot: Vec<(u64, Entry)> = state
            .entries
            .iter()
            .map(|(&p, e)| (p, e.clone()))
            .collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for (position, entry) in snapshot {
            let mut message = entry.message;
            if entry.residency == Residency::Paged {
                message.body = self.load_body(&mut state, entry.rid)?;
            }
            out.push(BrowsedMessage {
                position,
                residency: entry.residency,
                redelivered: entry.redelivered,
                held: entry.held.is_some(),
                message,
            });
        }
        Ok(out)
    }

    /// Remove an acquired record for good.
    pub(crate) fn acknowledge(&self, tag: DeliveryTag) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let position = self.held_position(&state, tag)?;
        self.dequeue_logged(&mut state, position)?;
        self.drop_entry(&mut state, position);
        self.promote(&mut state, FlowCause::Dequeue);
        Ok(())
    }

    /// Hand an acquired record back to the available set.
    pub(crate) fn release(&self, tag: DeliveryTag) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let position = self.held_position(&state, tag)?;
        self.release_locked(&mut state, position)?;
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Claim an acquired record for a transactional dequeue.
    pub(crate) fn mark_txn_dequeue(&self, tag: DeliveryTag, txn: TxnId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let position = self.held_position(&state, tag)?;
        if let Some(entry) = state.entries.get_mut(&position) {
            entry.txn_dequeue = Some(txn);
        }
        Ok(())
    }

    /// Undo a transactional dequeue: the record becomes available again.
    pub(crate) fn abort_txn_dequeue(&self, tag: DeliveryTag) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let Some(&position) = state.held.get(&tag) else {
            return Ok(());
        };
        if let Some(entry) = state.entries.get_mut(&position) {
            entry.txn_dequeue = None;
        }
        self.release_locked(&mut state, position)?;
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    fn held_position(&self, state: &QueueState, tag: DeliveryTag) -> Result<u64, StoreError> {
        let position = state.held.get(&tag).copied().ok_or_else(|| {
            StoreError::NotFound(format!(
                "delivery tag {} on queue {}",
                tag.value(),
                self.name
            ))
        })?;
        if state
            .entries
            .get(&position)
            .is_some_and(|e| e.txn_dequeue.is_some())
        {
            return Err(StoreError::InvalidArgument(format!(
                "delivery tag {} on queue {} is settled by an open transaction",
                tag.value(),
                self.name
            )));
        }
        Ok(position)
    }

    fn release_locked(&self, state: &mut QueueState, position: u64) -> Result<(), StoreError> {
        let key = match (state.lvq.as_ref(), state.entries.get(&position)) {
            (Some(lvq), Some(entry)) => lvq.key_of(&entry.message).map(str::to_string),
            _ => None,
        };
        let newer = key
            .as_deref()
            .and_then(|k| state.lvq.as_ref().and_then(|lvq| lvq.candidate(k)))
            .is_some();
        if newer {
            // A newer value for the same key is waiting; the released one is stale.
            self.dequeue_logged(state, position)?;
            self.drop_entry(state, position);
            self.promote(state, FlowCause::Dequeue);
            return Ok(());
        }
        if let Some(entry) = state.entries.get_mut(&position) {
            if let Some(tag) = entry.held.take() {
                state.held.remove(&tag);
            }
            entry.redelivered = true;
        }
        if let (Some(lvq), Some(key)) = (state.lvq.as_mut(), key.as_deref()) {
            lvq.insert(key, position);
        }
        Ok(())
    }

    /// Journal a non-transactional dequeue of the entry at `position`.
    fn dequeue_logged(&self, state: &mut QueueState, position: u64) -> Result<(), StoreError> {
        let rid = match state.entries.get(&position) {
            Some(entry) if entry.durably_journaled() => entry.rid,
            _ => None,
        };
        if let (Some(journal), Some(rid)) = (&self.journal, rid) {
            if let Err(err) = journal.append(&JournalRecord::Dequeue {
                enq_rid: rid,
                txn: None,
            }) {
                return Err(self.fail(state, err));
            }
        }
        Ok(())
    }

    /// Take an entry out of the in-memory structures. Journal records must
    /// already reflect the removal.
    fn drop_entry(&self, state: &mut QueueState, position: u64) -> Option<Entry> {
        let entry = state.entries.remove(&position)?;
        if entry.residency == Residency::Resident {
            state.flow.remove(entry.size);
        }
        if let Some(tag) = entry.held {
            state.held.remove(&tag);
        }
        if let Some(lvq) = state.lvq.as_mut() {
            if let Some(key) = lvq.key_of(&entry.message).map(str::to_string) {
                lvq.remove(&key, position);
            }
        }
        if let (Some(journal), Some(rid)) = (&self.journal, entry.rid) {
            journal.release(rid);
        }
        Some(entry)
    }

    /// Promote the oldest paged records for as long as they fit.
    fn promote(&self, state: &mut QueueState, cause: FlowCause) {
        let (Some(policy), Some(journal)) = (self.policy, &self.journal) else {
            return;
        };
        loop {
            let Some((position, size, rid)) = state
                .entries
                .iter()
                .find(|(_, e)| e.residency == Residency::Paged)
                .map(|(&p, e)| (p, e.size, e.rid))
            else {
                return;
            };
            if policy.check(state.flow, size).is_some() {
                return;
            }
            let Some(rid) = rid else {
                self.poison(state, format!("paged record at position {position} has no journal record"));
                return;
            };
            let message = match journal.read_message(rid) {
                Ok(message) => message,
                Err(err) => {
                    self.fail(state, err);
                    return;
                }
            };
            state.flow.add(size);
            let Some(entry) = state.entries.get_mut(&position) else {
                return;
            };
            entry.residency = Residency::Resident;
            entry.message.body = message.body;
            if !entry.message.durable {
                journal.release(rid);
                entry.rid = None;
            }
            let event_message = entry.message.clone();
            self.emit(&event_message, FlowEventKind::Released, cause);
        }
    }

    fn load_body(&self, state: &mut QueueState, rid: Option<u64>) -> Result<Bytes, StoreError> {
        let (Some(journal), Some(rid)) = (&self.journal, rid) else {
            let detail = "paged record has no journal record".to_string();
            self.poison(state, detail.clone());
            return Err(StoreError::corruption(&self.name, detail));
        };
        journal
            .read_message(rid)
            .map(|m| m.body)
            .map_err(|err| self.fail(state, err))
    }

    // ── transactional commit ──────────────────────────────────────────────

    /// Decide, against the committed state, what a transaction does to this
    /// queue. Nothing is changed yet.
    pub(crate) fn plan_commit(
        &self,
        state: &QueueState,
        dequeues: &[DeliveryTag],
        enqueues: &[&Message],
    ) -> Result<CommitPlan, StoreError> {
        self.check_usable(state)?;
        let mut flow = state.flow;
        let mut removals = Vec::with_capacity(dequeues.len());
        let mut removed: HashSet<u64> = HashSet::new();
        for &tag in dequeues {
            let position = state.held.get(&tag).copied().ok_or_else(|| {
                StoreError::NotFound(format!(
                    "delivery tag {} on queue {}",
                    tag.value(),
                    self.name
                ))
            })?;
            if let Some(entry) = state.entries.get(&position) {
                if entry.residency == Residency::Resident {
                    flow.remove(entry.size);
                }
                removed.insert(position);
                removals.push(PlannedRemoval {
                    position,
                    rid: entry.rid.filter(|_| entry.message.durable),
                });
            }
        }

        let mut next_position = state.next_position;
        let mut inserts: Vec<PlannedInsert> = Vec::with_capacity(enqueues.len());
        for message in enqueues {
            let key = state
                .lvq
                .as_ref()
                .and_then(|lvq| lvq.key_of(message).map(str::to_string));
            let mut position = None;
            let mut replaces = None;
            let mut replaced_rid = None;

            if let Some(key) = key.as_deref() {
                let earlier = inserts
                    .iter_mut()
                    .rev()
                    .find(|i| !i.superseded && i.lvq_key.as_deref() == Some(key));
                if let Some(earlier) = earlier {
                    earlier.superseded = true;
                    if earlier.residency == Residency::Resident {
                        flow.remove(earlier.message.size());
                    }
                    position = Some(earlier.position);
                    replaces = earlier.replaces;
                    replaced_rid = earlier.replaced_rid;
                } else if let Some(existing) = state
                    .lvq
                    .as_ref()
                    .and_then(|lvq| lvq.candidate(key))
                    .filter(|p| !removed.contains(p))
                {
                    if let Some(entry) = state.entries.get(&existing) {
                        if entry.residency == Residency::Resident {
                            flow.remove(entry.size);
                        }
                        replaced_rid = entry.rid;
                    }
                    position = Some(existing);
                    replaces = Some(existing);
                }
            }

            let residency = self.admit(flow, message.size())?;
            if residency == Residency::Resident {
                flow.add(message.size());
            }
            let position = match position {
                Some(p) => p,
                None => {
                    let p = next_position;
                    next_position += 1;
                    p
                }
            };
            inserts.push(PlannedInsert {
                position,
                message: (*message).clone(),
                residency,
                replaces,
                replaced_rid,
                lvq_key: key,
                superseded: false,
                rid: None,
            });
        }

        Ok(CommitPlan {
            removals,
            inserts,
            next_position,
            appended: Vec::new(),
            journaled: false,
        })
    }

    /// Write the transactional records of `plan` to this queue's journal.
    pub(crate) fn journal_commit(
        &self,
        plan: &mut CommitPlan,
        txn: TxnId,
    ) -> Result<(), JournalError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        for removal in &plan.removals {
            if let Some(rid) = removal.rid {
                journal.append(&JournalRecord::Dequeue {
                    enq_rid: rid,
                    txn: Some(txn),
                })?;
                plan.journaled = true;
            }
        }
        for insert in plan.inserts.iter_mut().filter(|i| !i.superseded) {
            if insert.message.durable || insert.residency == Residency::Paged {
                let rid = journal.append(&JournalRecord::Enqueue {
                    txn: Some(txn),
                    position: insert.position,
                    replaces: insert.replaced_rid,
                    message: insert.message.clone(),
                })?;
                insert.rid = Some(rid);
                plan.appended.push(rid);
                plan.journaled = true;
            } else if let Some(old) = insert.replaced_rid {
                journal.append(&JournalRecord::Dequeue {
                    enq_rid: old,
                    txn: Some(txn),
                })?;
                plan.journaled = true;
            }
        }
        Ok(())
    }

    /// Append a commit or abort marker if this plan wrote anything.
    ///
    /// Once the marker is in the journal the outcome is decided: a failing
    /// flush afterwards is only logged, and the next flush retries the sync.
    pub(crate) fn journal_outcome(
        &self,
        plan: &CommitPlan,
        record: &JournalRecord,
    ) -> Result<(), JournalError> {
        match &self.journal {
            Some(journal) if plan.journaled => {
                journal.append(record)?;
                if let Err(err) = journal.flush() {
                    warn!(
                        queue = %self.name,
                        ?record,
                        error = %err,
                        "marker written but not yet synced"
                    );
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Roll back the journal side of an abandoned plan.
    pub(crate) fn discard_plan(&self, plan: &CommitPlan, txn: TxnId) {
        let Some(journal) = &self.journal else {
            return;
        };
        for &rid in &plan.appended {
            journal.release(rid);
        }
        if plan.journaled {
            if let Err(err) = journal
                .append(&JournalRecord::Abort { txn })
                .and_then(|_| journal.flush())
            {
                warn!(queue = %self.name, %txn, error = %err, "failed to write abort marker");
            }
        }
    }

    /// Make a committed plan visible.
    pub(crate) fn apply_commit(&self, state: &mut QueueState, plan: CommitPlan, txn: TxnId) {
        for removal in &plan.removals {
            self.drop_entry(state, removal.position);
        }
        for insert in plan.inserts.into_iter().filter(|i| !i.superseded) {
            if let Some(old) = insert.replaces {
                self.drop_entry(state, old);
            }
            if insert.residency == Residency::Resident {
                state.flow.add(insert.message.size());
            } else {
                self.emit(&insert.message, FlowEventKind::Paged, FlowCause::Commit(txn));
            }
            state.entries.insert(
                insert.position,
                Entry::new(insert.message, insert.residency, insert.rid),
            );
            if let (Some(lvq), Some(key)) = (state.lvq.as_mut(), insert.lvq_key.as_deref()) {
                lvq.insert(key, insert.position);
            }
        }
        state.next_position = state.next_position.max(plan.next_position);
        self.promote(state, FlowCause::Commit(txn));
    }

    pub(crate) fn notify(&self) {
        self.available.notify_all();
    }

    /// Flush the journal if this queue has one.
    pub(crate) fn flush(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let mut state = self.state.lock();
        journal.flush().map_err(|err| self.fail(&mut state, err))
    }

    /// Shut the queue down after deletion and remove its journal.
    pub(crate) fn destroy(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.held.clear();
        state.flow = FlowState::default();
        if let Some(lvq) = state.lvq.as_mut() {
            lvq.clear();
        }
        state.poisoned = Some("queue deleted".to_string());
        let result = match &self.journal {
            Some(journal) => journal
                .destroy()
                .map_err(|err| StoreError::from_journal(&self.name, err)),
            None => Ok(()),
        };
        drop(state);
        self.available.notify_all();
        result
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    fn check_usable(&self, state: &QueueState) -> Result<(), StoreError> {
        match &state.poisoned {
            Some(detail) => Err(StoreError::corruption(&self.name, detail)),
            None => Ok(()),
        }
    }

    fn fail(&self, state: &mut QueueState, err: JournalError) -> StoreError {
        let err = StoreError::from_journal(&self.name, err);
        if let StoreError::StoreCorruption { detail, .. } = &err {
            self.poison(state, detail.clone());
        }
        err
    }

    fn poison(&self, state: &mut QueueState, detail: String) {
        error!(queue = %self.name, %detail, "queue can no longer be served");
        state.poisoned = Some(detail);
    }

    fn emit(&self, message: &Message, kind: FlowEventKind, cause: FlowCause) {
        self.events.emit(FlowEvent {
            queue: self.name.clone(),
            message_id: message.id,
            correlation_id: message.correlation_id.clone(),
            kind,
            cause,
        });
    }
}

#[derive(Debug)]
struct PlannedRemoval {
    position: u64,
    /// Durable journal record to dequeue.
    rid: Option<u64>,
}

#[derive(Debug)]
struct PlannedInsert {
    position: u64,
    message: Message,
    residency: Residency,
    /// Position of an existing entry this insert replaces.
    replaces: Option<u64>,
    replaced_rid: Option<u64>,
    lvq_key: Option<String>,
    /// Replaced by a later enqueue of the same transaction.
    superseded: bool,
    rid: Option<u64>,
}

/// What committing one transaction does to one queue.
#[derive(Debug)]
pub(crate) struct CommitPlan {
    removals: Vec<PlannedRemoval>,
    inserts: Vec<PlannedInsert>,
    next_position: u64,
    appended: Vec<u64>,
    journaled: bool,
}

impl CommitPlan {
    pub(crate) fn is_journaled(&self) -> bool {
        self.journaled
    }
}
