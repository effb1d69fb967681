//! The store facade: catalog, queues, transactions and recovery behind one
//! synchronous API.
//!
//! On-disk layout under the store directory:
//!
//! ```text
//! catalog.wal              durable exchanges and queues
//! txn.wal                  commit decisions of multi-journal transactions
//! journal/<queue>/         one journal ring per durable queue
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::catalog::{
    Catalog, Declared, EntityRef, ExchangeDecl, ExchangeInfo, QueueDecl, QueueInfo,
};
use crate::core::error::StoreError;
use crate::core::events::{FlowCause, FlowEvent, FlowEventKind, FlowEvents};
use crate::core::journal::{Journal, JournalGeometry, JournalRecord};
use crate::core::message::{
    AdmissionResult, BrowsedMessage, DeadLetter, Delivery, DeliveryTag, Disposition, Message,
    Residency,
};
use crate::core::queue::{CommitPlan, Queue};
use crate::core::recovery::{self, RecoveryReport, RecoveryState};
use crate::core::txn::{Transaction, TxnDecision, TxnId, TxnState};
use crate::core::wal::{WalConfig, WalError, WriteAheadLog};

pub(crate) const TXN_LOG_FILE: &str = "txn.wal";
pub(crate) const JOURNAL_DIR: &str = "journal";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dir: PathBuf,
    /// Flush policy of journals and logs. Commits and catalog changes always flush.
    pub wal: WalConfig,
    /// Geometry of new durable queues that do not specify one.
    pub default_journal: JournalGeometry,
}

impl StoreOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            wal: WalConfig::default(),
            default_journal: JournalGeometry::default(),
        }
    }

    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    pub fn with_default_journal(mut self, geometry: JournalGeometry) -> Self {
        self.default_journal = geometry;
        self
    }
}

/// Directory holding the journal of `queue` in the store at `store_dir`.
pub fn journal_path(store_dir: &Path, queue: &str) -> PathBuf {
    store_dir.join(JOURNAL_DIR).join(encode_queue_name(queue))
}

/// File-system safe form of a queue name. Alphanumerics, `-`, `_` and `.` are
/// kept (a leading `.` is escaped); every other byte becomes `%XX`.
fn encode_queue_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[derive(Debug)]
pub struct Store {
    options: StoreOptions,
    catalog: Catalog,
    queues: DashMap<String, Arc<Queue>>,
    txns: DashMap<TxnId, Transaction>,
    txn_log: OnceLock<WriteAheadLog>,
    events: FlowEvents,
    state: RwLock<RecoveryState>,
    /// Serialises declare and delete so catalog and registry stay in step.
    admin: Mutex<()>,
    /// Held shared by commits writing a decision, exclusively by a log reset.
    txn_gate: RwLock<()>,
    decisions: AtomicU64,
    /// A decision whose journal markers could not all be written.
    txn_log_pinned: AtomicBool,
}

impl Store {
    /// A store in the `Stopped` state. Call [`Store::recover`] before use.
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            catalog: Catalog::new(),
            queues: DashMap::new(),
            txns: DashMap::new(),
            txn_log: OnceLock::new(),
            events: FlowEvents::default(),
            state: RwLock::new(RecoveryState::Stopped),
            admin: Mutex::new(()),
            txn_gate: RwLock::new(()),
            decisions: AtomicU64::new(0),
            txn_log_pinned: AtomicBool::new(false),
        }
    }

    /// Create a store and recover it.
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let store = Self::new(options);
        store.recover()?;
        Ok(store)
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.read()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    pub fn subscribe_flow_events(&self) -> flume::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Replay everything on disk: `Stopped -> Replaying -> Ready`.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        {
            let mut state = self.state.write();
            if *state != RecoveryState::Stopped {
                return Err(StoreError::NotReady(*state));
            }
            *state = RecoveryState::Replaying;
        }
        match self.replay_all() {
            Ok(report) => {
                *self.state.write() = RecoveryState::Ready;
                info!(
                    dir = %self.options.dir.display(),
                    queues = report.queues,
                    records = report.records,
                    rolled_forward = report.rolled_forward,
                    rolled_back = report.rolled_back,
                    poisoned = report.poisoned.len(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "store ready"
                );
                Ok(report)
            }
            Err(err) => {
                *self.state.write() = RecoveryState::Stopped;
                Err(err)
            }
        }
    }

    fn replay_all(&self) -> Result<RecoveryReport, StoreError> {
        let started = Instant::now();
        let dir = &self.options.dir;
        std::fs::create_dir_all(dir.join(JOURNAL_DIR))?;

        self.catalog.recover(dir, self.options.wal.clone())?;

        let (txn_log, decisions) =
            WriteAheadLog::open(dir.join(TXN_LOG_FILE), self.options.wal.clone())
                .map_err(txn_log_error)?;
        let committed = recovery::committed_transactions(&decisions)
            .map_err(|detail| StoreError::corruption("transaction log", detail))?;

        let mut report = RecoveryReport {
            exchanges: self.catalog.exchanges().len(),
            ..RecoveryReport::default()
        };
        let mut claimed = HashSet::new();
        for decl in self.catalog.queues() {
            let journal_dir = journal_path(dir, &decl.name);
            let recovered = recovery::recover_queue(
                &decl,
                &journal_dir,
                self.options.wal.clone(),
                &committed,
                self.events.clone(),
            );
            claimed.insert(journal_dir);
            report.queues += 1;
            report.records += recovered.records;
            report.rolled_forward += recovered.rolled_forward;
            report.rolled_back += recovered.rolled_back;
            if recovered.poisoned {
                report.poisoned.push(decl.name.clone());
            }
            self.queues
                .insert(decl.name.clone(), Arc::new(recovered.queue));
        }
        report.orphans = recovery::orphan_journals(&dir.join(JOURNAL_DIR), &claimed);

        // A queue that failed to replay may still hold markers these decisions
        // resolve, so they stay until a clean recovery.
        if report.poisoned.is_empty() {
            txn_log.reset().map_err(txn_log_error)?;
        } else {
            warn!(
                poisoned = ?report.poisoned,
                decisions = decisions.len(),
                "keeping transaction log for queues that failed to recover"
            );
            self.txn_log_pinned.store(true, Ordering::Relaxed);
        }
        self.txn_log
            .set(txn_log)
            .map_err(|_| StoreError::Internal("transaction log opened twice".to_string()))?;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        match *self.state.read() {
            RecoveryState::Ready => Ok(()),
            other => Err(StoreError::NotReady(other)),
        }
    }

    /// Live handle of a queue.
    pub fn queue(&self, name: &str) -> Result<Arc<Queue>, StoreError> {
        self.queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| StoreError::NotFound(format!("queue {name}")))
    }

    // ── entity catalog ────────────────────────────────────────────────────

    pub fn declare_exchange(&self, decl: ExchangeDecl) -> Result<ExchangeInfo, StoreError> {
        self.ensure_ready()?;
        let _admin = self.admin.lock();
        match self.catalog.declare_exchange(decl)? {
            Declared::Created(info) | Declared::Existing(info) => Ok(info),
        }
    }

    pub fn declare_queue(&self, decl: QueueDecl) -> Result<QueueInfo, StoreError> {
        self.ensure_ready()?;
        let _admin = self.admin.lock();
        let name = decl.name.clone();
        let decl = match self
            .catalog
            .declare_queue(decl, self.options.default_journal)?
        {
            Declared::Existing(decl) => return self.queue_info(decl),
            Declared::Created(decl) => decl,
        };

        let journal = match decl.journal.filter(|_| decl.durable) {
            Some(geometry) => {
                let dir = journal_path(&self.options.dir, &name);
                match Journal::create(&dir, &name, geometry, self.options.wal.clone()) {
                    Ok(journal) => Some(journal),
                    Err(err) => {
                        if let Err(undo) = self.catalog.delete_queue(&name) {
                            warn!(queue = %name, error = %undo, "failed to undo queue declaration");
                        }
                        return Err(StoreError::from_journal(&name, err));
                    }
                }
            }
            None => None,
        };
        let queue = Arc::new(Queue::new(&decl, journal, self.events.clone()));
        self.queues.insert(name.clone(), queue);
        info!(queue = %name, durable = decl.durable, policy = ?decl.policy, "queue declared");
        self.queue_info(decl)
    }

    pub fn delete_exchange(&self, name: &str) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let _admin = self.admin.lock();
        self.catalog.delete_exchange(name)?;
        info!(exchange = %name, "exchange deleted");
        Ok(())
    }

    pub fn delete_queue(&self, name: &str) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let _admin = self.admin.lock();
        self.catalog.delete_queue(name)?;
        if let Some((_, queue)) = self.queues.remove(name) {
            queue.destroy()?;
        }
        info!(queue = %name, "queue deleted");
        Ok(())
    }

    pub fn lookup_exchange(&self, name: &str) -> Result<ExchangeInfo, StoreError> {
        self.ensure_ready()?;
        self.catalog
            .exchange(name)
            .ok_or_else(|| StoreError::NotFound(format!("exchange {name}")))
    }

    pub fn lookup_queue(&self, name: &str) -> Result<QueueDecl, StoreError> {
        self.ensure_ready()?;
        self.catalog
            .queue(name)
            .ok_or_else(|| StoreError::NotFound(format!("queue {name}")))
    }

    pub fn set_alternate_exchange(
        &self,
        entity: &EntityRef,
        alternate: Option<String>,
    ) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let _admin = self.admin.lock();
        self.catalog.set_alternate(entity, alternate)
    }

    pub fn query_exchange(&self, name: &str) -> Result<ExchangeInfo, StoreError> {
        self.lookup_exchange(name)
    }

    pub fn query_queue(&self, name: &str) -> Result<QueueInfo, StoreError> {
        let decl = self.lookup_queue(name)?;
        self.queue_info(decl)
    }

    pub fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>, StoreError> {
        self.ensure_ready()?;
        Ok(self.catalog.exchanges())
    }

    pub fn list_queues(&self) -> Result<Vec<QueueDecl>, StoreError> {
        self.ensure_ready()?;
        Ok(self.catalog.queues())
    }

    fn queue_info(&self, decl: QueueDecl) -> Result<QueueInfo, StoreError> {
        let stats = self.queue(&decl.name)?.stats()?;
        Ok(QueueInfo {
            decl,
            depth: stats.depth,
            paged: stats.paged,
            held: stats.held,
            flow: stats.flow,
        })
    }

    // ── admission and delivery ────────────────────────────────────────────

    /// Admit `message` to `queue`, immediately or as part of `txn`.
    pub fn accept(
        &self,
        queue: &str,
        message: &Message,
        txn: Option<TxnId>,
    ) -> Result<AdmissionResult, StoreError> {
        self.ensure_ready()?;
        let q = self.queue(queue)?;
        let Some(id) = txn else {
            return q.accept(message);
        };
        let mut tx = self.open_txn(id)?;
        match q.check_provisional(message, tx.provisional_for(queue)) {
            Ok(residency) => {
                tx.record_enqueue(queue, message.clone(), residency);
                Ok(AdmissionResult {
                    residency,
                    replaced: false,
                })
            }
            Err(err) => {
                debug!(queue, txn = %id, error = %err, "transactional accept refused");
                tx.mark_rollback_only(err.to_string());
                Err(err)
            }
        }
    }

    /// Fan a message out to several queues; each decides on its own.
    pub fn accept_all(
        &self,
        queues: &[&str],
        message: &Message,
        txn: Option<TxnId>,
    ) -> Vec<Result<AdmissionResult, StoreError>> {
        queues
            .iter()
            .map(|queue| self.accept(queue, message, txn))
            .collect()
    }

    pub fn fetch(&self, queue: &str) -> Result<Option<Delivery>, StoreError> {
        self.ensure_ready()?;
        self.queue(queue)?.fetch()
    }

    /// Like [`Store::fetch`], waiting up to `timeout` for a record.
    pub fn fetch_timeout(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError> {
        self.ensure_ready()?;
        self.queue(queue)?.fetch_timeout(timeout)
    }

    pub fn browse(&self, queue: &str) -> Result<Vec<BrowsedMessage>, StoreError> {
        self.ensure_ready()?;
        self.queue(queue)?.browse()
    }

    /// Settle a delivery. A rejected delivery on a queue with an alternate
    /// exchange yields a dead letter for the routing layer to publish; under a
    /// transaction it should be published in that same transaction.
    pub fn acknowledge(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
        txn: Option<TxnId>,
    ) -> Result<Option<DeadLetter>, StoreError> {
        self.ensure_ready()?;
        let q = self.queue(&delivery.queue)?;
        match txn {
            None => q.acknowledge(delivery.tag)?,
            Some(id) => {
                let mut tx = self.open_txn(id)?;
                q.mark_txn_dequeue(delivery.tag, id)?;
                tx.record_dequeue(&delivery.queue, delivery.tag);
            }
        }
        if disposition == Disposition::Accepted {
            return Ok(None);
        }
        let alternate = self
            .catalog
            .queue(&delivery.queue)
            .and_then(|decl| decl.alternate_exchange);
        Ok(alternate.map(|exchange| DeadLetter {
            exchange,
            message: delivery.message.clone(),
        }))
    }

    pub fn release(&self, delivery: &Delivery) -> Result<(), StoreError> {
        self.ensure_ready()?;
        self.queue(&delivery.queue)?.release(delivery.tag)
    }

    // ── transactions ──────────────────────────────────────────────────────

    pub fn begin(&self) -> Result<TxnId, StoreError> {
        self.ensure_ready()?;
        let id = TxnId::new();
        self.txns.insert(id, Transaction::new(id));
        debug!(txn = %id, "transaction started");
        Ok(id)
    }

    fn open_txn(
        &self,
        id: TxnId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, TxnId, Transaction>, StoreError> {
        self.txns
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))
    }

    pub fn abort(&self, txn: TxnId) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let (_, mut tx) = self
            .txns
            .remove(&txn)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {txn}")))?;
        self.discard(&mut tx);
        debug!(%txn, "transaction aborted");
        Ok(())
    }

    /// Make every effect of `txn` durable and visible, or none of them.
    pub fn commit(&self, txn: TxnId) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let (_, mut tx) = self
            .txns
            .remove(&txn)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {txn}")))?;
        if let Some(reason) = tx.rollback_only.clone() {
            self.discard(&mut tx);
            return Err(StoreError::commit_failed(reason));
        }
        if tx.is_empty() {
            tx.state = TxnState::Committed;
            return Ok(());
        }

        let mut queues = Vec::new();
        for name in tx.queues() {
            match self.queues.get(&name) {
                Some(q) => queues.push(Arc::clone(q.value())),
                None => warn!(queue = %name, %txn, "dropping effects on deleted queue"),
            }
        }
        let mut guards: Vec<_> = queues.iter().map(|q| q.lock()).collect();

        let mut plans: Vec<CommitPlan> = Vec::with_capacity(queues.len());
        let mut refused = None;
        for (q, guard) in queues.iter().zip(guards.iter()) {
            let dequeues: Vec<DeliveryTag> = tx
                .dequeues
                .iter()
                .filter(|d| d.queue == q.name())
                .map(|d| d.tag)
                .collect();
            let enqueues: Vec<&Message> = tx
                .enqueues
                .iter()
                .filter(|e| e.queue == q.name())
                .map(|e| &e.message)
                .collect();
            match q.plan_commit(guard, &dequeues, &enqueues) {
                Ok(plan) => plans.push(plan),
                Err(err) => {
                    refused = Some((q.name().to_string(), err));
                    break;
                }
            }
        }
        if let Some((queue, err)) = refused {
            drop(guards);
            self.discard(&mut tx);
            warn!(%txn, %queue, error = %err, "commit refused");
            return Err(StoreError::commit_failed(err));
        }

        let gate = self.txn_gate.read();
        if let Err(err) = self.write_commit(&queues, &mut plans, txn) {
            for (q, plan) in queues.iter().zip(&plans) {
                q.discard_plan(plan, txn);
            }
            drop(gate);
            drop(guards);
            self.discard(&mut tx);
            warn!(%txn, error = %err, "commit rolled back");
            return Err(StoreError::commit_failed(err));
        }
        drop(gate);

        for ((q, plan), guard) in queues.iter().zip(plans).zip(guards.iter_mut()) {
            q.apply_commit(guard, plan, txn);
        }
        drop(guards);
        for q in &queues {
            q.notify();
        }
        tx.state = TxnState::Committed;
        debug!(%txn, queues = queues.len(), "transaction committed");
        Ok(())
    }

    /// Journal phase of a commit. Returns an error only if nothing has been
    /// decided yet; after the decision point failures are logged.
    fn write_commit(
        &self,
        queues: &[Arc<Queue>],
        plans: &mut [CommitPlan],
        txn: TxnId,
    ) -> Result<(), StoreError> {
        for (q, plan) in queues.iter().zip(plans.iter_mut()) {
            q.journal_commit(plan, txn)
                .map_err(|e| StoreError::from_journal(q.name(), e))?;
        }
        let journaled: Vec<String> = queues
            .iter()
            .zip(plans.iter())
            .filter(|(_, plan)| plan.is_journaled())
            .map(|(q, _)| q.name().to_string())
            .collect();
        let marker = JournalRecord::Commit { txn };

        if journaled.len() <= 1 {
            // The single commit marker is the decision.
            for (q, plan) in queues.iter().zip(plans.iter()) {
                q.journal_outcome(plan, &marker)
                    .map_err(|e| StoreError::from_journal(q.name(), e))?;
            }
            return Ok(());
        }

        let log = self
            .txn_log
            .get()
            .ok_or_else(|| StoreError::Internal("transaction log not open".to_string()))?;
        let decision = TxnDecision {
            txn,
            queues: journaled,
        };
        let payload = decision
            .encode()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        log.append(&payload).map_err(txn_log_error)?;
        log.flush().map_err(txn_log_error)?;
        self.decisions.fetch_add(1, Ordering::Relaxed);

        for (q, plan) in queues.iter().zip(plans.iter()) {
            if let Err(err) = q.journal_outcome(plan, &marker) {
                // Recovery rolls this queue forward from the decision log.
                warn!(queue = q.name(), %txn, error = %err, "commit marker not written");
                self.txn_log_pinned.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Undo the visible side effects of an uncommitted transaction.
    fn discard(&self, tx: &mut Transaction) {
        for pending in &tx.enqueues {
            if pending.residency == Residency::Paged {
                self.events.emit(FlowEvent {
                    queue: pending.queue.clone(),
                    message_id: pending.message.id,
                    correlation_id: pending.message.correlation_id.clone(),
                    kind: FlowEventKind::Blocked,
                    cause: FlowCause::Abort(tx.id),
                });
            }
        }
        for pending in &tx.dequeues {
            let Some(q) = self.queues.get(&pending.queue).map(|q| Arc::clone(q.value())) else {
                continue;
            };
            if let Err(err) = q.abort_txn_dequeue(pending.tag) {
                warn!(queue = %pending.queue, txn = %tx.id, error = %err, "could not return record");
            }
        }
        tx.state = TxnState::Aborted;
    }

    // ── maintenance ───────────────────────────────────────────────────────

    /// Flush every journal, and truncate the decision log once no decision in
    /// it is still needed.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| Arc::clone(q.value())).collect();
        let mut first_err = None;
        for q in queues.iter().filter(|q| q.is_durable() && !q.is_poisoned()) {
            if let Err(err) = q.flush() {
                warn!(queue = q.name(), error = %err, "journal flush failed");
                first_err.get_or_insert(err);
            }
        }
        if let Some(_gate) = self.txn_gate.try_write() {
            let pinned = self.txn_log_pinned.load(Ordering::Relaxed);
            if !pinned && self.decisions.swap(0, Ordering::Relaxed) > 0 {
                if let Some(log) = self.txn_log.get() {
                    log.reset().map_err(txn_log_error)?;
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn txn_log_error(err: WalError) -> StoreError {
    match err {
        WalError::Io(io) => StoreError::Io(io),
        other => StoreError::corruption("transaction log", other),
    }
}
