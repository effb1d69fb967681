//! Client-side convenience over a shared [`Store`].
//!
//! A session tracks the deliveries it has fetched but not settled and, when
//! transactional, keeps one transaction open at all times: `commit` and
//! `rollback` finish the current one and begin the next. Closing a session aborts
//! its transaction and releases its outstanding deliveries; dropping it without
//! `close` leaves both behind, which is how a crashed client looks to the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::error::StoreError;
use crate::core::message::{AdmissionResult, DeadLetter, Delivery, Disposition, Message};
use crate::core::store::Store;
use crate::core::txn::TxnId;

#[derive(Debug)]
pub struct Session {
    store: Arc<Store>,
    txn: Option<TxnId>,
    outstanding: BTreeMap<(String, u64), Delivery>,
}

impl Session {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            txn: None,
            outstanding: BTreeMap::new(),
        }
    }

    pub fn transactional(store: Arc<Store>) -> Result<Self, StoreError> {
        let txn = store.begin()?;
        Ok(Self {
            store,
            txn: Some(txn),
            outstanding: BTreeMap::new(),
        })
    }

    pub fn txn(&self) -> Option<TxnId> {
        self.txn
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn publish(&self, queue: &str, message: &Message) -> Result<AdmissionResult, StoreError> {
        self.store.accept(queue, message, self.txn)
    }

    pub fn publish_all(
        &self,
        queues: &[&str],
        message: &Message,
    ) -> Vec<Result<AdmissionResult, StoreError>> {
        self.store.accept_all(queues, message, self.txn)
    }

    pub fn fetch(&mut self, queue: &str) -> Result<Option<Delivery>, StoreError> {
        let delivery = self.store.fetch(queue)?;
        Ok(delivery.inspect(|d| self.track(d)))
    }

    pub fn fetch_timeout(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError> {
        let delivery = self.store.fetch_timeout(queue, timeout)?;
        Ok(delivery.inspect(|d| self.track(d)))
    }

    pub fn acknowledge(
        &mut self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<Option<DeadLetter>, StoreError> {
        let dead_letter = self.store.acknowledge(delivery, disposition, self.txn)?;
        self.outstanding.remove(&key(delivery));
        Ok(dead_letter)
    }

    pub fn release(&mut self, delivery: &Delivery) -> Result<(), StoreError> {
        self.store.release(delivery)?;
        self.outstanding.remove(&key(delivery));
        Ok(())
    }

    /// Commit the current transaction and open the next one.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        let txn = self.current_txn()?;
        let result = self.store.commit(txn);
        self.txn = Some(self.store.begin()?);
        result
    }

    /// Abort the current transaction and open the next one.
    pub fn rollback(&mut self) -> Result<(), StoreError> {
        let txn = self.current_txn()?;
        self.store.abort(txn)?;
        self.txn = Some(self.store.begin()?);
        Ok(())
    }

    /// Abort any open transaction and hand every unsettled delivery back.
    pub fn close(mut self) -> Result<(), StoreError> {
        if let Some(txn) = self.txn.take() {
            self.store.abort(txn)?;
        }
        let outstanding = std::mem::take(&mut self.outstanding);
        let count = outstanding.len();
        for delivery in outstanding.into_values() {
            match self.store.release(&delivery) {
                // Settled by the aborted transaction already.
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => {
                    warn!(queue = %delivery.queue, tag = delivery.tag.value(), error = %err, "release on close failed")
                }
            }
        }
        debug!(released = count, "session closed");
        Ok(())
    }

    fn current_txn(&self) -> Result<TxnId, StoreError> {
        self.txn.ok_or_else(|| {
            StoreError::InvalidArgument("session is not transactional".to_string())
        })
    }

    fn track(&mut self, delivery: &Delivery) {
        self.outstanding.insert(key(delivery), delivery.clone());
    }
}

fn key(delivery: &Delivery) -> (String, u64) {
    (delivery.queue.clone(), delivery.tag.value())
}
