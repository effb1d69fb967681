//! Transaction contexts.
//!
//! A transaction buffers its enqueues and dequeues in memory; nothing reaches a
//! queue or a journal until commit. Commit itself is orchestrated by
//! [`Store::commit`](crate::core::store::Store::commit).

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::core::codec::{self, CodecError};
use crate::core::message::{DeliveryTag, Message, Residency};
use crate::core::queue::flow::FlowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(Uuid);

impl TxnId {
    pub fn new() -> Self {
        TxnId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        TxnId(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingEnqueue {
    pub queue: String,
    pub message: Message,
    /// Provisional decision taken at accept time.
    pub residency: Residency,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingDequeue {
    pub queue: String,
    pub tag: DeliveryTag,
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub id: TxnId,
    pub state: TxnState,
    pub enqueues: Vec<PendingEnqueue>,
    pub dequeues: Vec<PendingDequeue>,
    /// Resident count/size this transaction would add, per queue.
    pub provisional: HashMap<String, FlowState>,
    /// Set when an effect was refused; commit will abort instead.
    pub rollback_only: Option<String>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TxnState::Open,
            enqueues: Vec::new(),
            dequeues: Vec::new(),
            provisional: HashMap::new(),
            rollback_only: None,
        }
    }

    pub(crate) fn provisional_for(&self, queue: &str) -> FlowState {
        self.provisional.get(queue).copied().unwrap_or_default()
    }

    pub(crate) fn record_enqueue(&mut self, queue: &str, message: Message, residency: Residency) {
        if residency == Residency::Resident {
            self.provisional
                .entry(queue.to_string())
                .or_default()
                .add(message.size());
        }
        self.enqueues.push(PendingEnqueue {
            queue: queue.to_string(),
            message,
            residency,
        });
    }

    pub(crate) fn record_dequeue(&mut self, queue: &str, tag: DeliveryTag) {
        self.dequeues.push(PendingDequeue {
            queue: queue.to_string(),
            tag,
        });
    }

    pub(crate) fn mark_rollback_only(&mut self, reason: impl Into<String>) {
        if self.rollback_only.is_none() {
            self.rollback_only = Some(reason.into());
        }
    }

    /// Every queue touched by this transaction, in lock order.
    pub(crate) fn queues(&self) -> BTreeSet<String> {
        self.enqueues
            .iter()
            .map(|e| e.queue.clone())
            .chain(self.dequeues.iter().map(|d| d.queue.clone()))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.enqueues.is_empty() && self.dequeues.is_empty()
    }
}

/// Commit decision of a transaction spanning several journals, written to the
/// store-wide transaction log before any journal sees a commit marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxnDecision {
    pub txn: TxnId,
    pub queues: Vec<String>,
}

impl TxnDecision {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::new();
        codec::put_uuid(&mut buf, self.txn.as_uuid());
        let count = u16::try_from(self.queues.len())
            .map_err(|_| CodecError(format!("{} queues in one decision", self.queues.len())))?;
        buf.put_u16(count);
        for queue in &self.queues {
            codec::put_str(&mut buf, queue)?;
        }
        Ok(buf.to_vec())
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut slice = bytes;
        let txn = TxnId::from_uuid(codec::get_uuid(&mut slice)?);
        let count = codec::get_u16(&mut slice)?;
        let mut queues = Vec::with_capacity(count as usize);
        for _ in 0..count {
            queues.push(codec::get_str(&mut slice)?);
        }
        Ok(Self { txn, queues })
    }
}
