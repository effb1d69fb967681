use bytes::{BufMut, BytesMut};

use crate::core::codec::{self, CodecError};
use crate::core::message::Message;
use crate::core::txn::TxnId;

const TAG_ENQUEUE: u8 = 1;
const TAG_DEQUEUE: u8 = 2;
const TAG_DELIVERED: u8 = 3;
const TAG_COMMIT: u8 = 4;
const TAG_ABORT: u8 = 5;

/// Payload of one journal record. The record id lives in the frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// A message entering the queue at `position`. A non-durable message here is
    /// a transient record: it only backs a paged body and is skipped by recovery.
    Enqueue {
        txn: Option<TxnId>,
        position: u64,
        /// Record id of an LVQ record this one atomically replaces.
        replaces: Option<u64>,
        message: Message,
    },
    Dequeue {
        enq_rid: u64,
        txn: Option<TxnId>,
    },
    /// The enqueue was handed to a consumer at least once.
    Delivered { enq_rid: u64 },
    Commit { txn: TxnId },
    Abort { txn: TxnId },
}

impl JournalRecord {
    pub fn is_enqueue(&self) -> bool {
        matches!(self, JournalRecord::Enqueue { .. })
    }

    pub fn txn(&self) -> Option<TxnId> {
        match self {
            JournalRecord::Enqueue { txn, .. } | JournalRecord::Dequeue { txn, .. } => *txn,
            JournalRecord::Commit { txn } | JournalRecord::Abort { txn } => Some(*txn),
            JournalRecord::Delivered { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::new();
        match self {
            JournalRecord::Enqueue {
                txn,
                position,
                replaces,
                message,
            } => {
                buf.put_u8(TAG_ENQUEUE);
                put_txn(&mut buf, *txn);
                buf.put_u64(*position);
                codec::put_opt_u64(&mut buf, *replaces);
                message.encode_into(&mut buf)?;
            }
            JournalRecord::Dequeue { enq_rid, txn } => {
                buf.put_u8(TAG_DEQUEUE);
                put_txn(&mut buf, *txn);
                buf.put_u64(*enq_rid);
            }
            JournalRecord::Delivered { enq_rid } => {
                buf.put_u8(TAG_DELIVERED);
                buf.put_u64(*enq_rid);
            }
            JournalRecord::Commit { txn } => {
                buf.put_u8(TAG_COMMIT);
                codec::put_uuid(&mut buf, txn.as_uuid());
            }
            JournalRecord::Abort { txn } => {
                buf.put_u8(TAG_ABORT);
                codec::put_uuid(&mut buf, txn.as_uuid());
            }
        }
        Ok(buf.to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut slice = bytes;
        let tag = codec::get_u8(&mut slice)?;
        let record = match tag {
            TAG_ENQUEUE => {
                let txn = get_txn(&mut slice)?;
                let position = codec::get_u64(&mut slice)?;
                let replaces = codec::get_opt_u64(&mut slice)?;
                let message = Message::decode_from(&mut slice)?;
                JournalRecord::Enqueue {
                    txn,
                    position,
                    replaces,
                    message,
                }
            }
            TAG_DEQUEUE => {
                let txn = get_txn(&mut slice)?;
                let enq_rid = codec::get_u64(&mut slice)?;
                JournalRecord::Dequeue { enq_rid, txn }
            }
            TAG_DELIVERED => JournalRecord::Delivered {
                enq_rid: codec::get_u64(&mut slice)?,
            },
            TAG_COMMIT => JournalRecord::Commit {
                txn: TxnId::from_uuid(codec::get_uuid(&mut slice)?),
            },
            TAG_ABORT => JournalRecord::Abort {
                txn: TxnId::from_uuid(codec::get_uuid(&mut slice)?),
            },
            other => return Err(CodecError(format!("unknown journal record tag {other}"))),
        };
        if !slice.is_empty() {
            return Err(CodecError(format!(
                "{} trailing bytes after journal record",
                slice.len()
            )));
        }
        Ok(record)
    }
}

fn put_txn(buf: &mut BytesMut, txn: Option<TxnId>) {
    match txn {
        Some(t) => {
            buf.put_u8(1);
            codec::put_uuid(buf, t.as_uuid());
        }
        None => buf.put_u8(0),
    }
}

fn get_txn(slice: &mut &[u8]) -> Result<Option<TxnId>, CodecError> {
    if codec::get_flag(slice)? {
        Ok(Some(TxnId::from_uuid(codec::get_uuid(slice)?)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactional_enqueue_with_replacement_decodes() {
        let txn = TxnId::new();
        let record = JournalRecord::Enqueue {
            txn: Some(txn),
            position: 42,
            replaces: Some(7),
            message: Message::new(&b"B3"[..]).durable(true).with_property("LVQ_key", "B"),
        };
        let decoded = JournalRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.txn(), Some(txn));
        assert!(decoded.is_enqueue());
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(JournalRecord::decode(&[99]).is_err());
        assert!(JournalRecord::decode(&[]).is_err());
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut raw = JournalRecord::Delivered { enq_rid: 3 }.encode().unwrap();
        raw.push(0);
        assert!(JournalRecord::decode(&raw).is_err());
    }
}
