use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::core::codec::{self, CodecError};

/// An already-routed message handed to the store.
///
/// The body is opaque and cheap to clone; a fanned-out message shares one
/// `Bytes` allocation between every queue that accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub correlation_id: Option<String>,
    pub durable: bool,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            durable: false,
            properties: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Size used for admission accounting: the body length in bytes.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        codec::put_uuid(buf, &self.id);
        buf.put_u8(u8::from(self.durable));
        codec::put_opt_str(buf, self.correlation_id.as_deref())?;
        codec::put_map(buf, &self.properties)?;
        codec::put_blob(buf, &self.body)
    }

    pub(crate) fn decode_from(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let id = codec::get_uuid(buf)?;
        let durable = codec::get_flag(buf)?;
        let correlation_id = codec::get_opt_str(buf)?;
        let properties = codec::get_map(buf)?;
        let body = codec::get_blob(buf)?;
        Ok(Self {
            id,
            correlation_id,
            durable,
            properties,
            body,
        })
    }
}

/// Per-queue delivery identifier handed out by `fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        DeliveryTag(value)
    }
}

/// Where an enqueue record's body currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident,
    Paged,
}

/// Outcome of a successful `accept`.
///
/// For transactional accepts this is the provisional decision; the final one is
/// taken at commit against the committed queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionResult {
    pub residency: Residency,
    /// An LVQ record with the same key was replaced.
    pub replaced: bool,
}

/// A record acquired by `fetch`, to be settled with `acknowledge` or `release`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub tag: DeliveryTag,
    pub position: u64,
    pub redelivered: bool,
    pub message: Message,
}

/// A non-acquiring view of a queued record.
#[derive(Debug, Clone)]
pub struct BrowsedMessage {
    pub position: u64,
    pub residency: Residency,
    pub redelivered: bool,
    pub held: bool,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Rejected,
}

/// A rejected message that the routing layer should republish to `exchange`.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub exchange: String,
    pub message: Message,
}
