//! Entity catalog: exchanges and queues, with the durable ones persisted in a
//! catalog log that is replayed and compacted on open.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::codec::{self, CodecError};
use crate::core::error::StoreError;
use crate::core::journal::JournalGeometry;
use crate::core::queue::flow::{AdmissionPolicy, FlowState, PolicyMode};
use crate::core::wal::{WalConfig, WalError, WriteAheadLog};

pub(crate) const CATALOG_FILE: &str = "catalog.wal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    fn to_u8(self) -> u8 {
        match self {
            ExchangeKind::Direct => 0,
            ExchangeKind::Topic => 1,
            ExchangeKind::Fanout => 2,
            ExchangeKind::Headers => 3,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => ExchangeKind::Direct,
            1 => ExchangeKind::Topic,
            2 => ExchangeKind::Fanout,
            3 => ExchangeKind::Headers,
            other => return Err(CodecError(format!("unknown exchange kind {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDecl {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub alternate_exchange: Option<String>,
}

impl ExchangeDecl {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            alternate_exchange: None,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn alternate_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.alternate_exchange = Some(exchange.into());
        self
    }
}

/// An exchange as the catalog currently holds it.
pub type ExchangeInfo = ExchangeDecl;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDecl {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub alternate_exchange: Option<String>,
    #[serde(default)]
    pub policy: Option<AdmissionPolicy>,
    #[serde(default)]
    pub lvq_key: Option<String>,
    /// Journal geometry of a durable queue; the store default applies when unset.
    #[serde(default)]
    pub journal: Option<JournalGeometry>,
    /// Declaration arguments the store does not interpret.
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl QueueDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            alternate_exchange: None,
            policy: None,
            lvq_key: None,
            journal: None,
            arguments: BTreeMap::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn lvq_key(mut self, key: impl Into<String>) -> Self {
        self.lvq_key = Some(key.into());
        self
    }

    pub fn alternate_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.alternate_exchange = Some(exchange.into());
        self
    }

    pub fn journal(mut self, geometry: JournalGeometry) -> Self {
        self.journal = Some(geometry);
        self
    }

    /// Build a declaration from an untyped argument map.
    ///
    /// Recognised keys: `max_count`, `max_size`, `policy_type` (`reject` or
    /// `flow_to_disk`), `lvq_key` and `alternate_exchange`. Anything else is kept
    /// verbatim in [`QueueDecl::arguments`].
    pub fn from_arguments(
        name: impl Into<String>,
        durable: bool,
        args: &BTreeMap<String, String>,
    ) -> Result<Self, StoreError> {
        let mut decl = QueueDecl::new(name).durable(durable);
        let mut max_count = None;
        let mut max_size = None;
        let mut mode = None;
        for (key, value) in args {
            match key.as_str() {
                "max_count" => max_count = Some(parse_limit(key, value)?),
                "max_size" => max_size = Some(parse_limit(key, value)?),
                "policy_type" => {
                    mode = Some(PolicyMode::parse(value).ok_or_else(|| {
                        StoreError::InvalidArgument(format!(
                            "policy_type must be reject or flow_to_disk, got {value:?}"
                        ))
                    })?)
                }
                "lvq_key" => decl.lvq_key = Some(non_empty(key, value)?),
                "alternate_exchange" => decl.alternate_exchange = Some(non_empty(key, value)?),
                _ => {
                    decl.arguments.insert(key.clone(), value.clone());
                }
            }
        }
        if max_count.is_some() || max_size.is_some() || mode.is_some() {
            decl.policy = Some(AdmissionPolicy {
                max_count,
                max_size,
                mode: mode.unwrap_or(PolicyMode::Reject),
            });
        }
        Ok(decl)
    }

    /// Same declaration, ignoring an unspecified journal geometry.
    fn matches(&self, existing: &QueueDecl) -> bool {
        let journal_matches = match self.journal {
            Some(geometry) => existing.journal == Some(geometry),
            None => true,
        };
        journal_matches
            && self.durable == existing.durable
            && self.alternate_exchange == existing.alternate_exchange
            && self.policy == existing.policy
            && self.lvq_key == existing.lvq_key
            && self.arguments == existing.arguments
    }
}

fn parse_limit(key: &str, value: &str) -> Result<u64, StoreError> {
    value.trim().parse::<u64>().map_err(|e| {
        StoreError::InvalidArgument(format!("{key} must be a non-negative integer, got {value:?}: {e}"))
    })
}

fn non_empty(key: &str, value: &str) -> Result<String, StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidArgument(format!("{key} must not be empty")));
    }
    Ok(value.to_string())
}

/// Catalog view of a queue together with its live figures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub decl: QueueDecl,
    pub depth: u64,
    pub paged: u64,
    pub held: u64,
    pub flow: FlowState,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Exchange(String),
    Queue(String),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Exchange(name) => write!(f, "exchange {name}"),
            EntityRef::Queue(name) => write!(f, "queue {name}"),
        }
    }
}

// ───────────────────────────────────────────────────────────
// Catalog log records
// ───────────────────────────────────────────────────────────

const REC_DECLARE_EXCHANGE: u8 = 1;
const REC_DELETE_EXCHANGE: u8 = 2;
const REC_DECLARE_QUEUE: u8 = 3;
const REC_DELETE_QUEUE: u8 = 4;
const REC_SET_ALTERNATE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CatalogRecord {
    DeclareExchange(ExchangeDecl),
    DeleteExchange(String),
    DeclareQueue(QueueDecl),
    DeleteQueue(String),
    SetAlternate {
        entity: EntityRef,
        alternate: Option<String>,
    },
}

impl CatalogRecord {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::new();
        match self {
            CatalogRecord::DeclareExchange(decl) => {
                buf.put_u8(REC_DECLARE_EXCHANGE);
                codec::put_str(&mut buf, &decl.name)?;
                buf.put_u8(decl.kind.to_u8());
                buf.put_u8(u8::from(decl.durable));
                codec::put_opt_str(&mut buf, decl.alternate_exchange.as_deref())?;
            }
            CatalogRecord::DeleteExchange(name) => {
                buf.put_u8(REC_DELETE_EXCHANGE);
                codec::put_str(&mut buf, name)?;
            }
            CatalogRecord::DeclareQueue(decl) => {
                buf.put_u8(REC_DECLARE_QUEUE);
                codec::put_str(&mut buf, &decl.name)?;
                buf.put_u8(u8::from(decl.durable));
                codec::put_opt_str(&mut buf, decl.alternate_exchange.as_deref())?;
                match &decl.policy {
                    Some(policy) => {
                        buf.put_u8(1);
                        codec::put_opt_u64(&mut buf, policy.max_count);
                        codec::put_opt_u64(&mut buf, policy.max_size);
                        buf.put_u8(match policy.mode {
                            PolicyMode::Reject => 0,
                            PolicyMode::FlowToDisk => 1,
                        });
                    }
                    None => buf.put_u8(0),
                }
                codec::put_opt_str(&mut buf, decl.lvq_key.as_deref())?;
                match &decl.journal {
                    Some(geometry) => {
                        buf.put_u8(1);
                        buf.put_u32(geometry.num_files);
                        buf.put_u32(geometry.file_size_pages);
                    }
                    None => buf.put_u8(0),
                }
                codec::put_map(&mut buf, &decl.arguments)?;
            }
            CatalogRecord::DeleteQueue(name) => {
                buf.put_u8(REC_DELETE_QUEUE);
                codec::put_str(&mut buf, name)?;
            }
            CatalogRecord::SetAlternate { entity, alternate } => {
                buf.put_u8(REC_SET_ALTERNATE);
                let (kind, name) = match entity {
                    EntityRef::Exchange(name) => (0u8, name),
                    EntityRef::Queue(name) => (1u8, name),
                };
                buf.put_u8(kind);
                codec::put_str(&mut buf, name)?;
                codec::put_opt_str(&mut buf, alternate.as_deref())?;
            }
        }
        Ok(buf.to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut slice = bytes;
        let record = match codec::get_u8(&mut slice)? {
            REC_DECLARE_EXCHANGE => {
                let name = codec::get_str(&mut slice)?;
                let kind = ExchangeKind::from_u8(codec::get_u8(&mut slice)?)?;
                let durable = codec::get_flag(&mut slice)?;
                let alternate_exchange = codec::get_opt_str(&mut slice)?;
                CatalogRecord::DeclareExchange(ExchangeDecl {
                    name,
                    kind,
                    durable,
                    alternate_exchange,
                })
            }
            REC_DELETE_EXCHANGE => CatalogRecord::DeleteExchange(codec::get_str(&mut slice)?),
            REC_DECLARE_QUEUE => {
                let name = codec::get_str(&mut slice)?;
                let durable = codec::get_flag(&mut slice)?;
                let alternate_exchange = codec::get_opt_str(&mut slice)?;
                let policy = if codec::get_flag(&mut slice)? {
                    let max_count = codec::get_opt_u64(&mut slice)?;
                    let max_size = codec::get_opt_u64(&mut slice)?;
                    let mode = match codec::get_u8(&mut slice)? {
                        0 => PolicyMode::Reject,
                        1 => PolicyMode::FlowToDisk,
                        other => return Err(CodecError(format!("unknown policy mode {other}"))),
                    };
                    Some(AdmissionPolicy {
                        max_count,
                        max_size,
                        mode,
                    })
                } else {
                    None
                };
                let lvq_key = codec::get_opt_str(&mut slice)?;
                let journal = if codec::get_flag(&mut slice)? {
                    Some(JournalGeometry {
                        num_files: codec::get_u32(&mut slice)?,
                        file_size_pages: codec::get_u32(&mut slice)?,
                    })
                } else {
                    None
                };
                let arguments = codec::get_map(&mut slice)?;
                CatalogRecord::DeclareQueue(QueueDecl {
                    name,
                    durable,
                    alternate_exchange,
                    policy,
                    lvq_key,
                    journal,
                    arguments,
                })
            }
            REC_DELETE_QUEUE => CatalogRecord::DeleteQueue(codec::get_str(&mut slice)?),
            REC_SET_ALTERNATE => {
                let kind = codec::get_u8(&mut slice)?;
                let name = codec::get_str(&mut slice)?;
                let alternate = codec::get_opt_str(&mut slice)?;
                let entity = match kind {
                    0 => EntityRef::Exchange(name),
                    1 => EntityRef::Queue(name),
                    other => return Err(CodecError(format!("unknown entity kind {other}"))),
                };
                CatalogRecord::SetAlternate { entity, alternate }
            }
            other => return Err(CodecError(format!("unknown catalog record tag {other}"))),
        };
        if !slice.is_empty() {
            return Err(CodecError(format!(
                "{} trailing bytes after catalog record",
                slice.len()
            )));
        }
        Ok(record)
    }
}

// ───────────────────────────────────────────────────────────
// Catalog
// ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CatalogState {
    exchanges: BTreeMap<String, ExchangeDecl>,
    queues: BTreeMap<String, QueueDecl>,
}

impl CatalogState {
    /// Check that `alternate` can be referenced by an entity of durability `durable`.
    fn check_alternate(&self, alternate: &str, durable: bool) -> Result<(), String> {
        match self.exchanges.get(alternate) {
            None => Err(format!("alternate exchange {alternate} does not exist")),
            Some(ex) if durable && !ex.durable => Err(format!(
                "durable entity cannot use non-durable alternate exchange {alternate}"
            )),
            Some(_) => Ok(()),
        }
    }

    fn alternate_users(&self, exchange: &str) -> Vec<EntityRef> {
        let exchanges = self
            .exchanges
            .values()
            .filter(|e| e.name != exchange && e.alternate_exchange.as_deref() == Some(exchange))
            .map(|e| EntityRef::Exchange(e.name.clone()));
        let queues = self
            .queues
            .values()
            .filter(|q| q.alternate_exchange.as_deref() == Some(exchange))
            .map(|q| EntityRef::Queue(q.name.clone()));
        exchanges.chain(queues).collect()
    }

    /// Apply one replayed record, refusing anything a well-formed log cannot contain.
    fn replay(&mut self, record: CatalogRecord) -> Result<(), String> {
        match record {
            CatalogRecord::DeclareExchange(decl) => {
                if let Some(alt) = decl.alternate_exchange.as_deref() {
                    if alt != decl.name {
                        self.check_alternate(alt, true)?;
                    }
                }
                if self.exchanges.contains_key(&decl.name) {
                    return Err(format!("exchange {} declared twice", decl.name));
                }
                self.exchanges.insert(decl.name.clone(), decl);
            }
            CatalogRecord::DeleteExchange(name) => {
                if self.exchanges.remove(&name).is_none() {
                    return Err(format!("delete of unknown exchange {name}"));
                }
            }
            CatalogRecord::DeclareQueue(decl) => {
                if let Some(alt) = decl.alternate_exchange.as_deref() {
                    self.check_alternate(alt, true)?;
                }
                if self.queues.contains_key(&decl.name) {
                    return Err(format!("queue {} declared twice", decl.name));
                }
                self.queues.insert(decl.name.clone(), decl);
            }
            CatalogRecord::DeleteQueue(name) => {
                if self.queues.remove(&name).is_none() {
                    return Err(format!("delete of unknown queue {name}"));
                }
            }
            CatalogRecord::SetAlternate { entity, alternate } => {
                if let Some(alt) = alternate.as_deref() {
                    self.check_alternate(alt, true)?;
                }
                let slot = match &entity {
                    EntityRef::Exchange(name) => {
                        self.exchanges.get_mut(name).map(|e| &mut e.alternate_exchange)
                    }
                    EntityRef::Queue(name) => {
                        self.queues.get_mut(name).map(|q| &mut q.alternate_exchange)
                    }
                };
                let slot = slot.ok_or_else(|| format!("alternate set on unknown {entity}"))?;
                *slot = alternate;
            }
        }
        Ok(())
    }

    /// One record per durable entity, ordered so that every alternate resolves
    /// when the records are replayed.
    fn compacted(&self) -> Vec<CatalogRecord> {
        let mut records = Vec::new();
        let mut alternates = Vec::new();
        for ex in self.exchanges.values().filter(|e| e.durable) {
            let mut plain = ex.clone();
            if let Some(alt) = plain.alternate_exchange.take() {
                alternates.push(CatalogRecord::SetAlternate {
                    entity: EntityRef::Exchange(ex.name.clone()),
                    alternate: Some(alt),
                });
            }
            records.push(CatalogRecord::DeclareExchange(plain));
        }
        records.extend(alternates);
        for q in self.queues.values().filter(|q| q.durable) {
            records.push(CatalogRecord::DeclareQueue(q.clone()));
        }
        records
    }
}

/// Outcome of a declare call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Declared<T> {
    Created(T),
    Existing(T),
}

#[derive(Debug, Default)]
pub(crate) struct Catalog {
    state: RwLock<CatalogState>,
    wal: OnceLock<WriteAheadLog>,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replay `<dir>/catalog.wal`, then rewrite it compactly.
    pub(crate) fn recover(&self, dir: &Path, config: WalConfig) -> Result<(), StoreError> {
        let path = dir.join(CATALOG_FILE);
        let (wal, records) = WriteAheadLog::open(&path, config).map_err(catalog_corruption)?;
        let mut state = self.state.write();
        for record in &records {
            let decoded = CatalogRecord::decode(&record.payload).map_err(|e| {
                StoreError::corruption("catalog", format!("record {}: {e}", record.id))
            })?;
            state
                .replay(decoded)
                .map_err(|e| StoreError::corruption("catalog", format!("record {}: {e}", record.id)))?;
        }
        let compacted = state
            .compacted()
            .iter()
            .map(CatalogRecord::encode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::corruption("catalog", e))?;
        wal.rewrite(&compacted).map_err(catalog_corruption)?;
        info!(
            exchanges = state.exchanges.len(),
            queues = state.queues.len(),
            replayed = records.len(),
            compacted = compacted.len(),
            "catalog recovered"
        );
        drop(state);
        self.wal
            .set(wal)
            .map_err(|_| StoreError::Internal("catalog recovered twice".to_string()))
    }

    fn persist(&self, record: &CatalogRecord) -> Result<(), StoreError> {
        let wal = self
            .wal
            .get()
            .ok_or_else(|| StoreError::Internal("catalog log not open".to_string()))?;
        let payload = record
            .encode()
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        wal.append(&payload).map_err(catalog_corruption)?;
        wal.flush().map_err(catalog_corruption)?;
        Ok(())
    }

    pub(crate) fn declare_exchange(
        &self,
        decl: ExchangeDecl,
    ) -> Result<Declared<ExchangeDecl>, StoreError> {
        validate_name("exchange", &decl.name)?;
        let mut state = self.state.write();
        if let Some(existing) = state.exchanges.get(&decl.name) {
            if *existing == decl {
                return Ok(Declared::Existing(existing.clone()));
            }
            return Err(StoreError::EntityConflict(format!(
                "exchange {} already declared with different properties",
                decl.name
            )));
        }
        if let Some(alt) = decl.alternate_exchange.as_deref() {
            if alt != decl.name {
                state
                    .check_alternate(alt, decl.durable)
                    .map_err(StoreError::EntityConflict)?;
            }
        }
        if decl.durable {
            self.persist(&CatalogRecord::DeclareExchange(decl.clone()))?;
        }
        debug!(exchange = %decl.name, durable = decl.durable, "declared exchange");
        state.exchanges.insert(decl.name.clone(), decl.clone());
        Ok(Declared::Created(decl))
    }

    /// Declare a queue. `default_journal` fills in the geometry of a new durable
    /// queue that did not specify one.
    pub(crate) fn declare_queue(
        &self,
        mut decl: QueueDecl,
        default_journal: JournalGeometry,
    ) -> Result<Declared<QueueDecl>, StoreError> {
        validate_name("queue", &decl.name)?;
        if let Some(geometry) = decl.journal {
            geometry
                .validate()
                .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        }
        let mut state = self.state.write();
        if let Some(existing) = state.queues.get(&decl.name) {
            if decl.matches(existing) {
                return Ok(Declared::Existing(existing.clone()));
            }
            return Err(StoreError::EntityConflict(format!(
                "queue {} already declared with different properties",
                decl.name
            )));
        }
        if let Some(alt) = decl.alternate_exchange.as_deref() {
            state
                .check_alternate(alt, decl.durable)
                .map_err(StoreError::EntityConflict)?;
        }
        decl.journal = if decl.durable {
            Some(decl.journal.unwrap_or(default_journal))
        } else {
            None
        };
        if decl.durable {
            self.persist(&CatalogRecord::DeclareQueue(decl.clone()))?;
        }
        debug!(queue = %decl.name, durable = decl.durable, "declared queue");
        state.queues.insert(decl.name.clone(), decl.clone());
        Ok(Declared::Created(decl))
    }

    pub(crate) fn delete_exchange(&self, name: &str) -> Result<ExchangeDecl, StoreError> {
        let mut state = self.state.write();
        let durable = match state.exchanges.get(name) {
            Some(ex) => ex.durable,
            None => return Err(StoreError::NotFound(format!("exchange {name}"))),
        };
        let users = state.alternate_users(name);
        if let Some(user) = users.first() {
            return Err(StoreError::EntityConflict(format!(
                "exchange {name} is the alternate exchange of {user}"
            )));
        }
        if durable {
            self.persist(&CatalogRecord::DeleteExchange(name.to_string()))?;
        }
        state
            .exchanges
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(format!("exchange {name}")))
    }

    pub(crate) fn delete_queue(&self, name: &str) -> Result<QueueDecl, StoreError> {
        let mut state = self.state.write();
        let durable = match state.queues.get(name) {
            Some(q) => q.durable,
            None => return Err(StoreError::NotFound(format!("queue {name}"))),
        };
        if durable {
            self.persist(&CatalogRecord::DeleteQueue(name.to_string()))?;
        }
        state
            .queues
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(format!("queue {name}")))
    }

    pub(crate) fn set_alternate(
        &self,
        entity: &EntityRef,
        alternate: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let durable = match entity {
            EntityRef::Exchange(name) => state.exchanges.get(name).map(|e| e.durable),
            EntityRef::Queue(name) => state.queues.get(name).map(|q| q.durable),
        }
        .ok_or_else(|| StoreError::NotFound(entity.to_string()))?;
        if let Some(alt) = alternate.as_deref() {
            state
                .check_alternate(alt, durable)
                .map_err(StoreError::EntityConflict)?;
        }
        if durable {
            self.persist(&CatalogRecord::SetAlternate {
                entity: entity.clone(),
                alternate: alternate.clone(),
            })?;
        }
        match entity {
            EntityRef::Exchange(name) => {
                if let Some(ex) = state.exchanges.get_mut(name) {
                    ex.alternate_exchange = alternate;
                }
            }
            EntityRef::Queue(name) => {
                if let Some(q) = state.queues.get_mut(name) {
                    q.alternate_exchange = alternate;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn exchange(&self, name: &str) -> Option<ExchangeDecl> {
        self.state.read().exchanges.get(name).cloned()
    }

    pub(crate) fn queue(&self, name: &str) -> Option<QueueDecl> {
        self.state.read().queues.get(name).cloned()
    }

    pub(crate) fn exchanges(&self) -> Vec<ExchangeDecl> {
        self.state.read().exchanges.values().cloned().collect()
    }

    pub(crate) fn queues(&self) -> Vec<QueueDecl> {
        self.state.read().queues.values().cloned().collect()
    }
}

fn validate_name(what: &str, name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidArgument(format!("{what} name must not be empty")));
    }
    if name.len() > u16::MAX as usize {
        return Err(StoreError::InvalidArgument(format!("{what} name too long")));
    }
    Ok(())
}

fn catalog_corruption(err: WalError) -> StoreError {
    match err {
        WalError::Io(io) => StoreError::Io(io),
        other => StoreError::corruption("catalog", other),
    }
}
