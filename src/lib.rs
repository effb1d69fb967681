//! BlipStore – a durable, bounded, transactional queue store.
//!
//! This crate exports
//!  * `core`      – record log, entity catalog, bounded queues, transactions, recovery
//!  * `config`    – TOML/YAML-driven store configuration with env overrides
//!  * `logging`   – tracing subscriber setup shared by the binaries and tests
//!  * `lifecycle` – explicit `start(config) -> StoreHandle` / `stop(handle)` collaborator
//!
//! Messages arrive already routed to their target queues; the store owns
//! admission, paging, durability and replay. Binaries under `src/bin/` build the
//! daemon (`blipstored`) and the offline journal resize tool (`blipstore-resize`).

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod lifecycle;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::config::{ConfigError, StoreConfig};
pub use crate::core::error::{LimitKind, StoreError};
pub use crate::core::events::{FlowCause, FlowEvent, FlowEventKind};
pub use crate::core::message::{
    AdmissionResult, DeadLetter, Delivery, DeliveryTag, Disposition, Message, Residency,
};
pub use crate::core::queue::flow::{AdmissionPolicy, FlowState, PolicyMode};
pub use crate::core::session::Session;
pub use crate::core::store::{Store, StoreOptions};
pub use crate::core::txn::TxnId;
pub use crate::lifecycle::{start, stop, ExitStatus, LifecycleError, StoreHandle};
