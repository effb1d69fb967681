//! Store engine.
//!
//! Leaves first:
//!  * `codec` / `wal`   – binary field encoding and the single-file log used by
//!    the catalog and the transaction decision log
//!  * `journal`         – per-queue ring of fixed-geometry journal files
//!  * `catalog`         – durable exchange and queue metadata
//!  * `queue`           – bounded queue, flow controller and LVQ index
//!  * `txn`             – transaction contexts and the commit decision record
//!  * `recovery`        – `Stopped -> Replaying -> Ready`
//!  * `store`           – the facade tying everything together
//!  * `session`, `events`, `resize` – client convenience, flow events, offline resize

pub mod catalog;
pub mod codec;
pub mod error;
pub mod events;
pub mod journal;
pub mod message;
pub mod queue;
pub mod recovery;
pub mod resize;
pub mod session;
pub mod store;
pub mod txn;
pub mod wal;

pub use catalog::{EntityRef, ExchangeDecl, ExchangeInfo, ExchangeKind, QueueDecl, QueueInfo};
pub use error::{LimitKind, StoreError};
pub use events::{FlowCause, FlowEvent, FlowEventKind};
pub use journal::JournalGeometry;
pub use message::{
    AdmissionResult, BrowsedMessage, DeadLetter, Delivery, DeliveryTag, Disposition, Message,
    Residency,
};
pub use queue::flow::{AdmissionPolicy, FlowState, PolicyMode};
pub use recovery::{RecoveryReport, RecoveryState};
pub use session::Session;
pub use store::{Store, StoreOptions};
pub use txn::{TxnId, TxnState};
