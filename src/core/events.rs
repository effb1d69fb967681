//! Observable flow-control transitions.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::core::txn::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEventKind {
    /// Admitted with its body on disk only.
    Paged,
    /// Promoted from paged to resident.
    Released,
    /// A paged record that will never be promoted.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCause {
    Accept,
    Commit(TxnId),
    Abort(TxnId),
    Dequeue,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    pub queue: String,
    pub message_id: Uuid,
    pub correlation_id: Option<String>,
    pub kind: FlowEventKind,
    pub cause: FlowCause,
}

/// Fan-out of flow events to any number of subscribers.
///
/// Subscribers whose receiver has been dropped are pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct FlowEvents {
    subscribers: Arc<Mutex<Vec<flume::Sender<FlowEvent>>>>,
}

impl FlowEvents {
    pub fn subscribe(&self) -> flume::Receiver<FlowEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        info!(
            target: "blipstore::flow",
            queue = %event.queue,
            message_id = %event.message_id,
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            kind = ?event.kind,
            cause = ?event.cause,
            "flow event"
        );
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: FlowEventKind) -> FlowEvent {
        FlowEvent {
            queue: "q".into(),
            message_id: Uuid::new_v4(),
            correlation_id: Some("msg-1".into()),
            kind,
            cause: FlowCause::Accept,
        }
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let events = FlowEvents::default();
        let a = events.subscribe();
        let b = events.subscribe();
        events.emit(event(FlowEventKind::Paged));
        assert_eq!(a.try_recv().unwrap().kind, FlowEventKind::Paged);
        assert_eq!(b.try_recv().unwrap().kind, FlowEventKind::Paged);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let events = FlowEvents::default();
        drop(events.subscribe());
        let live = events.subscribe();
        events.emit(event(FlowEventKind::Released));
        assert_eq!(events.subscribers.lock().len(), 1);
        assert!(live.try_recv().is_ok());
    }
}
