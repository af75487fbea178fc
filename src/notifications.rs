//! Notification outbox
//!
//! Services hand committed domain events to a [`Notifier`], which queues them
//! on an unbounded channel and returns immediately. A background dispatcher
//! drains the queue and publishes each event to NATS. Neither a closed queue
//! nor a failed publish reaches the code that produced the event.

use crate::domain::events::DomainEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<DomainEvent>,
}

impl Notifier {
    pub fn new(sender: mpsc::UnboundedSender<DomainEvent>) -> Self { Self { sender } }

    /// Creates a notifier together with the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A notifier whose queue has no reader; events are dropped with a warning.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(tx)
    }

    pub fn notify(&self, event: DomainEvent) {
        let name = event.name();
        if let Err(e) = self.sender.send(event) {
            warn!(event = name, "notification dropped: {}", e);
        }
    }

    pub fn notify_all(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for e in events { self.notify(e); }
    }
}

/// Subject an event is published under, e.g. `storefront.incentives.payout_paid`.
pub fn subject_for(prefix: &str, event: &DomainEvent) -> String {
    format!("{}.{}", prefix, event.name())
}

/// Drains `rx` until every sender is gone. With no NATS client the events are
/// only logged.
pub fn spawn_dispatcher(mut rx: mpsc::UnboundedReceiver<DomainEvent>, nats: Option<async_nats::Client>, subject_prefix: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let subject = subject_for(&subject_prefix, &event);
            let Some(client) = nats.as_ref() else {
                debug!(%subject, "no NATS client, event logged only: {:?}", event);
                continue;
            };
            let payload = match serde_json::to_vec(&event) {
                Ok(p) => p,
                Err(e) => { warn!(%subject, "failed to encode event: {}", e); continue; }
            };
            if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                warn!(%subject, "failed to publish event: {}", e);
            }
        }
        info!("notification dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::LedgerEvent;

    fn approved() -> DomainEvent {
        DomainEvent::Ledger(LedgerEvent::PayoutApproved { affiliate_id: "A1".into(), request_id: "R1".into() })
    }

    #[tokio::test]
    async fn test_events_reach_queue() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.notify(approved());
        assert_eq!(rx.recv().await, Some(approved()));
    }

    #[test]
    fn test_disconnected_notifier_does_not_fail() {
        Notifier::disconnected().notify(approved());
    }

    #[test]
    fn test_subject() {
        assert_eq!(subject_for("storefront.incentives", &approved()), "storefront.incentives.payout_approved");
    }

    #[tokio::test]
    async fn test_dispatcher_stops_when_senders_drop() {
        let (notifier, rx) = Notifier::channel();
        let handle = spawn_dispatcher(rx, None, "test".into());
        notifier.notify(approved());
        drop(notifier);
        handle.await.unwrap();
    }
}
