use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::broadcast;
use tracing::debug;

use crate::event::ServiceEvent;
use crate::model::ServiceInfo;

// Buffered events per subscriber before a slow client starts lagging
pub const BROADCAST_CAPACITY: usize = 1000;

/// Fire-and-forget push of service updates to connected clients.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, event: &str, payload: &ServiceInfo);
}

// Sync side of the bridge, handed to producers
#[derive(Clone)]
pub struct EventSender(Sender<ServiceEvent>);

impl EventPublisher for EventSender {
    fn publish(&self, topic: &str, event: &str, payload: &ServiceInfo) {
        let message = ServiceEvent {
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        };
        if self.0.send(message).is_err() {
            debug!(topic, event, "broadcaster stopped, dropping event");
        }
    }
}

// Bridges producers to async WebSocket subscribers
pub struct EventBroadcaster {
    receiver: Receiver<ServiceEvent>,
    tokio_broadcast: broadcast::Sender<ServiceEvent>,
}

impl EventBroadcaster {
    pub fn new() -> (EventSender, Self) {
        let (sync_tx, sync_rx) = unbounded();
        let (tokio_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);

        (
            EventSender(sync_tx),
            Self {
                receiver: sync_rx,
                tokio_broadcast: tokio_tx,
            },
        )
    }

    // Blocking bridge loop (crossbeam → tokio broadcast); run it on
    // spawn_blocking. Returns once every EventSender is dropped.
    pub fn run(self) {
        while let Ok(event) = self.receiver.recv() {
            // No subscribers is not an error
            let _ = self.tokio_broadcast.send(event);
        }
        debug!("event broadcaster stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tokio_broadcast.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tokio_broadcast.receiver_count()
    }
}

impl Clone for EventBroadcaster {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            tokio_broadcast: self.tokio_broadcast.clone(),
        }
    }
}
