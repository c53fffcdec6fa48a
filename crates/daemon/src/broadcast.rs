//! Status fan-out to any number of listeners.
//!
//! Every subscriber owns an unbounded FIFO queue, so publishing never waits
//! on a slow consumer and each consumer sees events in publish order. There
//! is no ordering between different subscribers. Subscribers disappear when
//! their [`Subscription`] is dropped, or lazily once their queue is closed.

use std::future::Future;
use std::sync::Arc;

use alistlite_protocol::StatusEvent;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

type Subscribers = DashMap<Uuid, mpsc::UnboundedSender<StatusEvent>>;

/// Publishes [`StatusEvent`]s to all current subscribers.
#[derive(Clone, Default)]
pub struct StatusBroadcaster {
    subscribers: Arc<Subscribers>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Only events published afterwards are seen.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        tracing::debug!("Status subscriber {} registered", id);
        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Queue `event` for every subscriber and return how many received it.
    pub fn publish(&self, event: StatusEvent) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, tx| {
            let open = tx.send(event.clone()).is_ok();
            if open {
                delivered += 1;
            } else {
                tracing::debug!("Pruning closed status subscriber {}", id);
            }
            open
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drive `listener` from its own task. Abort the returned handle to stop it.
    ///
    /// A panic inside the listener ends only that listener's task.
    pub fn register<L: StatusListener>(&self, mut listener: L) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                listener.on_status(event).await;
            }
        })
    }
}

/// Receiving end of a subscription.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
    subscribers: Arc<Subscribers>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the subscription has been removed.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }

    /// Remove this subscriber. Events already queued stay readable.
    pub fn unsubscribe(&mut self) {
        self.subscribers.remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
    }
}

/// Typed consumer of status events.
pub trait StatusListener: Send + 'static {
    fn on_status(&mut self, event: StatusEvent) -> impl Future<Output = ()> + Send;
}

/// Listener that records every event in the log.
#[derive(Debug, Default)]
pub struct LogListener;

impl StatusListener for LogListener {
    async fn on_status(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::StateChanged {
                state,
                address: Some(address),
            } => tracing::info!("Engine {} at {}", state, address),
            StatusEvent::StateChanged { state, address: None } => {
                tracing::info!("Engine {}", state)
            }
            StatusEvent::UpdateAvailable(info) => tracing::info!(
                "Update available: v{} ({})",
                info.version,
                info.download_urls.first().map(String::as_str).unwrap_or("no link")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alistlite_protocol::ServerState;
    use std::time::Duration;

    fn state(state: ServerState) -> StatusEvent {
        StatusEvent::StateChanged {
            state,
            address: None,
        }
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let broadcaster = StatusBroadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish(state(ServerState::Starting));
        broadcaster.publish(state(ServerState::Running));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(state(ServerState::Starting)));
            assert_eq!(sub.recv().await, Some(state(ServerState::Running)));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.publish(state(ServerState::Running));
        let mut late = broadcaster.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_never_waits_on_slow_consumer() {
        let broadcaster = StatusBroadcaster::new();
        let _idle = broadcaster.subscribe();

        let published = tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..10_000 {
                broadcaster.publish(state(ServerState::Running));
            }
        })
        .await;
        assert!(published.is_ok());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broadcaster = StatusBroadcaster::new();
        let sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.publish(state(ServerState::Stopped)), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_queued_events() {
        let broadcaster = StatusBroadcaster::new();
        let mut sub = broadcaster.subscribe();
        broadcaster.publish(state(ServerState::Starting));
        sub.unsubscribe();
        broadcaster.publish(state(ServerState::Running));

        assert_eq!(sub.recv().await, Some(state(ServerState::Starting)));
        assert_eq!(sub.recv().await, None);
    }

    struct Collect(mpsc::UnboundedSender<StatusEvent>);

    impl StatusListener for Collect {
        async fn on_status(&mut self, event: StatusEvent) {
            let _ = self.0.send(event);
        }
    }

    struct Panics;

    impl StatusListener for Panics {
        async fn on_status(&mut self, _event: StatusEvent) {
            panic!("listener failure");
        }
    }

    #[tokio::test]
    async fn test_registered_listener_isolated_from_panicking_one() {
        let broadcaster = StatusBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bad = broadcaster.register(Panics);
        broadcaster.register(Collect(tx));

        broadcaster.publish(state(ServerState::Starting));
        assert!(bad.await.is_err());

        broadcaster.publish(state(ServerState::Running));
        assert_eq!(rx.recv().await, Some(state(ServerState::Starting)));
        assert_eq!(rx.recv().await, Some(state(ServerState::Running)));
    }
}
