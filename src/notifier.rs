//! Process-local fan-out of change hints.
//!
//! Publishers report (user, room, server) hints after commits; long-poll sync
//! handlers and federation senders subscribe with a filter and receive a copy
//! of each matching change on a bounded channel. Delivery is non-blocking; a
//! subscriber whose buffer is full misses the hint (it will catch up on its
//! next poll). An optional external bus echoes local changes to other
//! processes; remote changes are fanned out locally but never re-published.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use ruma::{OwnedRoomId, OwnedServerName, OwnedUserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    pub user_id: Option<OwnedUserId>,
    pub room_id: Option<OwnedRoomId>,
    pub server_name: Option<OwnedServerName>,
}

impl Change {
    pub fn for_user_in_room(user_id: OwnedUserId, room_id: OwnedRoomId) -> Self {
        Self {
            user_id: Some(user_id),
            room_id: Some(room_id),
            server_name: None,
        }
    }

    pub fn for_server(server_name: OwnedServerName) -> Self {
        Self {
            user_id: None,
            room_id: None,
            server_name: Some(server_name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Subscription {
    pub user_ids: HashSet<OwnedUserId>,
    pub room_ids: HashSet<OwnedRoomId>,
    pub server_names: HashSet<OwnedServerName>,
    pub all_servers: bool,
}

impl Subscription {
    pub fn all_servers() -> Self {
        Self {
            all_servers: true,
            ..Default::default()
        }
    }

    pub fn for_user(user_id: OwnedUserId) -> Self {
        Self {
            user_ids: HashSet::from([user_id]),
            ..Default::default()
        }
    }

    fn matches(&self, change: &Change) -> bool {
        if self.all_servers && change.server_name.is_some() {
            return true;
        }
        if let Some(user_id) = &change.user_id {
            if self.user_ids.contains(user_id) {
                return true;
            }
        }
        if let Some(room_id) = &change.room_id {
            if self.room_ids.contains(room_id) {
                return true;
            }
        }
        if let Some(server_name) = &change.server_name {
            if self.server_names.contains(server_name) {
                return true;
            }
        }
        false
    }
}

/// External cross-process pub/sub hook. The concrete transport lives outside
/// the core.
pub trait ChangeBus: Send + Sync {
    fn publish(&self, change: &Change);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    subscription: Subscription,
    sender: mpsc::Sender<Change>,
}

enum QueueItem {
    Local(Change),
    Remote(Change),
}

#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    name: &'static str,
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<QueueItem>,
    cancel: CancellationToken,
}

impl Notifier {
    pub fn new(name: &'static str, bus: Option<Arc<dyn ChangeBus>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let notifier = Self {
            inner: Arc::new(NotifierInner {
                name,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue: queue_tx,
                cancel,
            }),
        };

        tokio::spawn(pump(notifier.inner.clone(), queue_rx, bus));
        notifier
    }

    pub fn subscribe(&self, sender: mpsc::Sender<Change>, subscription: Subscription) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().insert(
            id,
            Subscriber {
                subscription,
                sender,
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.subscribers.lock().remove(&id);
    }

    /// Queue a locally-originated change for fan-out (and bus echo).
    pub fn send_change(&self, change: Change) {
        let _ = self.inner.queue.send(QueueItem::Local(change));
    }

    /// Fan out a change received from the external bus. Never re-published.
    pub fn ingest_remote(&self, change: Change) {
        let _ = self.inner.queue.send(QueueItem::Remote(change));
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

async fn pump(
    inner: Arc<NotifierInner>,
    mut queue: mpsc::UnboundedReceiver<QueueItem>,
    bus: Option<Arc<dyn ChangeBus>>,
) {
    debug!(notifier = inner.name, "Notifier pump started");
    loop {
        let item = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let (change, local) = match item {
            QueueItem::Local(change) => (change, true),
            QueueItem::Remote(change) => (change, false),
        };

        {
            let subscribers = inner.subscribers.lock();
            for subscriber in subscribers.values() {
                if !subscriber.subscription.matches(&change) {
                    continue;
                }
                // Slow-consumer isolation: skip full buffers.
                if subscriber.sender.try_send(change.clone()).is_err() {
                    trace!(notifier = inner.name, "Dropping change for slow subscriber");
                }
            }
        }

        if local {
            if let Some(bus) = &bus {
                bus.publish(&change);
            }
        }
    }
    debug!(notifier = inner.name, "Notifier pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(raw: &str) -> OwnedUserId {
        OwnedUserId::try_from(raw).unwrap()
    }

    fn server(raw: &str) -> OwnedServerName {
        OwnedServerName::try_from(raw).unwrap()
    }

    #[tokio::test]
    async fn delivers_matching_changes_only() {
        let notifier = Notifier::new("rooms", None);
        let (tx, mut rx) = mpsc::channel(8);
        notifier.subscribe(tx, Subscription::for_user(user("@a:s")));

        notifier.send_change(Change {
            user_id: Some(user("@b:s")),
            ..Default::default()
        });
        notifier.send_change(Change {
            user_id: Some(user("@a:s")),
            ..Default::default()
        });

        let change = rx.recv().await.unwrap();
        assert_eq!(change.user_id, Some(user("@a:s")));
        assert!(rx.try_recv().is_err());
        notifier.stop();
    }

    #[tokio::test]
    async fn all_servers_subscription_sees_every_server_hint() {
        let notifier = Notifier::new("rooms", None);
        let (tx, mut rx) = mpsc::channel(8);
        notifier.subscribe(tx, Subscription::all_servers());

        notifier.send_change(Change::for_server(server("remote.example")));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.server_name, Some(server("remote.example")));
        notifier.stop();
    }

    #[tokio::test]
    async fn slow_subscriber_is_skipped_not_blocked() {
        let notifier = Notifier::new("rooms", None);
        let (tx, mut rx) = mpsc::channel(1);
        notifier.subscribe(tx, Subscription::all_servers());

        for _ in 0..10 {
            notifier.send_change(Change::for_server(server("remote.example")));
        }
        // The pump must stay live; at least the first hint arrives.
        let change = rx.recv().await.unwrap();
        assert!(change.server_name.is_some());
        notifier.stop();
    }

    struct RecordingBus(Mutex<Vec<Change>>);

    impl ChangeBus for RecordingBus {
        fn publish(&self, change: &Change) {
            self.0.lock().push(change.clone());
        }
    }

    #[tokio::test]
    async fn remote_changes_are_not_republished() {
        let bus = Arc::new(RecordingBus(Mutex::new(Vec::new())));
        let notifier = Notifier::new("rooms", Some(bus.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        notifier.subscribe(tx, Subscription::all_servers());

        notifier.ingest_remote(Change::for_server(server("remote.example")));
        rx.recv().await.unwrap();
        assert!(bus.0.lock().is_empty());

        notifier.send_change(Change::for_server(server("remote.example")));
        rx.recv().await.unwrap();
        // The bus echo happens after subscriber delivery; give the pump a
        // moment.
        for _ in 0..100 {
            if bus.0.lock().len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(bus.0.lock().len(), 1);
        notifier.stop();
    }
}
