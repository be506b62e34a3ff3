//! Outgoing federation: at most one sender per remote server across the
//! cluster, guarded by the distributed lock.
//!
//! Candidate servers arrive from stored sender positions at start-up and
//! from notifier hints afterwards. A sender loop drains the server's
//! local-origin super-stream in batches, ships each batch as one wire
//! transaction and advances the stored position inside a lock-checked
//! transaction. Idle senders exit after a few empty polls and restart on the
//! next hint.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use ruma::{OwnedEventId, OwnedServerName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    error::Result,
    lock::{Lock, LockManager},
    notifier::{Notifier, Subscription},
    rooms::{sync::SyncOptions, RoomsDb},
    types::{Event, VersionKey, VersionMap},
};

const SENDER_LOCK_PREFIX: &str = "FederationServerSenderLock:";

/// One wire transaction of batched PDUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub origin: OwnedServerName,
    pub destination: OwnedServerName,
    pub origin_server_ts: i64,
    pub pdus: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PduResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub pdus: HashMap<OwnedEventId, PduResult>,
}

/// The federation wire client is an external collaborator; the sender only
/// needs transaction delivery.
pub trait FederationClient: Send + Sync + 'static {
    fn send_transaction(
        &self,
        txn: Transaction,
    ) -> impl std::future::Future<Output = Result<TransactionResponse>> + Send;
}

/// Development client that accepts every transaction and logs it.
pub struct LoggingFederationClient;

impl FederationClient for LoggingFederationClient {
    async fn send_transaction(&self, txn: Transaction) -> Result<TransactionResponse> {
        info!(
            destination = %txn.destination,
            transaction_id = %txn.transaction_id,
            pdus = txn.pdus.len(),
            "Discarding outgoing transaction (no federation client configured)"
        );
        Ok(TransactionResponse::default())
    }
}

pub struct FederationSender<C: FederationClient> {
    inner: Arc<SenderInner<C>>,
}

struct SenderInner<C: FederationClient> {
    config: Config,
    rooms: RoomsDb,
    notifier: Notifier,
    client: C,
    locks: LockManager,

    /// Senders this process is currently running, with their wake channels.
    server_senders: Mutex<HashMap<OwnedServerName, mpsc::Sender<()>>>,

    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<C: FederationClient> Clone for FederationSender<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: FederationClient> FederationSender<C> {
    pub fn new(config: Config, rooms: RoomsDb, notifier: Notifier, client: C) -> Self {
        let (store, lock_subspace) = rooms.lock_primitives();
        Self {
            inner: Arc::new(SenderInner {
                config,
                rooms,
                notifier,
                client,
                locks: LockManager::new(store, lock_subspace),
                server_senders: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let initial = self
            .inner
            .rooms
            .get_server_names_with_positions(&self.inner.cancel)
            .await?;

        info!(initial_servers = initial.len(), "Starting federation sender");

        let this = self.clone();
        self.inner
            .tracker
            .spawn(async move { this.handle_servers_loop(initial).await });
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Federation sender stopped");
    }

    async fn handle_servers_loop(self, initial: Vec<OwnedServerName>) {
        let (tx, mut rx) = mpsc::channel(1000);
        let sub_id = self.inner.notifier.subscribe(tx, Subscription::all_servers());

        for server in initial {
            self.consider_server(server);
        }

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                change = rx.recv() => {
                    let Some(change) = change else { break };
                    if let Some(server) = change.server_name {
                        self.consider_server(server);
                    }
                }
            }
        }

        self.inner.notifier.unsubscribe(sub_id);
    }

    fn consider_server(&self, server: OwnedServerName) {
        if server == self.inner.config.server_name {
            warn!(server = %server, "Ignoring ourselves");
            return;
        }

        // Wake an already-running sender without touching the store lock.
        {
            let senders = self.inner.server_senders.lock();
            if let Some(wake) = senders.get(&server) {
                let _ = wake.try_send(());
                trace!(server = %server, "Sender already running, woke it");
                return;
            }
        }

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.maybe_run_server_sender(server).await;
        });
    }

    async fn maybe_run_server_sender(self, server: OwnedServerName) {
        let lock_name = format!("{SENDER_LOCK_PREFIX}{server}");
        let lease_secs = self.inner.config.federation.lock_timeout_secs as i64;

        let lock = match self
            .inner
            .locks
            .try_acquire(&self.inner.cancel, &lock_name, lease_secs)
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                trace!(server = %server, "Someone else is already running this server sender");
                return;
            }
            Err(err) => {
                warn!(server = %server, %err, "Error acquiring server sender lock");
                return;
            }
        };

        let (wake_tx, wake_rx) = mpsc::channel(1);
        self.inner
            .server_senders
            .lock()
            .insert(server.clone(), wake_tx);

        info!(server = %server, "Starting server sender");
        self.send_events_to_server_loop(&server, &lock, wake_rx).await;

        self.inner.server_senders.lock().remove(&server);
        if let Err(err) = lock.release(&self.inner.cancel).await {
            warn!(server = %server, %err, "Error releasing server sender lock");
        }
        info!(server = %server, "Server sender stopped");
    }

    async fn send_events_to_server_loop(
        &self,
        server: &OwnedServerName,
        lock: &Lock,
        mut wake_rx: mpsc::Receiver<()>,
    ) {
        let idle_limit = self.inner.config.federation.idle_polls_before_exit;
        let poll_interval = Duration::from_secs(self.inner.config.federation.lock_retry_secs);
        let mut idle_polls = 0u32;

        loop {
            if self.send_events_to_server(server, lock).await {
                idle_polls = 0;
            } else {
                idle_polls += 1;
            }
            // Free the lock after enough empty polls; the next notifier hint
            // starts a fresh sender.
            if idle_polls >= idle_limit {
                return;
            }

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Drain what is currently pending for one server. Returns whether
    /// anything was sent.
    async fn send_events_to_server(&self, server: &OwnedServerName, lock: &Lock) -> bool {
        let ctx = &self.inner.cancel;

        let mut positions = match self.inner.rooms.get_server_positions(ctx, server).await {
            Ok(positions) => positions.unwrap_or_default(),
            Err(err) => {
                warn!(server = %server, %err, "Failed to get current server positions");
                return false;
            }
        };

        let mut sent = false;
        loop {
            if let Err(err) = lock.refresh(ctx).await {
                warn!(server = %server, %err, "Lost server sender lock");
                return sent;
            }

            let from = positions.get(VersionKey::ROOMS);
            let limit = self.inner.config.federation.sync_limit;
            let (next, rooms) = match self
                .inner
                .rooms
                .sync_rooms_for_server(ctx, server, SyncOptions { from, limit })
                .await
            {
                Ok(out) => out,
                Err(err) => {
                    warn!(server = %server, %err, "Failed to sync events for server");
                    return sent;
                }
            };

            if next == from {
                return sent;
            }
            sent = true;

            let mut events: Vec<Event> = Vec::with_capacity(limit);
            for room in rooms.into_values() {
                events.extend(room.state_events);
                events.extend(room.timeline_events);
            }

            if !events.is_empty() {
                if let Err(err) = self.send_transaction_to_server(server, from, &events).await {
                    warn!(server = %server, %err, "Failed to send transaction");
                    return sent;
                }
            }

            positions.set(VersionKey::ROOMS, next);
            if let Err(err) = self
                .inner
                .rooms
                .update_server_positions(ctx, server, &positions, |txn| lock.txn_check(txn))
                .await
            {
                warn!(server = %server, %err, "Failed to update current server positions");
                return sent;
            }
        }
    }

    async fn send_transaction_to_server(
        &self,
        server: &OwnedServerName,
        from: crate::keys::Versionstamp,
        events: &[Event],
    ) -> Result<()> {
        let transaction_id = URL_SAFE_NO_PAD.encode(from.bytes());

        debug!(
            destination = %server,
            transaction_id = %transaction_id,
            pdus = events.len(),
            "Sending transaction to server"
        );

        let pdus = events
            .iter()
            .map(Event::to_sync_json)
            .collect::<Result<Vec<_>>>()?;

        let response = self
            .inner
            .client
            .send_transaction(Transaction {
                transaction_id: transaction_id.clone(),
                origin: self.inner.config.server_name.clone(),
                destination: server.clone(),
                origin_server_ts: chrono::Utc::now().timestamp_millis(),
                pdus,
            })
            .await?;

        let mut success = 0;
        let mut errors = 0;
        for (event_id, result) in &response.pdus {
            match &result.error {
                None => success += 1,
                Some(error) => {
                    errors += 1;
                    warn!(
                        destination = %server,
                        event_id = %event_id,
                        transaction_id = %transaction_id,
                        error = %error,
                        "Event error from other server"
                    );
                }
            }
        }
        info!(
            destination = %server,
            transaction_id = %transaction_id,
            success,
            errors,
            "Sent transaction to server"
        );
        Ok(())
    }
}
