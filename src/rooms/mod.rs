//! The rooms database: events, receipts, membership projections and the
//! super-stream, all sharing one transactional store.

pub mod events;
pub mod receipts;
pub mod send;
pub mod servers;
pub mod superstream;
pub mod sync;
pub mod users;

use std::{collections::HashMap, sync::Arc};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    authz::RoomAuthorizer,
    config::Config,
    error::{Result, RoomservError},
    keys::Subspace,
    notifier::Notifier,
    store::{Store, WriteTxn},
    types::{sort_events, Event, Memberships, Room, StateMap, VersionMap},
};

use events::{EventsDirectory, StateFilter, AUTH_CHAIN_SOFT_CAP};
use receipts::ReceiptsDirectory;
use servers::ServersDirectory;
use superstream::SuperStream;
use users::UsersDirectory;

#[derive(Clone)]
pub struct RoomsDb {
    inner: Arc<RoomsInner>,
}

struct RoomsInner {
    store: Store,
    server_name: OwnedServerName,
    notifier: Notifier,
    authorizer: Arc<dyn RoomAuthorizer>,

    events: EventsDirectory,
    users: UsersDirectory,
    servers: ServersDirectory,
    receipts: ReceiptsDirectory,
    super_stream: SuperStream,

    by_id: Subspace,
    by_alias: Subspace,
    by_public: Subspace,
    locks: Subspace,

    // Serialises writes per room inside this process. An optimisation to
    // keep store-level abort rates down; correctness belongs to the store.
    room_locks: Mutex<HashMap<OwnedRoomId, Arc<tokio::sync::Mutex<()>>>>,
}

impl RoomsDb {
    pub fn new(
        cfg: &Config,
        store: Store,
        notifier: Notifier,
        authorizer: Arc<dyn RoomAuthorizer>,
    ) -> Self {
        let root = Subspace::new(&["rooms".into()]);
        debug!(prefix = ?root.prefix(), "Init rooms directory");

        Self {
            inner: Arc::new(RoomsInner {
                server_name: cfg.server_name.clone(),
                notifier,
                authorizer,

                events: EventsDirectory::new(&root),
                users: UsersDirectory::new(&root),
                servers: ServersDirectory::new(&root),
                receipts: ReceiptsDirectory::new(&root),
                super_stream: SuperStream::new(&root, cfg.server_name.clone()),

                by_id: root.sub("id"),
                by_alias: root.sub("as"),
                by_public: root.sub("pb"),
                locks: root.sub("lck"),

                room_locks: Mutex::new(HashMap::new()),
                store,
            }),
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.store
    }

    pub(crate) fn events(&self) -> &EventsDirectory {
        &self.inner.events
    }

    pub(crate) fn users(&self) -> &UsersDirectory {
        &self.inner.users
    }

    pub(crate) fn servers(&self) -> &ServersDirectory {
        &self.inner.servers
    }

    pub(crate) fn receipts(&self) -> &ReceiptsDirectory {
        &self.inner.receipts
    }

    pub(crate) fn super_stream(&self) -> &SuperStream {
        &self.inner.super_stream
    }

    pub(crate) fn authorizer(&self) -> &dyn RoomAuthorizer {
        self.inner.authorizer.as_ref()
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn server_name(&self) -> &OwnedServerName {
        &self.inner.server_name
    }

    /// Store handle and lock keyspace for the distributed lock manager.
    pub fn lock_primitives(&self) -> (Store, Subspace) {
        (self.inner.store.clone(), self.inner.locks.clone())
    }

    pub(crate) fn room_lock(&self, room_id: &OwnedRoomId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .room_locks
            .lock()
            .entry(room_id.clone())
            .or_default()
            .clone()
    }

    /// Room ids are opaque; base64 keeps them clearly distinct strings.
    pub fn generate_room_id(&self) -> OwnedRoomId {
        let encoded = URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes());
        OwnedRoomId::try_from(format!("!{}:{}", encoded, self.inner.server_name))
            .expect("generated room id is well-formed")
    }

    // Room metadata
    //

    pub(crate) fn key_for_room(&self, room_id: &OwnedRoomId) -> Vec<u8> {
        self.inner.by_id.pack(&[room_id.as_str().into()])
    }

    pub(crate) fn key_for_alias(&self, alias: &str) -> Vec<u8> {
        self.inner.by_alias.pack(&[alias.into()])
    }

    pub(crate) fn key_for_public(&self, room_id: &OwnedRoomId) -> Vec<u8> {
        self.inner.by_public.pack(&[room_id.as_str().into()])
    }

    pub async fn get_room(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
    ) -> Result<Option<Room>> {
        let key = self.key_for_room(room_id);
        self.inner
            .store
            .read_txn(ctx, |txn| match txn.get(&key)? {
                Some(raw) => Ok(Some(Room::from_bytes(&raw, room_id.clone())?)),
                None => Ok(None),
            })
            .await
    }

    pub async fn get_room_id_for_alias(
        &self,
        ctx: &CancellationToken,
        alias: &str,
    ) -> Result<Option<OwnedRoomId>> {
        let key = self.key_for_alias(alias);
        self.inner
            .store
            .read_txn(ctx, |txn| match txn.get(&key)? {
                Some(raw) => {
                    let s = String::from_utf8(raw)
                        .map_err(|err| RoomservError::Fatal(format!("malformed alias: {err}")))?;
                    Ok(Some(OwnedRoomId::try_from(s).map_err(|err| {
                        RoomservError::Fatal(format!("malformed room id: {err}"))
                    })?))
                }
                None => Ok(None),
            })
            .await
    }

    // Event lookups
    //

    pub async fn get_event(
        &self,
        ctx: &CancellationToken,
        event_id: &OwnedEventId,
    ) -> Result<Option<Event>> {
        self.inner
            .store
            .read_txn(ctx, |txn| self.inner.events.txn_get_event(txn, event_id))
            .await
    }

    /// Whether we have (and accepted) this event.
    pub async fn does_event_exist(
        &self,
        ctx: &CancellationToken,
        event_id: &OwnedEventId,
    ) -> Result<bool> {
        self.inner
            .store
            .read_txn(ctx, |txn| self.inner.events.txn_event_exists(txn, event_id))
            .await
    }

    /// The auth chain of an event: its auth events, their auth events and so
    /// on, sorted by (depth, event_id).
    pub async fn get_event_auth_chain(
        &self,
        ctx: &CancellationToken,
        event_id: &OwnedEventId,
    ) -> Result<Vec<Event>> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                let provider = self.inner.events.provider(txn);
                let ev = provider.get(event_id)?;
                self.inner
                    .events
                    .txn_auth_chain_for_events(&[ev], &provider, AUTH_CHAIN_SOFT_CAP)
            })
            .await
    }

    pub async fn get_room_current_extremities(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
    ) -> Result<Vec<OwnedEventId>> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner.events.txn_current_room_extrem_event_ids(txn, room_id)
            })
            .await
    }

    // State lookups
    //

    pub async fn get_room_state_at_event(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
        event_id: &OwnedEventId,
    ) -> Result<StateMap> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner
                    .events
                    .txn_room_state_ids_at_event(txn, room_id, event_id, StateFilter::All)
            })
            .await
    }

    pub async fn get_room_auth_state_at_event(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
        event_id: &OwnedEventId,
    ) -> Result<StateMap> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner
                    .events
                    .txn_room_state_ids_at_event(txn, room_id, event_id, StateFilter::AuthSet)
            })
            .await
    }

    pub async fn get_room_member_state_at_event(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
        user_ids: &[OwnedUserId],
        event_id: &OwnedEventId,
    ) -> Result<StateMap> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner.events.txn_room_state_ids_at_event(
                    txn,
                    room_id,
                    event_id,
                    StateFilter::Members(user_ids),
                )
            })
            .await
    }

    /// Current state events of a room: the non-member slots plus the member
    /// mirror, sorted.
    pub async fn get_current_room_state_events(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
    ) -> Result<Vec<Event>> {
        let mut events = self
            .inner
            .store
            .read_txn(ctx, |txn| {
                let provider = self.inner.events.provider(txn);
                let state = self.inner.events.txn_current_room_state_map(txn, room_id)?;
                let members = self
                    .inner
                    .events
                    .txn_current_room_member_state_map(txn, room_id)?;

                let mut events = Vec::with_capacity(state.len() + members.len());
                for event_id in state.values().chain(members.values()) {
                    provider.will_get(event_id);
                }
                for event_id in state.values().chain(members.values()) {
                    events.push(provider.get(event_id)?);
                }
                Ok(events)
            })
            .await?;
        sort_events(&mut events);
        Ok(events)
    }

    /// Current state plus its auth chain. Split across read transactions:
    /// events are immutable, so a second transaction serves the chain
    /// without violating observer semantics while dodging the store's
    /// transaction deadline on large rooms.
    pub async fn get_current_room_state_with_auth_chain(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
    ) -> Result<(Vec<Event>, Vec<Event>)> {
        let state_events = self.get_current_room_state_events(ctx, room_id).await?;

        let seed = state_events.clone();
        let auth_chain = self
            .inner
            .store
            .read_txn(ctx, move |txn| {
                let provider = self.inner.events.provider(txn).with_events(seed.clone());
                self.inner
                    .events
                    .txn_auth_chain_for_events(&seed, &provider, AUTH_CHAIN_SOFT_CAP)
            })
            .await?;

        Ok((state_events, auth_chain))
    }

    // Server lookups
    //

    pub async fn is_server_in_room(
        &self,
        ctx: &CancellationToken,
        server: &OwnedServerName,
        room_id: &OwnedRoomId,
    ) -> Result<bool> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner.servers.txn_is_server_in_room(txn, server, room_id)
            })
            .await
    }

    pub async fn get_current_room_servers(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
    ) -> Result<Vec<OwnedServerName>> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner.events.txn_current_room_servers(txn, room_id)
            })
            .await
    }

    pub async fn get_server_memberships(
        &self,
        ctx: &CancellationToken,
        server: &OwnedServerName,
    ) -> Result<Memberships> {
        self.inner
            .store
            .read_txn(ctx, |txn| self.inner.servers.txn_lookup_memberships(txn, server))
            .await
    }

    // Federation sender positions
    //

    pub async fn get_server_names_with_positions(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Vec<OwnedServerName>> {
        self.inner
            .store
            .read_txn(ctx, |txn| {
                self.inner.servers.txn_server_names_with_positions(txn)
            })
            .await
    }

    pub async fn get_server_positions(
        &self,
        ctx: &CancellationToken,
        server: &OwnedServerName,
    ) -> Result<Option<VersionMap>> {
        self.inner
            .store
            .read_txn(ctx, |txn| self.inner.servers.txn_server_position(txn, server))
            .await
    }

    /// Persist a sender's positions. The caller-supplied check runs inside
    /// the same transaction, so a stolen sender lock aborts the update.
    pub async fn update_server_positions(
        &self,
        ctx: &CancellationToken,
        server: &OwnedServerName,
        versions: &VersionMap,
        check_lock: impl Fn(&WriteTxn<'_>) -> Result<()>,
    ) -> Result<()> {
        self.inner
            .store
            .write_txn(ctx, |txn| {
                check_lock(txn)?;
                self.inner.servers.txn_set_server_position(txn, server, versions);
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Room meta maintenance, applied by the event write path for state
    // events that won their slot.
    //

    pub(crate) fn txn_apply_state_to_room_meta(
        &self,
        txn: &WriteTxn<'_>,
        room: &mut Room,
        ev: &Event,
    ) -> Result<()> {
        match ev.kind.as_str() {
            crate::types::EVENT_TYPE_NAME => {
                room.name = content_str(ev, "name");
            }
            crate::types::EVENT_TYPE_TOPIC => {
                room.topic = content_str(ev, "topic");
            }
            crate::types::EVENT_TYPE_CANONICAL_ALIAS => {
                let alias = content_str(ev, "alias");
                if !room.canonical_alias.is_empty() && room.canonical_alias != alias {
                    txn.clear(self.key_for_alias(&room.canonical_alias));
                }
                if !alias.is_empty() {
                    txn.set(
                        self.key_for_alias(&alias),
                        room.id.as_str().as_bytes().to_vec(),
                    );
                }
                room.canonical_alias = alias;
            }
            crate::types::EVENT_TYPE_JOIN_RULES => {
                let public = content_str(ev, "join_rule") == "public";
                if public != room.public {
                    if public {
                        txn.set(self.key_for_public(&room.id), Vec::new());
                    } else {
                        txn.clear(self.key_for_public(&room.id));
                    }
                }
                room.public = public;
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn room_from_create_event(&self, ev: &Event) -> Room {
        let version = ev
            .content
            .get("room_version")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("1")
            .to_owned();
        let mut room = Room::new(ev.room_id.clone(), version);
        room.federated = ev
            .content
            .get("m.federate")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        room
    }
}

fn content_str(ev: &Event, field: &str) -> String {
    ev.content
        .get(field)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned()
}
