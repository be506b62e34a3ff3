//! Sync engine: initial and incremental fan-in across a subject's rooms.
//!
//! Incremental sync snapshots the subject's memberships and the latest
//! committed version, windows each room by the subject's join/leave changes,
//! paginates every room's super-stream concurrently, merges by version and
//! fetches the referenced bodies in a second transaction. Events are
//! immutable, so the split does not violate observer semantics while it keeps
//! each transaction inside the store deadline.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ruma::{OwnedRoomId, OwnedServerName, OwnedUserId};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{Result, RoomservError},
    keys::Versionstamp,
    types::{
        Membership, MembershipChange, MembershipTup, Memberships, SyncRoom, RECEIPT_TYPE_READ,
    },
};

use super::{superstream::SuperStreamItem, RoomsDb};

/// How much recent timeline an initial sync carries per room.
const INIT_TIMELINE_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Position to return items strictly after.
    pub from: Versionstamp,
    pub limit: usize,
}

#[derive(Clone)]
enum Subject {
    User(OwnedUserId),
    Server(OwnedServerName),
}

pub type SyncRooms = HashMap<MembershipTup, SyncRoom>;

impl RoomsDb {
    /// Incremental sync for a local client.
    pub async fn sync_rooms_for_user(
        &self,
        ctx: &CancellationToken,
        user_id: &OwnedUserId,
        options: SyncOptions,
    ) -> Result<(Versionstamp, SyncRooms)> {
        self.sync_rooms(ctx, Subject::User(user_id.clone()), options)
            .await
    }

    /// Incremental sync for a remote server: the local-origin stream only.
    pub async fn sync_rooms_for_server(
        &self,
        ctx: &CancellationToken,
        server: &OwnedServerName,
        options: SyncOptions,
    ) -> Result<(Versionstamp, SyncRooms)> {
        self.sync_rooms(ctx, Subject::Server(server.clone()), options)
            .await
    }

    async fn sync_rooms(
        &self,
        ctx: &CancellationToken,
        subject: Subject,
        options: SyncOptions,
    ) -> Result<(Versionstamp, SyncRooms)> {
        // Range starts are inclusive; bump to get items strictly after the
        // cursor.
        let from = options.from.next_user();

        // Memberships and the latest version come from one snapshot, so the
        // membership set is valid at that version and each room can be read
        // up to it.
        let mut latest = Versionstamp::default();
        let memberships: Memberships = {
            let subject = subject.clone();
            self.store()
                .read_txn(ctx, |txn| {
                    latest = self.store().txn_latest_write_version(txn)?;
                    match &subject {
                        Subject::User(user_id) => self.users().txn_lookup_memberships(txn, user_id),
                        Subject::Server(server) => {
                            self.servers().txn_lookup_memberships(txn, server)
                        }
                    }
                })
                .await?
        };

        let changes: Vec<MembershipChange> = {
            let subject = subject.clone();
            self.store()
                .read_txn(ctx, |txn| match &subject {
                    Subject::User(user_id) => self
                        .users()
                        .txn_lookup_membership_changes(txn, user_id, from, latest),
                    Subject::Server(server) => self.servers().txn_lookup_membership_changes(
                        txn,
                        server,
                        from,
                        Versionstamp::default(),
                    ),
                })
                .await?
        };

        // Effective per-room windows: a join raises the floor to the join
        // version, any non-join caps the ceiling at the change version.
        let mut windows: HashMap<OwnedRoomId, (Versionstamp, Versionstamp)> = memberships
            .keys()
            .map(|room_id| (room_id.clone(), (from, latest)))
            .collect();
        for change in changes {
            let window = windows
                .entry(change.room_id.clone())
                .or_insert((from, latest));
            match change.membership {
                Membership::Join => window.0 = change.version,
                _ => window.1 = change.version,
            }
        }

        // Fan out one pagination task per room, all sharing a child token so
        // the first failure cancels the siblings.
        let child = ctx.child_token();
        let mut tasks: JoinSet<Result<Vec<SuperStreamItem>>> = JoinSet::new();
        for (room_id, (win_from, win_to)) in windows {
            let db = self.clone();
            let subject = subject.clone();
            let child = child.clone();
            let limit = options.limit;
            tasks.spawn(async move {
                debug!(
                    room_id = %room_id,
                    from = %win_from,
                    to = %win_to,
                    "Paginating room super stream"
                );
                db.store()
                    .read_txn(&child, |txn| match &subject {
                        Subject::User(_) => db
                            .super_stream()
                            .txn_paginate_room(txn, &room_id, win_from, win_to, limit),
                        Subject::Server(_) => db
                            .super_stream()
                            .txn_paginate_room_local(txn, &room_id, win_from, win_to, limit),
                    })
                    .await
            });
        }

        let mut all_items: Vec<SuperStreamItem> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(items)) => all_items.extend(items),
                Ok(Err(err)) => {
                    child.cancel();
                    return Err(err);
                }
                Err(err) => {
                    child.cancel();
                    return Err(RoomservError::Fatal(format!("sync task panicked: {err}")));
                }
            }
        }

        // Single version-ordered stream across rooms, truncated to the
        // limit. A full batch moves the cursor to its last item instead of
        // the snapshot head so nothing is skipped.
        all_items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        all_items.truncate(options.limit);
        let next = if all_items.len() == options.limit {
            all_items
                .last()
                .map(SuperStreamItem::version)
                .unwrap_or(latest)
        } else {
            latest
        };

        // Second transaction: batch-fetch the referenced bodies and
        // assemble per-room output.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let rooms = self
            .store()
            .read_txn(ctx, |txn| {
                let provider = self.events().provider(txn);
                for item in &all_items {
                    if let SuperStreamItem::Event { event_id, .. } = item {
                        provider.will_get(event_id);
                    }
                }

                let mut rooms: SyncRooms = HashMap::new();
                for item in &all_items {
                    let Some(tup) = memberships.get(item.room_id()) else {
                        continue;
                    };
                    let room = rooms.entry(tup.clone()).or_default();
                    match item {
                        SuperStreamItem::Receipt { receipt, .. } => {
                            room.receipts.push(receipt.clone());
                        }
                        SuperStreamItem::Event {
                            version, event_id, ..
                        } => {
                            let mut ev = provider.get(event_id)?;
                            ev.unsigned = Some(json!({
                                "age": now_ms - ev.origin_server_ts,
                                "hs.order": URL_SAFE_NO_PAD.encode(version.bytes()),
                            }));
                            if ev.is_state() {
                                room.state_events.push(ev);
                            } else {
                                room.timeline_events.push(ev);
                            }
                        }
                    }
                }
                Ok(rooms)
            })
            .await?;

        Ok((next, rooms))
    }

    /// Initial sync: each current room's resolved state plus its current
    /// read receipts. Returns the snapshot head so the next incremental
    /// sync picks up from there; state written while we assemble may be
    /// re-delivered, which is harmless.
    pub async fn init_rooms_for_user(
        &self,
        ctx: &CancellationToken,
        user_id: &OwnedUserId,
    ) -> Result<(Versionstamp, SyncRooms)> {
        let mut latest = Versionstamp::default();
        let memberships: Memberships = {
            let user_id = user_id.clone();
            self.store()
                .read_txn(ctx, |txn| {
                    latest = self.store().txn_latest_write_version(txn)?;
                    self.users().txn_lookup_memberships(txn, &user_id)
                })
                .await?
        };

        let child = ctx.child_token();
        let mut tasks: JoinSet<Result<(MembershipTup, SyncRoom)>> = JoinSet::new();
        for (room_id, tup) in memberships {
            let db = self.clone();
            let child = child.clone();
            tasks.spawn(async move {
                let state_events = db.get_current_room_state_events(&child, &room_id).await?;

                // Receipts and the recent timeline may be slightly ahead of
                // the state snapshot since these are separate transactions;
                // the incremental cursor makes re-delivery harmless.
                let receipts = db
                    .store()
                    .read_txn(&child, |txn| {
                        db.receipts()
                            .txn_current_receipts_for_room(txn, &room_id, RECEIPT_TYPE_READ)
                    })
                    .await?;
                let timeline_events = db
                    .store()
                    .read_txn(&child, |txn| {
                        let items = db.super_stream().txn_recent_room_items(
                            txn,
                            &room_id,
                            INIT_TIMELINE_LIMIT,
                        )?;
                        let provider = db.events().provider(txn);
                        let mut timeline = Vec::new();
                        for item in items {
                            if let SuperStreamItem::Event { event_id, .. } = item {
                                let ev = provider.get(&event_id)?;
                                if !ev.is_state() {
                                    timeline.push(ev);
                                }
                            }
                        }
                        Ok(timeline)
                    })
                    .await?;

                Ok((
                    tup,
                    SyncRoom {
                        state_events,
                        timeline_events,
                        receipts,
                    },
                ))
            });
        }

        let mut rooms: SyncRooms = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((tup, room))) => {
                    rooms.insert(tup, room);
                }
                Ok(Err(err)) => {
                    child.cancel();
                    return Err(err);
                }
                Err(err) => {
                    child.cancel();
                    return Err(RoomservError::Fatal(format!("sync task panicked: {err}")));
                }
            }
        }

        Ok((latest, rooms))
    }
}
