//! Batched write paths. A batch is one transaction: every accepted item's
//! indices, projections and stream entries land atomically, while per-item
//! rule rejections are carried in the response instead of failing the batch.

use ruma::OwnedRoomId;
use tracing::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, RoomservError},
    keys::Versionstamp,
    notifier::Change,
    types::{Event, Membership, Receipt, Room, EVENT_TYPE_CREATE},
};

use super::{servers::ServerEdge, RoomsDb};

#[derive(Debug)]
pub struct RejectedEvent {
    pub event: Event,
    pub error: RoomservError,
}

#[derive(Debug)]
pub struct SendEventsResult {
    pub allowed: Vec<Event>,
    pub rejected: Vec<RejectedEvent>,
    /// Commit version; absent when nothing was accepted.
    pub version: Option<Versionstamp>,
}

#[derive(Debug)]
pub struct RejectedReceipt {
    pub receipt: Receipt,
    pub error: RoomservError,
}

#[derive(Debug)]
pub struct SendReceiptsResult {
    pub allowed: Vec<Receipt>,
    pub rejected: Vec<RejectedReceipt>,
    pub version: Option<Versionstamp>,
}

fn is_event_rejection(err: &RoomservError) -> bool {
    matches!(
        err,
        RoomservError::AlreadyExists
            | RoomservError::AuthRejected(_)
            | RoomservError::DuplicateReaction
            | RoomservError::NotFound
    )
}

impl RoomsDb {
    /// Ingest a batch of events for one room.
    pub async fn send_events(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
        events: Vec<Event>,
    ) -> Result<SendEventsResult> {
        for ev in &events {
            if ev.room_id != *room_id {
                return Err(RoomservError::Fatal(
                    "event batch spans more than one room".into(),
                ));
            }
        }

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let ((allowed, rejected, changes), version) = self
            .store()
            .write_txn(ctx, |txn| {
                let provider = self.events().provider(txn);

                let mut room: Option<Room> = match txn.get(&self.key_for_room(room_id))? {
                    Some(raw) => Some(Room::from_bytes(&raw, room_id.clone())?),
                    None => None,
                };

                let mut allowed: Vec<Event> = Vec::with_capacity(events.len());
                let mut rejected: Vec<RejectedEvent> = Vec::new();
                let mut changes: Vec<Change> = Vec::new();

                for (i, ev) in events.iter().enumerate() {
                    let user_version = i as u16;

                    if ev.kind == EVENT_TYPE_CREATE && room.is_some() {
                        rejected.push(RejectedEvent {
                            event: ev.clone(),
                            error: RoomservError::AlreadyExists,
                        });
                        continue;
                    }
                    if room.is_none() && ev.kind != EVENT_TYPE_CREATE {
                        rejected.push(RejectedEvent {
                            event: ev.clone(),
                            error: RoomservError::NotFound,
                        });
                        continue;
                    }

                    let outcome = match self.events().txn_persist_event(
                        txn,
                        ev,
                        user_version,
                        &provider,
                        self.authorizer(),
                    ) {
                        Ok(outcome) => outcome,
                        Err(err) if is_event_rejection(&err) => {
                            rejected.push(RejectedEvent {
                                event: ev.clone(),
                                error: err,
                            });
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    let meta = match &mut room {
                        Some(meta) => meta,
                        None => room.insert(self.room_from_create_event(ev)),
                    };
                    meta.depth = meta.depth.max(ev.depth);

                    if outcome.state_won {
                        self.txn_apply_state_to_room_meta(txn, meta, ev)?;
                    }

                    if let Some(update) = &outcome.membership {
                        self.users().txn_update_membership(
                            txn,
                            &update.user_id,
                            room_id,
                            &ev.id,
                            update.membership,
                            user_version,
                        )?;

                        match (update.prev_membership, update.membership) {
                            (prev, Membership::Join) if prev != Some(Membership::Join) => {
                                meta.member_count += 1;
                            }
                            (Some(Membership::Join), now) if now != Membership::Join => {
                                meta.member_count = (meta.member_count - 1).max(0);
                            }
                            _ => {}
                        }

                        let edge = self.servers().txn_track_membership(
                            txn,
                            room_id,
                            &update.user_id,
                            update.membership,
                            update.prev_membership,
                            user_version,
                        )?;
                        match edge {
                            Some(ServerEdge::Joined) => {
                                let server = update.user_id.server_name().to_owned();
                                self.events().txn_set_current_room_server(
                                    txn, room_id, &server, &ev.id,
                                );
                                if server != *self.server_name() {
                                    changes.push(Change::for_server(server));
                                }
                            }
                            Some(ServerEdge::Parted) => {
                                let server = update.user_id.server_name().to_owned();
                                self.events()
                                    .txn_clear_current_room_server(txn, room_id, &server);
                            }
                            None => {}
                        }

                        changes.push(Change::for_user_in_room(
                            update.user_id.clone(),
                            room_id.clone(),
                        ));
                    }

                    self.super_stream()
                        .txn_add_event(txn, ev, Versionstamp::incomplete(user_version))?;

                    changes.push(Change::for_user_in_room(ev.sender.clone(), room_id.clone()));
                    allowed.push(ev.clone());
                }

                if let Some(meta) = &room {
                    if !allowed.is_empty() {
                        txn.set(self.key_for_room(room_id), meta.to_bytes()?);
                    }
                }

                Ok((allowed, rejected, changes))
            })
            .await?;

        for change in changes {
            self.notifier().send_change(change);
        }
        for rejection in &rejected {
            warn!(
                room_id = %room_id,
                event_id = %rejection.event.id,
                error = %rejection.error,
                "Event rejected"
            );
        }
        info!(
            room_id = %room_id,
            allowed = allowed.len(),
            rejected = rejected.len(),
            version = %version,
            "Sent events"
        );

        let version = (!allowed.is_empty()).then_some(version);
        Ok(SendEventsResult {
            allowed,
            rejected,
            version,
        })
    }

    /// Ingest a batch of receipts for one room.
    pub async fn send_receipts(
        &self,
        ctx: &CancellationToken,
        room_id: &OwnedRoomId,
        receipts: Vec<Receipt>,
    ) -> Result<SendReceiptsResult> {
        for rc in &receipts {
            if rc.room_id != *room_id {
                return Err(RoomservError::Fatal(
                    "receipt batch spans more than one room".into(),
                ));
            }
        }

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let ((allowed, rejected, changes), version) = self
            .store()
            .write_txn(ctx, |txn| {
                let provider = self.events().provider(txn);

                let mut allowed: Vec<Receipt> = Vec::with_capacity(receipts.len());
                let mut rejected: Vec<RejectedReceipt> = Vec::new();
                let mut changes: Vec<Change> = Vec::new();

                for (i, rc) in receipts.iter().enumerate() {
                    if !self.users().txn_is_user_in_room(txn, &rc.user_id, room_id)? {
                        rejected.push(RejectedReceipt {
                            receipt: rc.clone(),
                            error: RoomservError::UserNotInRoom,
                        });
                        continue;
                    }

                    // A local user can only know events we know; remote
                    // receipts may reference events not yet backfilled.
                    if rc.user_id.server_name() == self.server_name() {
                        match provider.get(&rc.event_id) {
                            Ok(_) => {}
                            Err(RoomservError::EventNotFound) => {
                                rejected.push(RejectedReceipt {
                                    receipt: rc.clone(),
                                    error: RoomservError::EventNotFound,
                                });
                                continue;
                            }
                            Err(err) => return Err(err),
                        }
                    }

                    self.receipts().txn_set_receipt(txn, rc);
                    self.super_stream()
                        .txn_add_receipt(txn, rc, Versionstamp::incomplete(i as u16))?;

                    changes.push(Change::for_user_in_room(rc.user_id.clone(), room_id.clone()));
                    allowed.push(rc.clone());
                }

                Ok((allowed, rejected, changes))
            })
            .await?;

        for change in changes {
            self.notifier().send_change(change);
        }
        for rejection in &rejected {
            warn!(
                room_id = %room_id,
                user_id = %rejection.receipt.user_id,
                error = %rejection.error,
                "Receipt rejected"
            );
        }
        info!(
            room_id = %room_id,
            allowed = allowed.len(),
            rejected = rejected.len(),
            "Sent receipts"
        );

        let version = (!allowed.is_empty()).then_some(version);
        Ok(SendReceiptsResult {
            allowed,
            rejected,
            version,
        })
    }
}
