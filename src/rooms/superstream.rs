//! The per-room super-stream: events and receipt updates merged into one
//! versionstamp-ordered change log, plus the local-origin mirror that drives
//! outgoing federation.

use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId};

use crate::{
    error::{Result, RoomservError},
    keys::{
        self, versionstamp_value, Element, Subspace, Versionstamp, VERSIONSTAMP_VALUE_OFFSET,
    },
    store::{RangeOptions, TxnRead, WriteTxn},
    types::{Event, Receipt},
};

const KIND_EVENT: &str = "ev";
const KIND_RECEIPT: &str = "rc";

/// One item of a room's super-stream with the version it occurred at.
#[derive(Debug, Clone)]
pub enum SuperStreamItem {
    Event {
        version: Versionstamp,
        room_id: OwnedRoomId,
        event_id: OwnedEventId,
    },
    Receipt {
        version: Versionstamp,
        receipt: Receipt,
    },
}

impl SuperStreamItem {
    pub fn version(&self) -> Versionstamp {
        match self {
            SuperStreamItem::Event { version, .. } => *version,
            SuperStreamItem::Receipt { version, .. } => *version,
        }
    }

    pub fn room_id(&self) -> &OwnedRoomId {
        match self {
            SuperStreamItem::Event { room_id, .. } => room_id,
            SuperStreamItem::Receipt { receipt, .. } => &receipt.room_id,
        }
    }

    /// Deterministic order for merged sync output: version first, then
    /// (room, id) as the tie-break inside one commit.
    pub fn sort_key(&self) -> (Versionstamp, String, String) {
        match self {
            SuperStreamItem::Event {
                version,
                room_id,
                event_id,
            } => (*version, room_id.to_string(), event_id.to_string()),
            SuperStreamItem::Receipt { version, receipt } => (
                *version,
                receipt.room_id.to_string(),
                receipt.event_id.to_string(),
            ),
        }
    }
}

pub struct SuperStream {
    main: Subspace,
    local: Subspace,
    receipt_versions: Subspace,
    local_server: OwnedServerName,
}

impl SuperStream {
    pub fn new(parent: &Subspace, local_server: OwnedServerName) -> Self {
        Self {
            main: parent.sub("ss"),
            local: parent.sub("ls"),
            receipt_versions: parent.sub("ssrv"),
            local_server,
        }
    }

    fn key_for_room(
        &self,
        stream: &Subspace,
        room_id: &OwnedRoomId,
        version: Versionstamp,
    ) -> Result<(Vec<u8>, usize)> {
        stream.pack_with_versionstamp(&[room_id.as_str().into(), Element::Version(version)])
    }

    fn complete_key_for_room(
        &self,
        stream: &Subspace,
        room_id: &OwnedRoomId,
        version: Versionstamp,
    ) -> Vec<u8> {
        stream.pack(&[room_id.as_str().into(), Element::Version(version)])
    }

    fn key_for_receipt_version(&self, rc: &Receipt) -> Vec<u8> {
        self.receipt_versions.pack(&[
            rc.room_id.as_str().into(),
            rc.user_id.as_str().into(),
            rc.kind.as_str().into(),
            rc.thread_id.as_str().into(),
        ])
    }

    /// Append an event insert. Locally-originated events mirror into the
    /// local stream for outgoing federation.
    pub fn txn_add_event(
        &self,
        txn: &WriteTxn<'_>,
        ev: &Event,
        version: Versionstamp,
    ) -> Result<()> {
        let value = keys::pack(&[KIND_EVENT.into(), ev.id.as_str().into()]);

        let (key, offset) = self.key_for_room(&self.main, &ev.room_id, version)?;
        txn.set_versionstamped_key(key, offset, value.clone())?;

        if ev.sender.server_name() == self.local_server {
            let (key, offset) = self.key_for_room(&self.local, &ev.room_id, version)?;
            txn.set_versionstamped_key(key, offset, value)?;
        }
        Ok(())
    }

    /// Append a receipt update, clearing the prior stream entries for the
    /// same (room, user, type, thread) first so the current entry is unique.
    pub fn txn_add_receipt(
        &self,
        txn: &WriteTxn<'_>,
        rc: &Receipt,
        version: Versionstamp,
    ) -> Result<()> {
        let value = keys::pack(&[
            KIND_RECEIPT.into(),
            rc.user_id.as_str().into(),
            rc.event_id.as_str().into(),
            rc.thread_id.as_str().into(),
            rc.kind.as_str().into(),
            rc.data.clone().into(),
        ]);

        let (key, offset) = self.key_for_room(&self.main, &rc.room_id, version)?;
        txn.set_versionstamped_key(key, offset, value.clone())?;

        if rc.user_id.server_name() == self.local_server {
            let (key, offset) = self.key_for_room(&self.local, &rc.room_id, version)?;
            txn.set_versionstamped_key(key, offset, value)?;
        }

        // Dedup is symmetric: clear the prior entry from both streams
        // regardless of origin.
        if let Some(raw) = txn.get(&self.key_for_receipt_version(rc))? {
            let prior = keys::value_to_versionstamp(&raw)?;
            txn.clear(self.complete_key_for_room(&self.main, &rc.room_id, prior));
            txn.clear(self.complete_key_for_room(&self.local, &rc.room_id, prior));
        }

        txn.set_versionstamped_value(
            self.key_for_receipt_version(rc),
            versionstamp_value(version),
            VERSIONSTAMP_VALUE_OFFSET,
        )?;
        Ok(())
    }

    pub fn txn_paginate_room(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
    ) -> Result<Vec<SuperStreamItem>> {
        self.paginate(txn, &self.main, room_id, from, to, limit)
    }

    /// The local-origin subset, used to "sync" a federated server.
    pub fn txn_paginate_room_local(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
    ) -> Result<Vec<SuperStreamItem>> {
        self.paginate(txn, &self.local, room_id, from, to, limit)
    }

    /// The newest items of a room's stream in ascending order; feeds the
    /// initial-sync timeline.
    pub fn txn_recent_room_items(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
        limit: usize,
    ) -> Result<Vec<SuperStreamItem>> {
        let (begin, end) = self.main.version_range(
            &[room_id.as_str().into()],
            crate::keys::ZERO_VERSIONSTAMP,
            crate::keys::ZERO_VERSIONSTAMP,
        );
        let kvs = txn.get_range(
            &begin,
            &end,
            RangeOptions {
                limit: Some(limit),
                reverse: true,
            },
        )?;

        let mut items = Vec::with_capacity(kvs.len());
        for (key, value) in kvs.into_iter().rev() {
            let elems = self.main.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed super-stream key".into()));
            }
            let version = keys::element_version(&elems[1])?;
            items.push(decode_item(room_id, version, &value)?);
        }
        Ok(items)
    }

    fn paginate(
        &self,
        txn: &impl TxnRead,
        stream: &Subspace,
        room_id: &OwnedRoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
    ) -> Result<Vec<SuperStreamItem>> {
        let (begin, end) = stream.version_range(&[room_id.as_str().into()], from, to);
        let kvs = txn.get_range(&begin, &end, RangeOptions::limited(limit))?;

        let mut items = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            let elems = stream.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed super-stream key".into()));
            }
            let version = keys::element_version(&elems[1])?;
            items.push(decode_item(room_id, version, &value)?);
        }
        Ok(items)
    }
}

impl super::RoomsDb {
    /// Paginate a room's super-stream: exclusive on `from`, bounded by `to`
    /// (zero sentinels expand to the whole stream).
    pub async fn get_room_super_stream(
        &self,
        ctx: &tokio_util::sync::CancellationToken,
        room_id: &OwnedRoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
    ) -> Result<Vec<SuperStreamItem>> {
        self.store()
            .read_txn(ctx, |txn| {
                self.super_stream()
                    .txn_paginate_room(txn, room_id, from, to, limit)
            })
            .await
    }

    /// The local-origin subset of a room's super-stream.
    pub async fn get_room_local_super_stream(
        &self,
        ctx: &tokio_util::sync::CancellationToken,
        room_id: &OwnedRoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
    ) -> Result<Vec<SuperStreamItem>> {
        self.store()
            .read_txn(ctx, |txn| {
                self.super_stream()
                    .txn_paginate_room_local(txn, room_id, from, to, limit)
            })
            .await
    }
}

fn decode_item(
    room_id: &OwnedRoomId,
    version: Versionstamp,
    value: &[u8],
) -> Result<SuperStreamItem> {
    let elems = keys::unpack(value)?;
    let kind = keys::element_str(
        elems
            .first()
            .ok_or_else(|| RoomservError::Fatal("empty super-stream value".into()))?,
    )?;

    match kind {
        KIND_EVENT => {
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed event stream value".into()));
            }
            Ok(SuperStreamItem::Event {
                version,
                room_id: room_id.clone(),
                event_id: OwnedEventId::try_from(keys::element_str(&elems[1])?)
                    .map_err(|err| RoomservError::Fatal(format!("malformed event id: {err}")))?,
            })
        }
        KIND_RECEIPT => {
            if elems.len() != 6 {
                return Err(RoomservError::Fatal(
                    "malformed receipt stream value".into(),
                ));
            }
            Ok(SuperStreamItem::Receipt {
                version,
                receipt: Receipt {
                    room_id: room_id.clone(),
                    user_id: OwnedUserId::try_from(keys::element_str(&elems[1])?)
                        .map_err(|err| RoomservError::Fatal(format!("malformed user id: {err}")))?,
                    event_id: OwnedEventId::try_from(keys::element_str(&elems[2])?)
                        .map_err(|err| {
                            RoomservError::Fatal(format!("malformed event id: {err}"))
                        })?,
                    thread_id: keys::element_str(&elems[3])?.to_owned(),
                    kind: keys::element_str(&elems[4])?.to_owned(),
                    data: keys::element_bytes(&elems[5])?.to_vec(),
                },
            })
        }
        other => Err(RoomservError::Fatal(format!(
            "unknown super-stream item kind {other:?}"
        ))),
    }
}
