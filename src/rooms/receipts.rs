//! Receipts directory: the current read receipt per (room, type, thread,
//! user). Stream-side dedup lives in the super-stream.

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use tracing::trace;

use crate::{
    error::{Result, RoomservError},
    keys::{self, Subspace},
    store::{RangeOptions, TxnRead, WriteTxn},
    types::Receipt,
};

pub struct ReceiptsDirectory {
    by_room_type_thread: Subspace,
}

impl ReceiptsDirectory {
    pub fn new(parent: &Subspace) -> Self {
        let dir = parent.sub("receipts");
        trace!(prefix = ?dir.prefix(), "Init rooms/receipts directory");

        Self {
            by_room_type_thread: dir.sub("rt"),
        }
    }

    fn key_for_receipt(&self, rc: &Receipt) -> Vec<u8> {
        self.by_room_type_thread.pack(&[
            rc.room_id.as_str().into(),
            rc.kind.as_str().into(),
            rc.thread_id.as_str().into(),
            rc.user_id.as_str().into(),
        ])
    }

    pub fn txn_set_receipt(&self, txn: &WriteTxn<'_>, rc: &Receipt) {
        txn.set(
            self.key_for_receipt(rc),
            keys::pack(&[rc.event_id.as_str().into(), rc.data.clone().into()]),
        );
    }

    fn receipt_from_kv(&self, key: &[u8], value: &[u8]) -> Result<Receipt> {
        let key_elems = self.by_room_type_thread.unpack(key)?;
        if key_elems.len() != 4 {
            return Err(RoomservError::Fatal("malformed receipt key".into()));
        }
        let value_elems = keys::unpack(value)?;
        if value_elems.len() != 2 {
            return Err(RoomservError::Fatal("malformed receipt value".into()));
        }

        Ok(Receipt {
            room_id: OwnedRoomId::try_from(keys::element_str(&key_elems[0])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed room id: {err}")))?,
            kind: keys::element_str(&key_elems[1])?.to_owned(),
            thread_id: keys::element_str(&key_elems[2])?.to_owned(),
            user_id: OwnedUserId::try_from(keys::element_str(&key_elems[3])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed user id: {err}")))?,
            event_id: OwnedEventId::try_from(keys::element_str(&value_elems[0])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed event id: {err}")))?,
            data: keys::element_bytes(&value_elems[1])?.to_vec(),
        })
    }

    /// All current receipts of one type in a room; feeds initial sync.
    pub fn txn_current_receipts_for_room(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
        kind: &str,
    ) -> Result<Vec<Receipt>> {
        let (begin, end) = self
            .by_room_type_thread
            .range_of(&[room_id.as_str().into(), kind.into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;

        let mut receipts = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            receipts.push(self.receipt_from_kv(&key, &value)?);
        }
        Ok(receipts)
    }
}
