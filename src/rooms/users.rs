//! Per-user membership projection: the rooms a user is currently in, plus an
//! append-only change log driving incremental sync windows.

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use tracing::trace;

use crate::{
    error::{Result, RoomservError},
    keys::{self, Element, Subspace, Versionstamp},
    store::{RangeOptions, TxnRead, WriteTxn},
    types::{Membership, MembershipChange, MembershipTup, Memberships},
};

use super::events::{membership_value, parse_membership_value};

pub struct UsersDirectory {
    memberships: Subspace,
    membership_changes: Subspace,
}

impl UsersDirectory {
    pub fn new(parent: &Subspace) -> Self {
        let dir = parent.sub("users");
        trace!(prefix = ?dir.prefix(), "Init rooms/users directory");

        Self {
            memberships: dir.sub("mem"),
            membership_changes: dir.sub("mch"),
        }
    }

    fn key_for_membership(&self, user_id: &OwnedUserId, room_id: &OwnedRoomId) -> Vec<u8> {
        self.memberships
            .pack(&[user_id.as_str().into(), room_id.as_str().into()])
    }

    /// Upsert the current membership and append to the change log, inside
    /// the transaction that persists the member event.
    pub fn txn_update_membership(
        &self,
        txn: &WriteTxn<'_>,
        user_id: &OwnedUserId,
        room_id: &OwnedRoomId,
        event_id: &OwnedEventId,
        membership: Membership,
        user_version: u16,
    ) -> Result<()> {
        txn.set(
            self.key_for_membership(user_id, room_id),
            membership_value(event_id, membership),
        );

        let (key, offset) = self.membership_changes.pack_with_versionstamp(&[
            user_id.as_str().into(),
            Element::Version(Versionstamp::incomplete(user_version)),
        ])?;
        txn.set_versionstamped_key(
            key,
            offset,
            keys::pack(&[room_id.as_str().into(), membership.as_str().into()]),
        )?;
        Ok(())
    }

    pub fn txn_lookup_membership(
        &self,
        txn: &impl TxnRead,
        user_id: &OwnedUserId,
        room_id: &OwnedRoomId,
    ) -> Result<Option<(OwnedEventId, Membership)>> {
        match txn.get(&self.key_for_membership(user_id, room_id))? {
            Some(raw) => Ok(Some(parse_membership_value(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn txn_is_user_in_room(
        &self,
        txn: &impl TxnRead,
        user_id: &OwnedUserId,
        room_id: &OwnedRoomId,
    ) -> Result<bool> {
        Ok(matches!(
            self.txn_lookup_membership(txn, user_id, room_id)?,
            Some((_, Membership::Join))
        ))
    }

    pub fn txn_lookup_memberships(
        &self,
        txn: &impl TxnRead,
        user_id: &OwnedUserId,
    ) -> Result<Memberships> {
        let (begin, end) = self.memberships.range_of(&[user_id.as_str().into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;

        let mut memberships = Memberships::with_capacity(kvs.len());
        for (key, value) in kvs {
            let elems = self.memberships.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed membership key".into()));
            }
            let room_id = OwnedRoomId::try_from(keys::element_str(&elems[1])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed room id: {err}")))?;
            let (event_id, membership) = parse_membership_value(&value)?;
            memberships.insert(
                room_id.clone(),
                MembershipTup {
                    room_id,
                    event_id: Some(event_id),
                    membership,
                },
            );
        }
        Ok(memberships)
    }

    /// Change log entries in `(from, to]`-style version bounds (the caller
    /// pre-bumps `from`; a zero `to` scans to the end of the log).
    pub fn txn_lookup_membership_changes(
        &self,
        txn: &impl TxnRead,
        user_id: &OwnedUserId,
        from: Versionstamp,
        to: Versionstamp,
    ) -> Result<Vec<MembershipChange>> {
        let (begin, end) =
            self.membership_changes
                .version_range(&[user_id.as_str().into()], from, to);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;

        let mut changes = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            let elems = self.membership_changes.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed change key".into()));
            }
            let version = keys::element_version(&elems[1])?;

            let value_elems = keys::unpack(&value)?;
            if value_elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed change value".into()));
            }
            let room_id = OwnedRoomId::try_from(keys::element_str(&value_elems[0])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed room id: {err}")))?;
            let membership = Membership::parse(keys::element_str(&value_elems[1])?)
                .ok_or_else(|| RoomservError::Fatal("unknown membership".into()))?;

            changes.push(MembershipChange {
                room_id,
                membership,
                version,
            });
        }
        Ok(changes)
    }
}
