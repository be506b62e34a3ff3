//! Per-server membership projection and federation sender positions.
//!
//! A server is "in" a room while it has at least one joined member there.
//! The joined-member index drives the 0→1 / 1→0 edge detection; only join
//! edges matter for cross-server fan-out.

use ruma::{OwnedRoomId, OwnedServerName, OwnedUserId};
use tracing::trace;

use crate::{
    error::{Result, RoomservError},
    keys::{self, Element, Subspace, Versionstamp},
    store::{RangeOptions, TxnRead, WriteTxn},
    types::{Membership, MembershipChange, MembershipTup, Memberships, VersionMap},
};

pub struct ServersDirectory {
    joined_members: Subspace,
    memberships: Subspace,
    membership_changes: Subspace,
    id_to_position: Subspace,
}

/// Edge produced by a membership transition, to be mirrored into the events
/// directory's current-servers index by the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEdge {
    Joined,
    Parted,
}

impl ServersDirectory {
    pub fn new(parent: &Subspace) -> Self {
        let dir = parent.sub("servers");
        trace!(prefix = ?dir.prefix(), "Init rooms/servers directory");

        Self {
            joined_members: dir.sub("jme"),
            memberships: dir.sub("mem"),
            membership_changes: dir.sub("mch"),
            id_to_position: dir.sub("itt"),
        }
    }

    fn key_for_joined_member(
        &self,
        room_id: &OwnedRoomId,
        server: &OwnedServerName,
        user_id: &OwnedUserId,
    ) -> Vec<u8> {
        self.joined_members.pack(&[
            room_id.as_str().into(),
            server.as_str().into(),
            user_id.as_str().into(),
        ])
    }

    fn key_for_membership(&self, server: &OwnedServerName, room_id: &OwnedRoomId) -> Vec<u8> {
        self.memberships
            .pack(&[server.as_str().into(), room_id.as_str().into()])
    }

    fn txn_joined_member_count(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
        server: &OwnedServerName,
    ) -> Result<usize> {
        let (begin, end) = self
            .joined_members
            .range_of(&[room_id.as_str().into(), server.as_str().into()]);
        Ok(txn.get_range(&begin, &end, RangeOptions::default())?.len())
    }

    /// Track a user's membership transition for their server. Returns the
    /// 0→1 or 1→0 edge when one occurred; those append to the change log.
    pub fn txn_track_membership(
        &self,
        txn: &WriteTxn<'_>,
        room_id: &OwnedRoomId,
        user_id: &OwnedUserId,
        membership: Membership,
        prev_membership: Option<Membership>,
        user_version: u16,
    ) -> Result<Option<ServerEdge>> {
        let server = user_id.server_name().to_owned();
        let was_joined = prev_membership == Some(Membership::Join);
        let is_joined = membership == Membership::Join;
        if was_joined == is_joined {
            return Ok(None);
        }

        let count_before = self.txn_joined_member_count(txn, room_id, &server)?;
        let member_key = self.key_for_joined_member(room_id, &server, user_id);

        if is_joined {
            txn.set(member_key, Vec::new());
            if count_before == 0 {
                txn.set(self.key_for_membership(&server, room_id), Vec::new());
                self.txn_append_membership_change(
                    txn,
                    &server,
                    room_id,
                    Membership::Join,
                    user_version,
                )?;
                return Ok(Some(ServerEdge::Joined));
            }
        } else {
            txn.clear(member_key);
            if count_before == 1 {
                txn.clear(self.key_for_membership(&server, room_id));
                self.txn_append_membership_change(
                    txn,
                    &server,
                    room_id,
                    Membership::Leave,
                    user_version,
                )?;
                return Ok(Some(ServerEdge::Parted));
            }
        }
        Ok(None)
    }

    fn txn_append_membership_change(
        &self,
        txn: &WriteTxn<'_>,
        server: &OwnedServerName,
        room_id: &OwnedRoomId,
        membership: Membership,
        user_version: u16,
    ) -> Result<()> {
        let (key, offset) = self.membership_changes.pack_with_versionstamp(&[
            server.as_str().into(),
            Element::Version(Versionstamp::incomplete(user_version)),
        ])?;
        txn.set_versionstamped_key(
            key,
            offset,
            keys::pack(&[room_id.as_str().into(), membership.as_str().into()]),
        )?;
        Ok(())
    }

    pub fn txn_is_server_in_room(
        &self,
        txn: &impl TxnRead,
        server: &OwnedServerName,
        room_id: &OwnedRoomId,
    ) -> Result<bool> {
        Ok(txn.get(&self.key_for_membership(server, room_id))?.is_some())
    }

    /// The rooms a server currently participates in. Only joined rooms are
    /// tracked, so every tup carries join.
    pub fn txn_lookup_memberships(
        &self,
        txn: &impl TxnRead,
        server: &OwnedServerName,
    ) -> Result<Memberships> {
        let (begin, end) = self.memberships.range_of(&[server.as_str().into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;

        let mut memberships = Memberships::with_capacity(kvs.len());
        for (key, _) in kvs {
            let elems = self.memberships.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed server membership key".into()));
            }
            let room_id = OwnedRoomId::try_from(keys::element_str(&elems[1])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed room id: {err}")))?;
            memberships.insert(
                room_id.clone(),
                MembershipTup {
                    room_id,
                    event_id: None,
                    membership: Membership::Join,
                },
            );
        }
        Ok(memberships)
    }

    pub fn txn_lookup_membership_changes(
        &self,
        txn: &impl TxnRead,
        server: &OwnedServerName,
        from: Versionstamp,
        to: Versionstamp,
    ) -> Result<Vec<MembershipChange>> {
        let (begin, end) = self
            .membership_changes
            .version_range(&[server.as_str().into()], from, to);
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

    // Federation sender positions
    //

    fn key_for_position(&self, server: &OwnedServerName) -> Vec<u8> {
        self.id_to_position.pack(&[server.as_str().into()])
    }

    pub fn txn_server_position(
        &self,
        txn: &impl TxnRead,
        server: &OwnedServerName,
    ) -> Result<Option<VersionMap>> {
        match txn.get(&self.key_for_position(server))? {
            Some(raw) => Ok(Some(VersionMap::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn txn_set_server_position(
        &self,
        txn: &WriteTxn<'_>,
        server: &OwnedServerName,
        versions: &VersionMap,
    ) {
        txn.set(self.key_for_position(server), versions.to_bytes());
    }

    pub fn txn_server_names_with_positions(
        &self,
        txn: &impl TxnRead,
    ) -> Result<Vec<OwnedServerName>> {
        let (begin, end) = self.id_to_position.range();
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;
        let mut names = Vec::with_capacity(kvs.len());
        for (key, _) in kvs {
            let elems = self.id_to_position.unpack(&key)?;
            if elems.len() != 1 {
                return Err(RoomservError::Fatal("malformed position key".into()));
            }
            let server = OwnedServerName::try_from(keys::element_str(&elems[0])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed server name: {err}")))?;
            names.push(server);
        }
        Ok(names)
    }
}
