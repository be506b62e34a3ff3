//! Domain types shared across the rooms database, sync engine and workers.

mod event;
mod sync;
mod version;

pub use event::{
    sort_events, Event, EventBuilder, Membership, MembershipTup, StateTup, EVENT_TYPE_CANONICAL_ALIAS,
    EVENT_TYPE_CREATE, EVENT_TYPE_JOIN_RULES, EVENT_TYPE_MEMBER, EVENT_TYPE_NAME,
    EVENT_TYPE_POWER_LEVELS, EVENT_TYPE_TOPIC, RELATES_TO_KEY, REL_TYPE_ANNOTATION,
    REL_TYPE_THREAD,
};
pub use sync::{Sync, SyncRoom};
pub use version::{VersionKey, VersionMap};

use std::collections::HashMap;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    keys::Versionstamp,
};

/// Current memberships of one subject (user or server), keyed by room.
pub type Memberships = HashMap<OwnedRoomId, MembershipTup>;

/// One entry of a subject's append-only membership change log.
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub room_id: OwnedRoomId,
    pub membership: Membership,
    pub version: Versionstamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub room_id: OwnedRoomId,
    pub kind: String,
    pub thread_id: String,
    pub user_id: OwnedUserId,

    pub event_id: OwnedEventId,
    /// Opaque pass-through blob supplied by the client.
    pub data: Vec<u8>,
}

pub const RECEIPT_TYPE_READ: &str = "m.read";

/// Room metadata, updated by state-event handlers. The id is populated at
/// fetch time from the store key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    #[serde(skip, default = "unset_room_id")]
    pub id: OwnedRoomId,

    pub version: String,
    pub depth: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub canonical_alias: String,

    #[serde(default)]
    pub member_count: i64,

    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub federated: bool,
}

pub(crate) fn unset_room_id() -> OwnedRoomId {
    OwnedRoomId::try_from("!unset:unset").expect("static room id")
}

pub(crate) fn unset_event_id() -> OwnedEventId {
    OwnedEventId::try_from("$unset").expect("static event id")
}

impl Room {
    pub fn new(id: OwnedRoomId, version: impl Into<String>) -> Self {
        Self {
            id,
            version: version.into(),
            depth: 0,
            name: String::new(),
            topic: String::new(),
            canonical_alias: String::new(),
            member_count: 0,
            public: false,
            federated: true,
        }
    }

    pub fn from_bytes(b: &[u8], id: OwnedRoomId) -> Result<Self> {
        let mut room: Room = rmp_serde::from_slice(b)?;
        room.id = id;
        Ok(room)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

/// State-slot -> event id projection of a room at some point in its history.
pub type StateMap = HashMap<StateTup, OwnedEventId>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_roundtrips_through_msgpack() {
        let id = OwnedRoomId::try_from("!abc:example.org").unwrap();
        let mut room = Room::new(id.clone(), "11");
        room.name = "kitchen".into();
        room.member_count = 3;
        room.public = true;

        let bytes = room.to_bytes().unwrap();
        let decoded = Room::from_bytes(&bytes, id.clone()).unwrap();
        assert_eq!(decoded.id, id);
        assert_eq!(decoded.name, "kitchen");
        assert_eq!(decoded.member_count, 3);
        assert!(decoded.public);
        assert!(decoded.federated);
    }
}
