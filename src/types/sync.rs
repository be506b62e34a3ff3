use std::collections::HashMap;

use ruma::OwnedRoomId;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::Result;

use super::{Event, Membership, MembershipTup, Receipt, VersionMap};

/// One room's slice of a sync response.
#[derive(Debug, Default, Clone)]
pub struct SyncRoom {
    pub state_events: Vec<Event>,
    pub timeline_events: Vec<Event>,
    pub receipts: Vec<Receipt>,
}

impl SyncRoom {
    pub fn is_empty(&self) -> bool {
        self.state_events.is_empty() && self.timeline_events.is_empty() && self.receipts.is_empty()
    }
}

#[derive(Debug, Default, Serialize)]
struct SyncRooms {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    join: HashMap<OwnedRoomId, Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    leave: HashMap<OwnedRoomId, Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    invite: HashMap<OwnedRoomId, Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    knock: HashMap<OwnedRoomId, Value>,
}

/// Assembled sync response, bucketed by the subject's membership. The
/// device-list and account-data slots are reserved for the transient and
/// accounts databases and stay empty here.
#[derive(Debug, Serialize)]
pub struct Sync {
    pub next_batch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rooms: Option<SyncRooms>,
}

impl Sync {
    pub fn from_rooms(next: &VersionMap, rooms: HashMap<MembershipTup, SyncRoom>) -> Result<Self> {
        let mut buckets = SyncRooms::default();
        let mut any = false;

        for (tup, room) in rooms {
            if room.is_empty() {
                continue;
            }
            any = true;
            let value = sync_room_json(&room)?;
            match tup.membership {
                Membership::Join => buckets.join.insert(tup.room_id, value),
                Membership::Leave | Membership::Ban => buckets.leave.insert(tup.room_id, value),
                Membership::Invite => buckets.invite.insert(tup.room_id, value),
                Membership::Knock => buckets.knock.insert(tup.room_id, value),
            };
        }

        Ok(Self {
            next_batch: next.to_cursor(),
            rooms: any.then_some(buckets),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_none()
    }
}

fn sync_room_json(room: &SyncRoom) -> Result<Value> {
    let mut out = Map::new();

    if !room.state_events.is_empty() {
        let state: Vec<Value> = room
            .state_events
            .iter()
            .map(Event::to_sync_json)
            .collect::<Result<_>>()?;
        out.insert("state".into(), json!({ "events": state }));
    }
    if !room.timeline_events.is_empty() {
        let timeline: Vec<Value> = room
            .timeline_events
            .iter()
            .map(Event::to_sync_json)
            .collect::<Result<_>>()?;
        out.insert("timeline".into(), json!({ "events": timeline }));
    }
    if !room.receipts.is_empty() {
        out.insert(
            "ephemeral".into(),
            json!({ "events": [receipts_to_ephemeral(&room.receipts)?] }),
        );
    }

    Ok(Value::Object(out))
}

/// Fold receipts into a single m.receipt ephemeral event, keyed by the
/// referenced event id.
fn receipts_to_ephemeral(receipts: &[Receipt]) -> Result<Value> {
    let mut content = Map::new();
    for rc in receipts {
        let mut extra = Map::new();
        if !rc.data.is_empty() {
            if let Ok(data) = serde_json::from_slice::<Value>(&rc.data) {
                if let Some(obj) = data.as_object() {
                    extra = obj.clone();
                }
            }
        }
        if !rc.thread_id.is_empty() {
            extra.insert("thread_id".into(), json!(rc.thread_id));
        }

        let per_event = content
            .entry(rc.event_id.as_str().to_owned())
            .or_insert_with(|| json!({}));
        per_event[&rc.kind][rc.user_id.as_str()] = Value::Object(extra);
    }

    Ok(json!({
        "type": "m.receipt",
        "content": content,
    }))
}

#[cfg(test)]
mod tests {
    use ruma::{OwnedEventId, OwnedUserId};
    use serde_json::json;

    use super::*;
    use crate::types::RECEIPT_TYPE_READ;

    #[test]
    fn buckets_rooms_by_membership() {
        let room_id = OwnedRoomId::try_from("!r:example.org").unwrap();
        let mut rooms = HashMap::new();
        rooms.insert(
            MembershipTup {
                room_id: room_id.clone(),
                event_id: None,
                membership: Membership::Join,
            },
            SyncRoom {
                receipts: vec![Receipt {
                    room_id: room_id.clone(),
                    kind: RECEIPT_TYPE_READ.into(),
                    thread_id: String::new(),
                    user_id: OwnedUserId::try_from("@a:example.org").unwrap(),
                    event_id: OwnedEventId::try_from("$m1").unwrap(),
                    data: Vec::new(),
                }],
                ..Default::default()
            },
        );

        let sync = Sync::from_rooms(&VersionMap::new(), rooms).unwrap();
        assert!(!sync.is_empty());
        let value = serde_json::to_value(&sync).unwrap();
        let ephemeral = &value["rooms"]["join"]["!r:example.org"]["ephemeral"]["events"][0];
        assert_eq!(ephemeral["type"], json!("m.receipt"));
        assert_eq!(
            ephemeral["content"]["$m1"][RECEIPT_TYPE_READ]["@a:example.org"],
            json!({})
        );
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let room_id = OwnedRoomId::try_from("!r:example.org").unwrap();
        let mut rooms = HashMap::new();
        rooms.insert(
            MembershipTup {
                room_id,
                event_id: None,
                membership: Membership::Join,
            },
            SyncRoom::default(),
        );
        let sync = Sync::from_rooms(&VersionMap::new(), rooms).unwrap();
        assert!(sync.is_empty());
    }
}
