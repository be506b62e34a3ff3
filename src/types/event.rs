use std::fmt;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

use super::unset_event_id;

pub const EVENT_TYPE_CREATE: &str = "m.room.create";
pub const EVENT_TYPE_MEMBER: &str = "m.room.member";
pub const EVENT_TYPE_POWER_LEVELS: &str = "m.room.power_levels";
pub const EVENT_TYPE_JOIN_RULES: &str = "m.room.join_rules";
pub const EVENT_TYPE_NAME: &str = "m.room.name";
pub const EVENT_TYPE_TOPIC: &str = "m.room.topic";
pub const EVENT_TYPE_CANONICAL_ALIAS: &str = "m.room.canonical_alias";

pub const RELATES_TO_KEY: &str = "m.relates_to";
pub const REL_TYPE_ANNOTATION: &str = "m.annotation";
pub const REL_TYPE_THREAD: &str = "m.thread";

/// Immutable structured room record. The id is populated at fetch time from
/// the store key; everything else lives in the msgpack body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip, default = "unset_event_id")]
    pub id: OwnedEventId,

    pub room_id: OwnedRoomId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub sender: OwnedUserId,
    pub origin_server_ts: i64,
    pub depth: i64,
    pub content: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev_events: Vec<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_events: Vec<OwnedEventId>,

    /// Populated only on the way out of sync; never persisted.
    #[serde(skip)]
    pub unsigned: Option<Value>,
}

impl Event {
    pub fn from_bytes(b: &[u8], id: OwnedEventId) -> Result<Self> {
        let mut ev: Event = rmp_serde::from_slice(b)?;
        ev.id = id;
        Ok(ev)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn state_tup(&self) -> Option<StateTup> {
        self.state_key.as_ref().map(|key| StateTup {
            kind: self.kind.clone(),
            state_key: key.clone(),
        })
    }

    pub fn membership(&self) -> Option<Membership> {
        if self.kind != EVENT_TYPE_MEMBER {
            return None;
        }
        self.content
            .get("membership")
            .and_then(Value::as_str)
            .and_then(Membership::parse)
    }

    /// The relation declared in content, if any: (parent, rel_type, key).
    pub fn relation(&self) -> Option<(OwnedEventId, String, Option<String>)> {
        let rel = self.content.get(RELATES_TO_KEY)?;
        let parent = rel
            .get("event_id")
            .and_then(Value::as_str)
            .and_then(|raw| OwnedEventId::try_from(raw).ok())?;
        let rel_type = rel.get("rel_type").and_then(Value::as_str)?.to_owned();
        let key = rel.get("key").and_then(Value::as_str).map(str::to_owned);
        Some((parent, rel_type, key))
    }

    /// JSON form for federation transactions and sync responses, with the
    /// id folded back in.
    pub fn to_sync_json(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        value["event_id"] = json!(self.id.as_str());
        if let Some(unsigned) = &self.unsigned {
            value["unsigned"] = unsigned.clone();
        }
        Ok(value)
    }
}

/// Sort events by (depth, event_id), the stable order used for state and
/// auth-chain listings.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| (a.depth, a.id.as_str()).cmp(&(b.depth, b.id.as_str())));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Leave,
    Invite,
    Knock,
    Ban,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Join => "join",
            Membership::Leave => "leave",
            Membership::Invite => "invite",
            Membership::Knock => "knock",
            Membership::Ban => "ban",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "join" => Some(Membership::Join),
            "leave" => Some(Membership::Leave),
            "invite" => Some(Membership::Invite),
            "knock" => Some(Membership::Knock),
            "ban" => Some(Membership::Ban),
            _ => None,
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (type, state_key) slot in a room's resolved state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateTup {
    pub kind: String,
    pub state_key: String,
}

impl StateTup {
    pub fn member(user_id: &OwnedUserId) -> Self {
        Self {
            kind: EVENT_TYPE_MEMBER.to_owned(),
            state_key: user_id.as_str().to_owned(),
        }
    }
}

/// A subject's membership of one room, as tracked by the projections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MembershipTup {
    pub room_id: OwnedRoomId,
    pub event_id: Option<OwnedEventId>,
    pub membership: Membership,
}

/// Test/builder convenience for assembling events the ingest path accepts.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(
        id: OwnedEventId,
        room_id: OwnedRoomId,
        sender: OwnedUserId,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            event: Event {
                id,
                room_id,
                kind: kind.into(),
                state_key: None,
                sender,
                origin_server_ts: chrono::Utc::now().timestamp_millis(),
                depth: 1,
                content: json!({}),
                prev_events: Vec::new(),
                auth_events: Vec::new(),
                unsigned: None,
            },
        }
    }

    pub fn state_key(mut self, key: impl Into<String>) -> Self {
        self.event.state_key = Some(key.into());
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.event.content = content;
        self
    }

    pub fn depth(mut self, depth: i64) -> Self {
        self.event.depth = depth;
        self
    }

    pub fn origin_server_ts(mut self, ts: i64) -> Self {
        self.event.origin_server_ts = ts;
        self
    }

    pub fn prev_events(mut self, prev: Vec<OwnedEventId>) -> Self {
        self.event.prev_events = prev;
        self
    }

    pub fn auth_events(mut self, auth: Vec<OwnedEventId>) -> Self {
        self.event.auth_events = auth;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        EventBuilder::new(
            OwnedEventId::try_from("$one").unwrap(),
            OwnedRoomId::try_from("!r:example.org").unwrap(),
            OwnedUserId::try_from("@a:example.org").unwrap(),
            EVENT_TYPE_MEMBER,
        )
        .state_key("@a:example.org")
        .content(json!({"membership": "join"}))
        .depth(2)
        .build()
    }

    #[test]
    fn event_roundtrips_through_msgpack() {
        let ev = sample_event();
        let bytes = ev.to_bytes().unwrap();
        let decoded = Event::from_bytes(&bytes, ev.id.clone()).unwrap();
        assert_eq!(decoded.id, ev.id);
        assert_eq!(decoded.kind, EVENT_TYPE_MEMBER);
        assert_eq!(decoded.state_key.as_deref(), Some("@a:example.org"));
        assert_eq!(decoded.membership(), Some(Membership::Join));
        assert_eq!(decoded.depth, 2);
    }

    #[test]
    fn unsigned_is_never_persisted() {
        let mut ev = sample_event();
        ev.unsigned = Some(json!({"age": 12}));
        let bytes = ev.to_bytes().unwrap();
        let decoded = Event::from_bytes(&bytes, ev.id.clone()).unwrap();
        assert!(decoded.unsigned.is_none());

        let value = ev.to_sync_json().unwrap();
        assert_eq!(value["unsigned"]["age"], json!(12));
    }

    #[test]
    fn relation_extraction() {
        let ev = EventBuilder::new(
            OwnedEventId::try_from("$react").unwrap(),
            OwnedRoomId::try_from("!r:example.org").unwrap(),
            OwnedUserId::try_from("@a:example.org").unwrap(),
            "m.reaction",
        )
        .content(json!({
            RELATES_TO_KEY: {
                "rel_type": REL_TYPE_ANNOTATION,
                "event_id": "$parent",
                "key": "👍",
            }
        }))
        .build();

        let (parent, rel_type, key) = ev.relation().unwrap();
        assert_eq!(parent.as_str(), "$parent");
        assert_eq!(rel_type, REL_TYPE_ANNOTATION);
        assert_eq!(key.as_deref(), Some("👍"));
    }

    #[test]
    fn sync_json_carries_event_id() {
        let ev = sample_event();
        let value = ev.to_sync_json().unwrap();
        assert_eq!(value["event_id"], json!("$one"));
        assert_eq!(value["type"], json!(EVENT_TYPE_MEMBER));
    }
}
