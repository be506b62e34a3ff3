//! End-to-end scenarios against a fresh store: room bootstrap, sync windows,
//! receipt dedup, state conflicts and auth chains.

use std::sync::Arc;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

use roomserv::{
    authz::PermissiveAuthorizer,
    config::Config,
    error::RoomservError,
    notifier::Notifier,
    rooms::{superstream::SuperStreamItem, sync::SyncOptions, RoomsDb},
    store::Store,
    types::{
        Event, EventBuilder, Membership, Receipt, SyncRoom, EVENT_TYPE_CREATE, EVENT_TYPE_MEMBER,
        EVENT_TYPE_NAME, EVENT_TYPE_POWER_LEVELS, EVENT_TYPE_TOPIC, RECEIPT_TYPE_READ,
        REL_TYPE_ANNOTATION,
    },
};

fn fixture() -> (TempDir, RoomsDb, CancellationToken) {
    let temp = tempdir().unwrap();
    let config = Config {
        server_name: "hs1".try_into().unwrap(),
        data_dir: temp.path().to_path_buf(),
        ..Default::default()
    };
    let store = Store::open(config.rooms_db_path(), &config.database).unwrap();
    let notifier = Notifier::new("rooms", None);
    let rooms = RoomsDb::new(&config, store, notifier, Arc::new(PermissiveAuthorizer));
    (temp, rooms, CancellationToken::new())
}

fn event_id(raw: &str) -> OwnedEventId {
    raw.try_into().unwrap()
}

fn user(raw: &str) -> OwnedUserId {
    raw.try_into().unwrap()
}

fn room() -> OwnedRoomId {
    "!kitchen:hs1".try_into().unwrap()
}

fn member_event(
    id: &str,
    room_id: &OwnedRoomId,
    subject: &str,
    membership: &str,
    depth: i64,
    prev: Vec<OwnedEventId>,
    auth: Vec<OwnedEventId>,
) -> Event {
    EventBuilder::new(event_id(id), room_id.clone(), user(subject), EVENT_TYPE_MEMBER)
        .state_key(subject)
        .content(json!({ "membership": membership }))
        .depth(depth)
        .prev_events(prev)
        .auth_events(auth)
        .build()
}

fn message_event(
    id: &str,
    room_id: &OwnedRoomId,
    sender: &str,
    depth: i64,
    prev: Vec<OwnedEventId>,
    auth: Vec<OwnedEventId>,
) -> Event {
    EventBuilder::new(event_id(id), room_id.clone(), user(sender), "m.room.message")
        .content(json!({ "body": format!("message {id}") }))
        .depth(depth)
        .prev_events(prev)
        .auth_events(auth)
        .build()
}

/// Create + member(@a, join) + power levels + name + one message.
async fn bootstrap_room(rooms: &RoomsDb, ctx: &CancellationToken) -> OwnedRoomId {
    let room_id = room();
    let create = EventBuilder::new(
        event_id("$create"),
        room_id.clone(),
        user("@a:hs1"),
        EVENT_TYPE_CREATE,
    )
    .state_key("")
    .content(json!({ "room_version": "11" }))
    .depth(1)
    .build();
    let member = member_event(
        "$member-a",
        &room_id,
        "@a:hs1",
        "join",
        2,
        vec![event_id("$create")],
        vec![event_id("$create")],
    );
    let power = EventBuilder::new(
        event_id("$power",),
        room_id.clone(),
        user("@a:hs1"),
        EVENT_TYPE_POWER_LEVELS,
    )
    .state_key("")
    .content(json!({ "users": { "@a:hs1": 100 } }))
    .depth(3)
    .prev_events(vec![event_id("$member-a")])
    .auth_events(vec![event_id("$create"), event_id("$member-a")])
    .build();
    let name = EventBuilder::new(
        event_id("$name"),
        room_id.clone(),
        user("@a:hs1"),
        EVENT_TYPE_NAME,
    )
    .state_key("")
    .content(json!({ "name": "kitchen" }))
    .depth(4)
    .prev_events(vec![event_id("$power")])
    .auth_events(vec![event_id("$create"), event_id("$member-a"), event_id("$power")])
    .build();
    let m1 = message_event(
        "$m1",
        &room_id,
        "@a:hs1",
        5,
        vec![event_id("$name")],
        vec![event_id("$create"), event_id("$member-a"), event_id("$power")],
    );

    let result = rooms
        .send_events(ctx, &room_id, vec![create, member, power, name, m1])
        .await
        .unwrap();
    assert_eq!(result.allowed.len(), 5, "rejected: {:?}", result.rejected);
    assert!(result.rejected.is_empty());

    room_id
}

fn room_slice<'a>(
    rooms: &'a std::collections::HashMap<roomserv::types::MembershipTup, SyncRoom>,
    room_id: &OwnedRoomId,
) -> (&'a roomserv::types::MembershipTup, &'a SyncRoom) {
    rooms
        .iter()
        .find(|(tup, _)| tup.room_id == *room_id)
        .expect("room present in sync output")
}

fn kinds(events: &[Event]) -> Vec<&str> {
    events.iter().map(|ev| ev.kind.as_str()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn create_and_observe() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    let (next, synced) = rooms.init_rooms_for_user(&ctx, &user("@a:hs1")).await.unwrap();
    let (tup, slice) = room_slice(&synced, &room_id);
    assert_eq!(tup.membership, Membership::Join);

    let mut state = kinds(&slice.state_events);
    state.sort_unstable();
    assert_eq!(
        state,
        vec![EVENT_TYPE_CREATE, EVENT_TYPE_MEMBER, EVENT_TYPE_NAME, EVENT_TYPE_POWER_LEVELS]
    );

    // The name event is state, so only the message lands in the timeline.
    assert_eq!(kinds(&slice.timeline_events), vec!["m.room.message"]);
    assert_eq!(slice.timeline_events[0].id, event_id("$m1"));

    // A subsequent incremental sync from the returned position is empty and
    // stays put.
    let (next2, incremental) = rooms
        .sync_rooms_for_user(&ctx, &user("@a:hs1"), SyncOptions { from: next, limit: 10 })
        .await
        .unwrap();
    assert!(incremental.is_empty());
    assert_eq!(next2, next);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_window_ends_at_leave() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    // Position before @b does anything.
    let (cursor, _) = rooms.init_rooms_for_user(&ctx, &user("@b:hs1")).await.unwrap();

    let join = member_event(
        "$member-b",
        &room_id,
        "@b:hs1",
        "join",
        6,
        vec![event_id("$m1")],
        vec![event_id("$create")],
    );
    rooms.send_events(&ctx, &room_id, vec![join]).await.unwrap();

    let m2 = message_event(
        "$m2",
        &room_id,
        "@b:hs1",
        7,
        vec![event_id("$member-b")],
        vec![event_id("$create"), event_id("$member-b")],
    );
    rooms.send_events(&ctx, &room_id, vec![m2]).await.unwrap();

    let leave = member_event(
        "$leave-b",
        &room_id,
        "@b:hs1",
        "leave",
        8,
        vec![event_id("$m2")],
        vec![event_id("$create"), event_id("$member-b")],
    );
    rooms.send_events(&ctx, &room_id, vec![leave]).await.unwrap();

    let m3 = message_event(
        "$m3",
        &room_id,
        "@a:hs1",
        9,
        vec![event_id("$leave-b")],
        vec![event_id("$create"), event_id("$member-a")],
    );
    rooms.send_events(&ctx, &room_id, vec![m3]).await.unwrap();

    // @b only sees the join-to-leave window: m2 but never m3.
    let (_, synced) = rooms
        .sync_rooms_for_user(&ctx, &user("@b:hs1"), SyncOptions { from: cursor, limit: 10 })
        .await
        .unwrap();
    let (tup, slice) = room_slice(&synced, &room_id);
    assert_eq!(tup.membership, Membership::Leave);

    let timeline_ids: Vec<_> = slice.timeline_events.iter().map(|ev| ev.id.as_str()).collect();
    assert_eq!(timeline_ids, vec!["$m2"]);
    assert!(slice
        .state_events
        .iter()
        .all(|ev| ev.id != event_id("$m3")));
}

fn receipt(room_id: &OwnedRoomId, sender: &str, target: &str) -> Receipt {
    Receipt {
        room_id: room_id.clone(),
        kind: RECEIPT_TYPE_READ.into(),
        thread_id: String::new(),
        user_id: user(sender),
        event_id: event_id(target),
        data: Vec::new(),
    }
}

fn stream_receipts(items: &[SuperStreamItem]) -> Vec<&SuperStreamItem> {
    items
        .iter()
        .filter(|item| matches!(item, SuperStreamItem::Receipt { .. }))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn receipt_replay_dedups_the_stream() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;
    let (cursor, _) = rooms.init_rooms_for_user(&ctx, &user("@a:hs1")).await.unwrap();

    let zero = roomserv::keys::ZERO_VERSIONSTAMP;

    let first = rooms
        .send_receipts(&ctx, &room_id, vec![receipt(&room_id, "@a:hs1", "$m1")])
        .await
        .unwrap();
    assert_eq!(first.allowed.len(), 1);

    let items = rooms
        .get_room_super_stream(&ctx, &room_id, zero, zero, 100)
        .await
        .unwrap();
    assert_eq!(stream_receipts(&items).len(), 1);
    let first_version = stream_receipts(&items)[0].version();

    // Replay: identical key, identical event. One prior entry cleared, one
    // inserted; net stream growth zero.
    let second = rooms
        .send_receipts(&ctx, &room_id, vec![receipt(&room_id, "@a:hs1", "$m1")])
        .await
        .unwrap();
    assert_eq!(second.allowed.len(), 1);

    let items = rooms
        .get_room_super_stream(&ctx, &room_id, zero, zero, 100)
        .await
        .unwrap();
    let receipts = stream_receipts(&items);
    assert_eq!(receipts.len(), 1, "exactly one live receipt entry");
    assert!(receipts[0].version() > first_version, "older entry was cleared");

    // Sync delivers exactly the surviving receipt.
    let (_, synced) = rooms
        .sync_rooms_for_user(&ctx, &user("@a:hs1"), SyncOptions { from: cursor, limit: 10 })
        .await
        .unwrap();
    let (_, slice) = room_slice(&synced, &room_id);
    assert_eq!(slice.receipts.len(), 1);
    assert_eq!(slice.receipts[0].event_id, event_id("$m1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn receipt_rule_rejections_are_per_item() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    // Remote member so remote receipts have a subject.
    let remote_join = member_event(
        "$member-r",
        &room_id,
        "@r:hs2",
        "join",
        6,
        vec![event_id("$m1")],
        vec![event_id("$create")],
    );
    rooms.send_events(&ctx, &room_id, vec![remote_join]).await.unwrap();

    let result = rooms
        .send_receipts(
            &ctx,
            &room_id,
            vec![
                // Not a member at all.
                receipt(&room_id, "@stranger:hs1", "$m1"),
                // Local user referencing an event we do not have.
                receipt(&room_id, "@a:hs1", "$missing"),
                // Remote user referencing an event we do not have yet:
                // allowed, it may not be backfilled.
                receipt(&room_id, "@r:hs2", "$missing"),
                // And one plainly good receipt.
                receipt(&room_id, "@a:hs1", "$m1"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(result.allowed.len(), 2);
    assert_eq!(result.rejected.len(), 2);
    assert!(matches!(
        result.rejected[0].error,
        RoomservError::UserNotInRoom
    ));
    assert!(matches!(
        result.rejected[1].error,
        RoomservError::EventNotFound
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_topic_writes_converge() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    let topic = |id: &str, text: &str| {
        EventBuilder::new(event_id(id), room_id.clone(), user("@a:hs1"), EVENT_TYPE_TOPIC)
            .state_key("")
            .content(json!({ "topic": text }))
            .depth(6)
            .prev_events(vec![event_id("$m1")])
            .auth_events(vec![event_id("$create"), event_id("$member-a")])
            .build()
    };

    let (r1, r2) = tokio::join!(
        rooms.send_events(&ctx, &room_id, vec![topic("$topic-1", "first")]),
        rooms.send_events(&ctx, &room_id, vec![topic("$topic-2", "second")]),
    );
    let v1 = r1.unwrap().version.unwrap();
    let v2 = r2.unwrap().version.unwrap();
    assert_ne!(v1, v2);

    let winner = if v1 > v2 { "$topic-1" } else { "$topic-2" };
    let loser = if v1 > v2 { "$topic-2" } else { "$topic-1" };

    let state = rooms
        .get_current_room_state_events(&ctx, &room_id)
        .await
        .unwrap();
    let current_topic = state
        .iter()
        .find(|ev| ev.kind == EVENT_TYPE_TOPIC)
        .expect("topic is part of current state");
    assert_eq!(current_topic.id.as_str(), winner);

    // Both writes are retained in the slot history: state at the losing
    // event still resolves to the loser.
    let at_loser = rooms
        .get_room_state_at_event(&ctx, &room_id, &event_id(loser))
        .await
        .unwrap();
    let slot = at_loser
        .iter()
        .find(|(tup, _)| tup.kind == EVENT_TYPE_TOPIC)
        .expect("topic slot in history");
    assert_eq!(slot.1.as_str(), loser);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_chain_is_closed_and_sorted() {
    let (_temp, rooms, ctx) = fixture();
    let _room_id = bootstrap_room(&rooms, &ctx).await;

    let chain = rooms
        .get_event_auth_chain(&ctx, &event_id("$m1"))
        .await
        .unwrap();

    let ids: Vec<_> = chain.iter().map(|ev| ev.id.as_str()).collect();
    assert!(ids.contains(&"$create"));
    assert!(ids.contains(&"$member-a"));
    assert!(ids.contains(&"$power"));
    assert!(!ids.contains(&"$m1"), "the event itself is not in its chain");

    // Closed under auth_events.
    for ev in &chain {
        for auth_id in &ev.auth_events {
            assert!(
                chain.iter().any(|other| other.id == *auth_id),
                "chain misses {auth_id}"
            );
        }
    }

    // Sorted by (depth, event_id).
    let mut sorted = chain.clone();
    sorted.sort_by(|a, b| (a.depth, a.id.as_str()).cmp(&(b.depth, b.id.as_str())));
    let sorted_ids: Vec<_> = sorted.iter().map(|ev| ev.id.as_str()).collect();
    assert_eq!(ids, sorted_ids);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_event_is_rejected_without_side_effects() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    let zero = roomserv::keys::ZERO_VERSIONSTAMP;
    let before = rooms
        .get_room_super_stream(&ctx, &room_id, zero, zero, 100)
        .await
        .unwrap();

    let replay = message_event(
        "$m1",
        &room_id,
        "@a:hs1",
        5,
        vec![event_id("$name")],
        vec![event_id("$create"), event_id("$member-a"), event_id("$power")],
    );
    let result = rooms.send_events(&ctx, &room_id, vec![replay]).await.unwrap();
    assert!(result.allowed.is_empty());
    assert!(matches!(
        result.rejected[0].error,
        RoomservError::AlreadyExists
    ));

    let after = rooms
        .get_room_super_stream(&ctx, &room_id, zero, zero, 100)
        .await
        .unwrap();
    assert_eq!(before.len(), after.len(), "stream unchanged by replay");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_reaction_is_rejected() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    let reaction = |id: &str| {
        EventBuilder::new(event_id(id), room_id.clone(), user("@a:hs1"), "m.reaction")
            .content(json!({
                "m.relates_to": {
                    "rel_type": REL_TYPE_ANNOTATION,
                    "event_id": "$m1",
                    "key": "👍",
                }
            }))
            .depth(6)
            .prev_events(vec![event_id("$m1")])
            .auth_events(vec![event_id("$create"), event_id("$member-a")])
            .build()
    };

    let first = rooms
        .send_events(&ctx, &room_id, vec![reaction("$react-1")])
        .await
        .unwrap();
    assert_eq!(first.allowed.len(), 1);

    let zero = roomserv::keys::ZERO_VERSIONSTAMP;
    let before = rooms
        .get_room_super_stream(&ctx, &room_id, zero, zero, 100)
        .await
        .unwrap();

    let second = rooms
        .send_events(&ctx, &room_id, vec![reaction("$react-2")])
        .await
        .unwrap();
    assert!(second.allowed.is_empty());
    assert!(matches!(
        second.rejected[0].error,
        RoomservError::DuplicateReaction
    ));
    assert!(!rooms.does_event_exist(&ctx, &event_id("$react-2")).await.unwrap());

    let after = rooms
        .get_room_super_stream(&ctx, &room_id, zero, zero, 100)
        .await
        .unwrap();
    assert_eq!(before.len(), after.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn server_projection_follows_joined_member_count() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    let servers = rooms.get_current_room_servers(&ctx, &room_id).await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].as_str(), "hs1");

    // Two users from hs2 join; the server joins once.
    for (id, subject, depth) in [("$member-r1", "@r1:hs2", 6), ("$member-r2", "@r2:hs2", 7)] {
        let join = member_event(
            id,
            &room_id,
            subject,
            "join",
            depth,
            vec![event_id("$m1")],
            vec![event_id("$create")],
        );
        rooms.send_events(&ctx, &room_id, vec![join]).await.unwrap();
    }
    let hs2: ruma::OwnedServerName = "hs2".try_into().unwrap();
    assert!(rooms.is_server_in_room(&ctx, &hs2, &room_id).await.unwrap());
    assert_eq!(rooms.get_current_room_servers(&ctx, &room_id).await.unwrap().len(), 2);

    // One leaves: hs2 stays. The second leaves: hs2 parts.
    let leave1 = member_event(
        "$leave-r1",
        &room_id,
        "@r1:hs2",
        "leave",
        8,
        vec![event_id("$member-r2")],
        vec![event_id("$create")],
    );
    rooms.send_events(&ctx, &room_id, vec![leave1]).await.unwrap();
    assert!(rooms.is_server_in_room(&ctx, &hs2, &room_id).await.unwrap());

    let leave2 = member_event(
        "$leave-r2",
        &room_id,
        "@r2:hs2",
        "leave",
        9,
        vec![event_id("$leave-r1")],
        vec![event_id("$create")],
    );
    rooms.send_events(&ctx, &room_id, vec![leave2]).await.unwrap();
    assert!(!rooms.is_server_in_room(&ctx, &hs2, &room_id).await.unwrap());
    assert_eq!(rooms.get_current_room_servers(&ctx, &room_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn event_body_and_version_index_stay_in_lockstep() {
    let (_temp, rooms, ctx) = fixture();
    let _room_id = bootstrap_room(&rooms, &ctx).await;

    for id in ["$create", "$member-a", "$power", "$name", "$m1"] {
        assert!(rooms.does_event_exist(&ctx, &event_id(id)).await.unwrap());
        assert!(rooms.get_event(&ctx, &event_id(id)).await.unwrap().is_some());
    }
    assert!(!rooms.does_event_exist(&ctx, &event_id("$nope")).await.unwrap());
    assert!(rooms.get_event(&ctx, &event_id("$nope")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn room_meta_tracks_state_events() {
    let (_temp, rooms, ctx) = fixture();
    let room_id = bootstrap_room(&rooms, &ctx).await;

    let meta = rooms.get_room(&ctx, &room_id).await.unwrap().unwrap();
    assert_eq!(meta.version, "11");
    assert_eq!(meta.name, "kitchen");
    assert_eq!(meta.member_count, 1);
    assert_eq!(meta.depth, 5);

    let extrems = rooms
        .get_room_current_extremities(&ctx, &room_id)
        .await
        .unwrap();
    assert_eq!(extrems, vec![event_id("$m1")]);
}
