//! Federation sender behavior: lease-guarded position updates and the
//! local-origin stream driving outgoing transactions.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

use roomserv::{
    authz::PermissiveAuthorizer,
    config::Config,
    error::{Result, RoomservError},
    federation::{FederationClient, FederationSender, Transaction, TransactionResponse},
    lock::LockManager,
    notifier::Notifier,
    rooms::{sync::SyncOptions, RoomsDb},
    store::Store,
    types::{
        EventBuilder, VersionKey, VersionMap, EVENT_TYPE_CREATE, EVENT_TYPE_MEMBER,
    },
};

#[derive(Clone, Default)]
struct RecordingClient {
    transactions: Arc<Mutex<Vec<Transaction>>>,
}

impl FederationClient for RecordingClient {
    async fn send_transaction(&self, txn: Transaction) -> Result<TransactionResponse> {
        self.transactions.lock().push(txn);
        Ok(TransactionResponse::default())
    }
}

fn fixture() -> (TempDir, Config, RoomsDb, Notifier, CancellationToken) {
    let temp = tempdir().unwrap();
    let config = Config {
        server_name: "hs1".try_into().unwrap(),
        data_dir: temp.path().to_path_buf(),
        ..Default::default()
    };
    let store = Store::open(config.rooms_db_path(), &config.database).unwrap();
    let notifier = Notifier::new("rooms", None);
    let rooms = RoomsDb::new(
        &config,
        store,
        notifier.clone(),
        Arc::new(PermissiveAuthorizer),
    );
    (temp, config, rooms, notifier, CancellationToken::new())
}

fn event_id(raw: &str) -> OwnedEventId {
    raw.try_into().unwrap()
}

fn user(raw: &str) -> OwnedUserId {
    raw.try_into().unwrap()
}

async fn seed_room(rooms: &RoomsDb, ctx: &CancellationToken) -> OwnedRoomId {
    let room_id: OwnedRoomId = "!fed:hs1".try_into().unwrap();

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
    let member_a = EventBuilder::new(
        event_id("$member-a"),
        room_id.clone(),
        user("@a:hs1"),
        EVENT_TYPE_MEMBER,
    )
    .state_key("@a:hs1")
    .content(json!({ "membership": "join" }))
    .depth(2)
    .prev_events(vec![event_id("$create")])
    .auth_events(vec![event_id("$create")])
    .build();
    let result = rooms
        .send_events(ctx, &room_id, vec![create, member_a])
        .await
        .unwrap();
    assert_eq!(result.allowed.len(), 2);

    room_id
}

#[tokio::test(flavor = "multi_thread")]
async fn sender_ships_local_stream_and_advances_positions() {
    let (_temp, config, rooms, notifier, ctx) = fixture();
    let room_id = seed_room(&rooms, &ctx).await;

    let client = RecordingClient::default();
    let sender = FederationSender::new(
        config,
        rooms.clone(),
        notifier.clone(),
        client.clone(),
    );
    sender.start().await.unwrap();

    // A remote user joining emits the server hint that wakes the sender.
    let member_r = EventBuilder::new(
        event_id("$member-r"),
        room_id.clone(),
        user("@r:hs2"),
        EVENT_TYPE_MEMBER,
    )
    .state_key("@r:hs2")
    .content(json!({ "membership": "join" }))
    .depth(3)
    .prev_events(vec![event_id("$member-a")])
    .auth_events(vec![event_id("$create")])
    .build();
    let m1 = EventBuilder::new(
        event_id("$m1"),
        room_id.clone(),
        user("@a:hs1"),
        "m.room.message",
    )
    .content(json!({ "body": "hello hs2" }))
    .depth(4)
    .prev_events(vec![event_id("$member-r")])
    .auth_events(vec![event_id("$create"), event_id("$member-a")])
    .build();
    rooms
        .send_events(&ctx, &room_id, vec![member_r, m1])
        .await
        .unwrap();

    // The sender runs in the background; wait for the transaction.
    let hs2: OwnedServerName = "hs2".try_into().unwrap();
    let mut delivered = Vec::new();
    for _ in 0..100 {
        delivered = client.transactions.lock().clone();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!delivered.is_empty(), "sender never delivered a transaction");

    let txn = &delivered[0];
    assert_eq!(txn.origin.as_str(), "hs1");
    assert_eq!(txn.destination, hs2);
    assert!(!txn.transaction_id.is_empty());

    // Only locally-originated events from hs2's join onwards are shipped:
    // the remote member event came from hs2 itself, and the pre-join
    // history is not resent.
    let pdu_ids: Vec<&str> = txn
        .pdus
        .iter()
        .filter_map(|pdu| pdu["event_id"].as_str())
        .collect();
    assert_eq!(pdu_ids, vec!["$m1"]);

    // Positions advanced under the lock.
    let mut positions = None;
    for _ in 0..100 {
        positions = rooms.get_server_positions(&ctx, &hs2).await.unwrap();
        if positions.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let positions = positions.expect("positions stored");
    assert!(positions.get(VersionKey::ROOMS) > roomserv::keys::ZERO_VERSIONSTAMP);

    sender.stop().await;
    notifier.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_sender_cannot_advance_positions() {
    let (_temp, _config, rooms, notifier, ctx) = fixture();
    let room_id = seed_room(&rooms, &ctx).await;
    let hs2: OwnedServerName = "hs2".try_into().unwrap();

    let (store, lock_subspace) = rooms.lock_primitives();
    let lock_name = "FederationServerSenderLock:hs2";

    // P2 held the lock but its lease ran out.
    let p2 = LockManager::new(store.clone(), lock_subspace.clone());
    let stale = p2.try_acquire(&ctx, lock_name, -1).await.unwrap().unwrap();

    // P1 takes over.
    let p1 = LockManager::new(store, lock_subspace);
    let fresh = p1
        .try_acquire(&ctx, lock_name, 60)
        .await
        .unwrap()
        .expect("expired lease is acquirable");

    // P2 can still read and sync, but its position update must fail the
    // in-transaction lock check.
    let (next, _) = rooms
        .sync_rooms_for_server(
            &ctx,
            &hs2,
            SyncOptions {
                from: roomserv::keys::ZERO_VERSIONSTAMP,
                limit: 50,
            },
        )
        .await
        .unwrap();

    let mut positions = VersionMap::new();
    positions.set(VersionKey::ROOMS, next);
    let err = rooms
        .update_server_positions(&ctx, &hs2, &positions, |txn| stale.txn_check(txn))
        .await
        .expect_err("stale lock must not advance positions");
    assert!(matches!(err, RoomservError::Conflict(_)));
    assert!(rooms.get_server_positions(&ctx, &hs2).await.unwrap().is_none());

    // The fresh holder can.
    rooms
        .update_server_positions(&ctx, &hs2, &positions, |txn| fresh.txn_check(txn))
        .await
        .unwrap();
    assert_eq!(
        rooms
            .get_server_positions(&ctx, &hs2)
            .await
            .unwrap()
            .unwrap()
            .get(VersionKey::ROOMS),
        next
    );

    let _ = room_id;
    notifier.stop();
}
