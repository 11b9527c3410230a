use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::services::room::{RoomManager, RoomPolicy};
use crate::state::test_helpers::{code, room_with_members};
use crate::store::CasOutcome;
use crate::store::memory::MemoryStore;
use crate::store::test_helpers::FlakyStore;

const WAIT: Duration = Duration::from_secs(2);

fn policy() -> RoomPolicy {
    RoomPolicy {
        capacity: 5,
        cas_retries: 8,
        store_retries: 3,
        store_retry_base: Duration::from_millis(1),
        code_attempts: 4,
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    rooms: RoomManager,
    hub: PresenceHub,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let rooms = RoomManager::new(store.clone(), policy());
    let hub = PresenceHub::new(store.clone());
    Fixture { store, rooms, hub }
}

async fn seed(store: &MemoryStore, raw: &str, user_ids: &[&str]) -> RoomCode {
    let room = room_with_members(raw, user_ids, 1_000);
    let code = room.room_code.clone();
    let outcome = store.compare_and_swap(&code, None, Some(room)).await.unwrap();
    assert!(matches!(outcome, CasOutcome::Committed { .. }));
    code
}

fn collect(hub: &PresenceHub, code: RoomCode) -> (Subscription, mpsc::UnboundedReceiver<Snapshot>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = hub.subscribe(code, move |snapshot| {
        let _ = tx.send(snapshot);
    });
    (sub, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Snapshot {
    timeout(WAIT, rx.recv())
        .await
        .expect("snapshot should arrive")
        .expect("channel open")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Snapshot>) {
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "no further snapshot expected"
    );
}

fn ids(snapshot: &Snapshot) -> Vec<&str> {
    snapshot.members.iter().map(|m| m.user_id.as_str()).collect()
}

// =============================================================================
// INITIAL DELIVERY
// =============================================================================

#[tokio::test]
async fn subscribe_delivers_current_snapshot_first() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA", "userB"]).await;

    let (_sub, mut rx) = collect(&f.hub, room.clone());
    let first = next(&mut rx).await;

    assert!(first.exists);
    assert_eq!(first.room_code, room);
    assert_eq!(first.active_member_count, 2);
    assert_eq!(ids(&first), ["userA", "userB"]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn subscribe_to_missing_room_yields_empty_snapshot() {
    let f = fixture();
    let (_sub, mut rx) = collect(&f.hub, code("100001"));

    let first = next(&mut rx).await;
    assert!(!first.exists);
    assert!(first.members.is_empty());
    assert_quiet(&mut rx).await;
}

// =============================================================================
// CHANGE DELIVERY
// =============================================================================

#[tokio::test]
async fn join_and_leave_push_full_snapshots_in_order() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (_sub, mut rx) = collect(&f.hub, room.clone());
    let initial = next(&mut rx).await;

    f.rooms.join_room(&room, "userB", "Bea").await.unwrap();
    let joined = next(&mut rx).await;
    assert!(joined.version > initial.version);
    assert_eq!(ids(&joined), ["userA", "userB"]);

    f.rooms.leave_room(&room, "userA").await.unwrap();
    let left = next(&mut rx).await;
    assert!(left.version > joined.version);
    assert_eq!(ids(&left), ["userB"]);
    assert_eq!(left.active_member_count, 1);
}

#[tokio::test]
async fn other_rooms_are_filtered_out() {
    let f = fixture();
    let watched = seed(&f.store, "482913", &["userA"]).await;
    let other = seed(&f.store, "555555", &["userZ"]).await;
    let (_sub, mut rx) = collect(&f.hub, watched);
    next(&mut rx).await;

    f.rooms.join_room(&other, "userY", "Yan").await.unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn typing_change_is_delivered() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (_sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;

    f.rooms.set_typing(&room, "userA", true).await.unwrap();
    let typing = next(&mut rx).await;
    assert!(typing.members[0].is_typing);
}

#[tokio::test]
async fn deletion_delivers_one_empty_snapshot() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (_sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;

    let outcome = f.rooms.leave_room(&room, "userA").await.unwrap();
    assert!(outcome.room_deleted);

    let gone = next(&mut rx).await;
    assert!(!gone.exists);
    assert!(gone.members.is_empty());
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn recreated_room_resumes_delivery() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (_sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;

    f.rooms.leave_room(&room, "userA").await.unwrap();
    assert!(!next(&mut rx).await.exists);

    seed(&f.store, "482913", &["userC"]).await;
    let back = next(&mut rx).await;
    assert!(back.exists);
    assert_eq!(ids(&back), ["userC"]);
}

#[tokio::test]
async fn resync_event_rereads_without_duplicates() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (_sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;

    // Nothing changed since the initial read, so a resync delivers nothing.
    f.store.publish_resync();
    assert_quiet(&mut rx).await;
}

/// Commit enough writes to another room to overflow the change channel.
/// None of these calls yield, so a subscriber cannot keep up.
async fn flood(rooms: &RoomManager, busy: &RoomCode) {
    for i in 1..=1_100 {
        rooms.heartbeat_at(busy, "userZ", 1_000 + i).await.unwrap();
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Vec<Snapshot> {
    let mut seen = Vec::new();
    while let Ok(Some(snapshot)) = timeout(Duration::from_millis(100), rx.recv()).await {
        seen.push(snapshot);
    }
    seen
}

#[tokio::test]
async fn lagged_subscriber_never_sees_room_return_after_deletion() {
    let f = fixture();
    let room = seed(&f.store, "111111", &["userA"]).await;
    let busy = seed(&f.store, "222222", &["userZ"]).await;
    let (_sub, mut rx) = collect(&f.hub, room.clone());
    assert_eq!(ids(&next(&mut rx).await), ["userA"]);

    f.rooms.join_room(&room, "userB", "Bea").await.unwrap();
    flood(&f.rooms, &busy).await;
    f.rooms.leave_room(&room, "userA").await.unwrap();
    assert!(f.rooms.leave_room(&room, "userB").await.unwrap().room_deleted);

    let seen = drain(&mut rx).await;
    let versions: Vec<u64> = seen.iter().map(|s| s.version).collect();
    assert!(versions.windows(2).all(|w| w[0] < w[1]), "out of order: {versions:?}");
    let last = seen.last().expect("deletion should be delivered");
    assert!(!last.exists);
    assert_eq!(seen.iter().filter(|s| !s.exists).count(), 1, "{seen:?}");
}

#[tokio::test(start_paused = true)]
async fn failed_initial_read_is_retried_in_quiet_room() {
    let store = Arc::new(FlakyStore::failing(RESYNC_ATTEMPTS + 1));
    let room = seed(&store.inner, "482913", &["userA"]).await;
    let hub = PresenceHub::new(store.clone());

    let (_sub, mut rx) = collect(&hub, room);

    // Nothing commits, so only the scheduled retry can deliver this.
    assert_eq!(ids(&next(&mut rx).await), ["userA"]);
    assert_eq!(store.calls.load(Ordering::SeqCst), RESYNC_ATTEMPTS + 2);
}

#[tokio::test(start_paused = true)]
async fn failed_reread_after_lag_is_retried() {
    let store = Arc::new(FlakyStore::failing(0));
    let rooms = RoomManager::new(store.inner.clone(), policy());
    let hub = PresenceHub::new(store.clone());
    let room = seed(&store.inner, "111111", &["userA"]).await;
    let busy = seed(&store.inner, "222222", &["userZ"]).await;
    let (_sub, mut rx) = collect(&hub, room.clone());
    assert_eq!(ids(&next(&mut rx).await), ["userA"]);

    store.fail_next(RESYNC_ATTEMPTS + 2);
    rooms.join_room(&room, "userB", "Bea").await.unwrap();
    flood(&rooms, &busy).await;

    assert_eq!(ids(&next(&mut rx).await), ["userA", "userB"]);
}

#[tokio::test]
async fn store_resync_with_failing_reads_keeps_subscription_alive() {
    let store = Arc::new(FlakyStore::failing(0));
    let rooms = RoomManager::new(store.inner.clone(), policy());
    let hub = PresenceHub::new(store.clone());
    let room = seed(&store.inner, "482913", &["userA"]).await;
    let (sub, mut rx) = collect(&hub, room.clone());
    next(&mut rx).await;

    store.fail_next(RESYNC_ATTEMPTS + 1);
    store.inner.publish_resync();
    rooms.join_room(&room, "userB", "Bea").await.unwrap();

    assert_eq!(ids(&next(&mut rx).await), ["userA", "userB"]);
    assert!(sub.is_active());
}

// =============================================================================
// UNSUBSCRIBE
// =============================================================================

#[tokio::test]
async fn unsubscribe_stops_delivery_and_is_idempotent() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;
    assert_eq!(f.hub.subscriber_count(), 1);

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());
    assert_eq!(f.hub.subscriber_count(), 0);

    f.rooms.join_room(&room, "userB", "Bea").await.unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn unsubscribe_after_room_deleted_is_harmless() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;

    f.rooms.leave_room(&room, "userA").await.unwrap();
    next(&mut rx).await;

    sub.unsubscribe();
    assert_eq!(f.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn dropping_subscription_unsubscribes() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (sub, mut rx) = collect(&f.hub, room.clone());
    next(&mut rx).await;

    drop(sub);
    assert_eq!(f.hub.subscriber_count(), 0);

    f.rooms.join_room(&room, "userB", "Bea").await.unwrap();
    // The sender lives in the aborted task's callback, so the channel closes.
    let after = timeout(WAIT, rx.recv()).await.expect("channel should close");
    assert!(after.is_none());
}

#[tokio::test]
async fn independent_subscribers_each_see_changes() {
    let f = fixture();
    let room = seed(&f.store, "482913", &["userA"]).await;
    let (_first, mut rx1) = collect(&f.hub, room.clone());
    let (second, mut rx2) = collect(&f.hub, room.clone());
    next(&mut rx1).await;
    next(&mut rx2).await;
    assert_eq!(f.hub.subscriber_count(), 2);

    second.unsubscribe();
    f.rooms.join_room(&room, "userB", "Bea").await.unwrap();

    assert_eq!(ids(&next(&mut rx1).await), ["userA", "userB"]);
    assert_quiet(&mut rx2).await;
}

// =============================================================================
// CURSOR
// =============================================================================

fn snap(version: u64, exists: bool) -> Snapshot {
    Snapshot {
        room_code: code("482913"),
        version,
        exists,
        active_member_count: 0,
        members: Vec::new(),
    }
}

#[test]
fn cursor_drops_stale_and_repeated_snapshots() {
    let mut cursor = Cursor::default();
    assert!(cursor.accept(&snap(5, true)));
    assert!(!cursor.accept(&snap(5, true)));
    assert!(!cursor.accept(&snap(3, true)));
    assert!(cursor.accept(&snap(7, true)));
}

#[test]
fn cursor_treats_absent_read_as_watermark() {
    let mut cursor = Cursor::default();
    assert!(cursor.accept(&snap(1, true)));
    // Re-read finds the room gone as of revision 9.
    assert!(cursor.accept(&snap(9, false)));
    // Changes queued before that read are all older.
    assert!(!cursor.accept(&snap(4, true)));
    assert!(!cursor.accept(&snap(8, false)));
    assert!(cursor.accept(&snap(12, true)));
}

#[test]
fn cursor_delivers_deletion_once() {
    let mut cursor = Cursor::default();
    assert!(cursor.accept(&snap(5, true)));
    assert!(cursor.accept(&snap(6, false)));
    assert!(!cursor.accept(&snap(0, false)));
    assert!(cursor.accept(&snap(9, true)));
}
