use super::*;
use crate::state::test_helpers::{code, room_with_members};
use tokio::time::{Duration, timeout};

async fn next_change(rx: &mut broadcast::Receiver<StoreEvent>) -> RoomChange {
    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("change receive timed out")
        .expect("change channel closed");
    match event {
        StoreEvent::Changed(change) => change,
        StoreEvent::Resync => panic!("memory store never resyncs"),
    }
}

#[tokio::test]
async fn insert_if_absent_commits_once() {
    let store = MemoryStore::new();
    let room = room_with_members("482913", &["a"], 0);

    let first = store
        .compare_and_swap(&room.room_code, None, Some(room.clone()))
        .await
        .unwrap();
    assert!(matches!(first, CasOutcome::Committed { .. }));

    let second = store
        .compare_and_swap(&room.room_code, None, Some(room.clone()))
        .await
        .unwrap();
    assert_eq!(second, CasOutcome::Conflict);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn stale_version_conflicts() {
    let store = MemoryStore::new();
    let room = room_with_members("482913", &["a"], 0);
    let CasOutcome::Committed { version: v1 } = store
        .compare_and_swap(&room.room_code, None, Some(room.clone()))
        .await
        .unwrap()
    else {
        panic!("insert should commit");
    };

    let mut updated = room.clone();
    updated.admit("b", "b", 1).unwrap();
    let CasOutcome::Committed { version: v2 } = store
        .compare_and_swap(&room.room_code, Some(v1), Some(updated.clone()))
        .await
        .unwrap()
    else {
        panic!("update should commit");
    };
    assert!(v2 > v1);

    let retry = store
        .compare_and_swap(&room.room_code, Some(v1), Some(room.clone()))
        .await
        .unwrap();
    assert_eq!(retry, CasOutcome::Conflict);

    let loaded = store.load(&room.room_code).await.unwrap().unwrap();
    assert_eq!(loaded.version, v2);
    assert_eq!(loaded.value, updated);
}

#[tokio::test]
async fn versions_are_not_reused_after_delete() {
    let store = MemoryStore::new();
    let room = room_with_members("482913", &["a"], 0);
    let code = room.room_code.clone();

    let CasOutcome::Committed { version: v1 } = store.compare_and_swap(&code, None, Some(room.clone())).await.unwrap()
    else {
        panic!("insert should commit");
    };
    store.compare_and_swap(&code, Some(v1), None).await.unwrap();
    assert!(store.load(&code).await.unwrap().is_none());

    let CasOutcome::Committed { version: v3 } = store.compare_and_swap(&code, None, Some(room)).await.unwrap()
    else {
        panic!("recreate should commit");
    };
    assert!(v3 > v1);

    // A writer still holding the first incarnation's version is locked out.
    let stale = store.compare_and_swap(&code, Some(v1), None).await.unwrap();
    assert_eq!(stale, CasOutcome::Conflict);
    assert!(store.load(&code).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_requires_expected_version() {
    let store = MemoryStore::new();
    let outcome = store.compare_and_swap(&code("100000"), None, None).await.unwrap();
    assert_eq!(outcome, CasOutcome::Conflict);
}

#[tokio::test]
async fn changes_are_published_in_commit_order() {
    let store = MemoryStore::new();
    let mut rx = store.watch();
    let room = room_with_members("482913", &["a"], 0);
    let code = room.room_code.clone();

    let CasOutcome::Committed { version: v1 } = store.compare_and_swap(&code, None, Some(room.clone())).await.unwrap()
    else {
        panic!("insert should commit");
    };
    store.compare_and_swap(&code, Some(v1), None).await.unwrap();

    let created = next_change(&mut rx).await;
    assert_eq!(created.version, v1);
    assert_eq!(created.room.as_ref(), Some(&room));

    let deleted = next_change(&mut rx).await;
    assert!(deleted.version > v1);
    assert!(deleted.room.is_none());
}

#[tokio::test]
async fn list_codes_is_sorted() {
    let store = MemoryStore::new();
    for raw in ["300000", "100000", "200000"] {
        let room = room_with_members(raw, &["a"], 0);
        store.compare_and_swap(&room.room_code, None, Some(room.clone())).await.unwrap();
    }
    let codes: Vec<String> = store
        .list_codes()
        .await
        .unwrap()
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(codes, vec!["100000", "200000", "300000"]);
}

#[tokio::test]
async fn observe_reports_revision_even_when_absent() {
    let store = MemoryStore::new();
    let missing = code("100001");
    assert_eq!(store.observe(&missing).await.unwrap(), Observed { room: None, revision: 0 });

    let room = room_with_members("482913", &["a"], 0);
    let CasOutcome::Committed { version } = store
        .compare_and_swap(&room.room_code, None, Some(room.clone()))
        .await
        .unwrap()
    else {
        panic!("insert should commit");
    };
    let live = store.observe(&room.room_code).await.unwrap();
    assert_eq!(live.room.map(|r| r.version), Some(version));
    assert_eq!(live.revision, version);

    let CasOutcome::Committed { version: deleted } = store
        .compare_and_swap(&room.room_code, Some(version), None)
        .await
        .unwrap()
    else {
        panic!("delete should commit");
    };
    let gone = store.observe(&room.room_code).await.unwrap();
    assert!(gone.room.is_none());
    assert_eq!(gone.revision, deleted);
}
