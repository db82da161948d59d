//! Behaviour every `MetaStore` backend must share. Each backend's tests call
//! these against a fresh, empty store.

use super::{KeyRange, MetaStore, Precondition, Version, WriteOp, WriteOutcome};
use std::time::Duration;

fn put(value: &[u8], ttl: Option<Duration>) -> WriteOp {
    WriteOp::Put {
        value: value.to_vec(),
        ttl,
    }
}

fn keys_of(rows: &[(String, Vec<u8>)]) -> Vec<&str> {
    rows.iter().map(|(key, _)| key.as_str()).collect()
}

pub async fn conditional_writes(store: &dyn MetaStore) {
    let applied = store
        .write_if("cw/k", Precondition::Absent, put(b"one", None))
        .await
        .unwrap();
    assert_eq!(applied, WriteOutcome::Applied);
    let again = store
        .write_if("cw/k", Precondition::Absent, put(b"two", None))
        .await
        .unwrap();
    assert_eq!(again, WriteOutcome::Conflict);

    let first = store.get("cw/k").await.unwrap().unwrap();
    assert_eq!(first.value, b"one");

    let updated = store
        .write_if("cw/k", Precondition::Version(first.version), put(b"two", None))
        .await
        .unwrap();
    assert_eq!(updated, WriteOutcome::Applied);
    let second = store.get("cw/k").await.unwrap().unwrap();
    assert_eq!(second.value, b"two");
    assert_ne!(second.version, first.version);

    // The first version is now stale for both puts and deletes.
    let stale_put = store
        .write_if("cw/k", Precondition::Version(first.version), put(b"three", None))
        .await
        .unwrap();
    assert_eq!(stale_put, WriteOutcome::Conflict);
    let stale_delete = store
        .write_if("cw/k", Precondition::Version(first.version), WriteOp::Delete)
        .await
        .unwrap();
    assert_eq!(stale_delete, WriteOutcome::Conflict);
    assert_eq!(store.get("cw/k").await.unwrap().unwrap().value, b"two");

    let deleted = store
        .write_if("cw/k", Precondition::Version(second.version), WriteOp::Delete)
        .await
        .unwrap();
    assert_eq!(deleted, WriteOutcome::Applied);
    assert!(store.get("cw/k").await.unwrap().is_none());

    let missing = store
        .write_if("cw/missing", Precondition::Version(Version(1)), put(b"x", None))
        .await
        .unwrap();
    assert_eq!(missing, WriteOutcome::Conflict);
    assert!(store.get("cw/missing").await.unwrap().is_none());
}

pub async fn versions_change_on_recreate(store: &dyn MetaStore) {
    store.set("rc/k", b"a".to_vec(), None).await.unwrap();
    let first = store.get("rc/k").await.unwrap().unwrap().version;
    assert!(store.delete("rc/k").await.unwrap());
    assert!(!store.delete("rc/k").await.unwrap());

    store.set("rc/k", b"a".to_vec(), None).await.unwrap();
    let second = store.get("rc/k").await.unwrap().unwrap().version;
    assert_ne!(first, second);

    let outcome = store
        .write_if("rc/k", Precondition::Version(first), WriteOp::Delete)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Conflict);
}

pub async fn get_many_skips_missing(store: &dyn MetaStore) {
    store.set("gm/a", b"1".to_vec(), None).await.unwrap();
    store.set("gm/c", b"3".to_vec(), None).await.unwrap();

    let wanted = vec![
        "gm/a".to_string(),
        "gm/b".to_string(),
        "gm/c".to_string(),
    ];
    let found = store.get_many(&wanted).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found["gm/a"].value, b"1");
    assert_eq!(found["gm/c"].value, b"3");
    assert!(!found.contains_key("gm/b"));
    assert_eq!(
        found["gm/a"].version,
        store.get("gm/a").await.unwrap().unwrap().version
    );

    assert!(store.get_many(&[]).await.unwrap().is_empty());
}

pub async fn scan_ranges(store: &dyn MetaStore) {
    for key in ["sc", "sc/1", "sc/2", "sc/3", "sc/4", "sd/1"] {
        store.set(key, key.as_bytes().to_vec(), None).await.unwrap();
    }

    let all = store.scan(&KeyRange::prefix("sc/")).await.unwrap();
    assert_eq!(keys_of(&all), vec!["sc/1", "sc/2", "sc/3", "sc/4"]);
    assert_eq!(all[0].1, b"sc/1");

    let page = store
        .scan(&KeyRange::prefix("sc/").with_limit(2))
        .await
        .unwrap();
    assert_eq!(keys_of(&page), vec!["sc/1", "sc/2"]);
    let next = store
        .scan(&KeyRange::prefix("sc/").with_limit(2).resume_after("sc/2"))
        .await
        .unwrap();
    assert_eq!(keys_of(&next), vec!["sc/3", "sc/4"]);

    let newest = store
        .scan(&KeyRange::prefix("sc/").descending().with_limit(3))
        .await
        .unwrap();
    assert_eq!(keys_of(&newest), vec!["sc/4", "sc/3", "sc/2"]);
    let older = store
        .scan(
            &KeyRange::prefix("sc/")
                .descending()
                .with_limit(3)
                .resume_before("sc/2"),
        )
        .await
        .unwrap();
    assert_eq!(keys_of(&older), vec!["sc/1"]);

    let past_end = store
        .scan(&KeyRange::prefix("sc/").resume_after("sc/9"))
        .await
        .unwrap();
    assert!(past_end.is_empty());
    let inverted = KeyRange {
        start: Some("sc/3".to_string()),
        end: Some("sc/1".to_string()),
        limit: usize::MAX,
        descending: false,
    };
    assert!(store.scan(&inverted).await.unwrap().is_empty());
    assert!(store.scan(&inverted.descending()).await.unwrap().is_empty());
    let nothing = store
        .scan(&KeyRange::prefix("sc/").with_limit(0))
        .await
        .unwrap();
    assert!(nothing.is_empty());
}

/// `ttl` should be the shortest expiry the backend honours precisely.
pub async fn expired_keys_are_absent(store: &dyn MetaStore, ttl: Duration) {
    store.set("ex/keep", b"k".to_vec(), None).await.unwrap();
    store
        .set("ex/lease", b"node-a".to_vec(), Some(ttl))
        .await
        .unwrap();
    assert!(store.get("ex/lease").await.unwrap().is_some());

    tokio::time::sleep(ttl * 2 + Duration::from_millis(50)).await;

    assert!(store.get("ex/lease").await.unwrap().is_none());
    let found = store
        .get_many(&["ex/keep".to_string(), "ex/lease".to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let rows = store.scan(&KeyRange::prefix("ex/")).await.unwrap();
    assert_eq!(keys_of(&rows), vec!["ex/keep"]);
    let rows = store
        .scan(&KeyRange::prefix("ex/").descending())
        .await
        .unwrap();
    assert_eq!(keys_of(&rows), vec!["ex/keep"]);

    let retaken = store
        .write_if("ex/lease", Precondition::Absent, put(b"node-b", Some(ttl)))
        .await
        .unwrap();
    assert_eq!(retaken, WriteOutcome::Applied);
    assert_eq!(store.get("ex/lease").await.unwrap().unwrap().value, b"node-b");
}

pub async fn run_all(store: &dyn MetaStore, ttl: Duration) {
    conditional_writes(store).await;
    versions_change_on_recreate(store).await;
    get_many_skips_missing(store).await;
    scan_ranges(store).await;
    expired_keys_are_absent(store, ttl).await;
}
