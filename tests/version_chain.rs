//! Version-chain and lock behavior of the authoring store.

use std::time::Duration;

use draftsmith::sections::{NewDocument, NewSectionVersion, SectionError, SectionStore};
use draftsmith::types::DraftStatus;

async fn store() -> (SectionStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("authoring.db").display());
    let store = SectionStore::connect(&url).await.unwrap();
    (store, dir)
}

async fn section_with_versions(
    store: &SectionStore,
    contents: &[&str],
) -> draftsmith::sections::Section {
    let doc = store
        .create_document(NewDocument {
            title: "Plan".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let section = store.add_section(doc.id, "body", "Body", 0).await.unwrap();
    for content in contents {
        store
            .create_version(section.id, NewSectionVersion::human(*content, "alice"))
            .await
            .unwrap();
    }
    section
}

#[tokio::test]
async fn create_version_appends_and_repoints_current() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["one"]).await;

    assert_eq!(store.read_content(section.id).await.unwrap(), "one");
    store
        .create_version(section.id, NewSectionVersion::human("two", "alice"))
        .await
        .unwrap();
    assert_eq!(store.read_content(section.id).await.unwrap(), "two");

    let chain = store.list_versions(section.id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].seq, 1);
    assert_eq!(chain[1].seq, 2);
    // earlier versions are untouched
    assert_eq!(chain[0].content, "one");
}

#[tokio::test]
async fn read_content_is_empty_before_any_version() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &[]).await;
    assert_eq!(store.read_content(section.id).await.unwrap(), "");
}

#[tokio::test]
async fn undo_requires_two_versions() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["only"]).await;
    let err = store.undo(section.id).await.unwrap_err();
    assert!(matches!(err, SectionError::NoPreviousVersion));
}

#[tokio::test]
async fn repeated_undo_walks_strictly_backward_and_stops_at_head() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["v1", "v2", "v3"]).await;

    assert_eq!(store.read_content(section.id).await.unwrap(), "v3");
    store.undo(section.id).await.unwrap();
    assert_eq!(store.read_content(section.id).await.unwrap(), "v2");
    store.undo(section.id).await.unwrap();
    assert_eq!(store.read_content(section.id).await.unwrap(), "v1");
    let err = store.undo(section.id).await.unwrap_err();
    assert!(matches!(err, SectionError::NoPreviousVersion));

    // history survives the walk intact
    assert_eq!(store.list_versions(section.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn edit_after_undo_appends_at_chain_end() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["v1", "v2"]).await;

    store.undo(section.id).await.unwrap();
    assert_eq!(store.read_content(section.id).await.unwrap(), "v1");

    // a new edit goes to the end of the chain, not after the pointer
    store
        .create_version(section.id, NewSectionVersion::human("v3", "alice"))
        .await
        .unwrap();
    assert_eq!(store.read_content(section.id).await.unwrap(), "v3");
    let chain = store.list_versions(section.id).await.unwrap();
    assert_eq!(
        chain.iter().map(|v| v.content.as_str()).collect::<Vec<_>>(),
        vec!["v1", "v2", "v3"]
    );

    // undo from v3 steps to its creation-order predecessor, v2
    store.undo(section.id).await.unwrap();
    assert_eq!(store.read_content(section.id).await.unwrap(), "v2");
}

#[tokio::test]
async fn lock_conflicts_with_unexpired_foreign_owner() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["v1"]).await;

    store
        .acquire_lock(section.id, "alice", Some(Duration::from_secs(300)))
        .await
        .unwrap();
    let err = store
        .acquire_lock(section.id, "bob", Some(Duration::from_secs(300)))
        .await
        .unwrap_err();
    match err {
        SectionError::LockConflict { owner } => assert_eq!(owner, "alice"),
        other => panic!("expected LockConflict, got {other:?}"),
    }

    // same owner re-acquires idempotently
    store
        .acquire_lock(section.id, "alice", Some(Duration::from_secs(300)))
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_lock_is_acquirable_without_release() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["v1"]).await;

    // zero ttl: expired the moment it is compared against the clock
    store
        .acquire_lock(section.id, "alice", Some(Duration::ZERO))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let lock = store
        .acquire_lock(section.id, "bob", Some(Duration::from_secs(300)))
        .await
        .unwrap();
    assert_eq!(lock.owner, "bob");
}

#[tokio::test]
async fn release_owned_does_not_clear_a_stolen_lock() {
    let (store, _dir) = store().await;
    let section = section_with_versions(&store, &["v1"]).await;

    store
        .acquire_lock(section.id, "alice", Some(Duration::ZERO))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store
        .acquire_lock(section.id, "bob", Some(Duration::from_secs(300)))
        .await
        .unwrap();

    // alice's lease expired and bob re-acquired; alice's release is a no-op
    store.release_lock_owned(section.id, "alice").await.unwrap();
    let lock = store.get_lock(section.id).await.unwrap().unwrap();
    assert_eq!(lock.owner, "bob");
}

#[tokio::test]
async fn finalize_stamps_status_and_outcome() {
    let (store, _dir) = store().await;
    let doc = store
        .create_document(NewDocument {
            title: "Plan".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let finalized = store.finalize_document(doc.id, Some(true)).await.unwrap();
    assert_eq!(finalized.status, DraftStatus::Final);
    assert_eq!(finalized.success, Some(true));
    assert!(finalized.finalized_at.is_some());
}
