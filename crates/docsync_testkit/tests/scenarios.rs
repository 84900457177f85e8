//! End-to-end replication scenarios.
//!
//! Every test runs a real session over an in-memory connection, against
//! a passive peer or a scripted one.

use docsync_engine::{
    checkpoint_id, read_checkpoint, ActivityLevel, CollectionConfig, Direction, DocumentFlags,
    LocalConnector, PassiveOptions, ReplicationFilter, Replicator, ReplicatorConfig,
    ReplicatorType, Resolution, SyncError, DEFAULT_CONTINUOUS_MAX_ATTEMPTS,
    DEFAULT_ONE_SHOT_MAX_ATTEMPTS,
};
use docsync_protocol::{Message, RevisionErrorCode};
use docsync_store::{Document, DocumentStore, MemoryStore};
use docsync_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const COLL: &str = "animals";

/// Both stores share `doc1` ("Cat"), then each side edits it.
async fn diverged(local_name: &str, remote_name: &str) -> (Arc<MemoryStore>, Arc<MemoryStore>) {
    let remote = seeded_store("remote", COLL, &[("doc1", json!({"name": "Cat"}))]);
    let local = empty_store("local");
    let repl = local_replicator(&local, &remote, pull_config(&remote, COLL));
    let status = run_to_completion(&repl, false).await;
    assert_eq!(status.error, None);
    assert_eq!(read_string(&local, COLL, "doc1", "name").as_deref(), Some("Cat"));

    save(&remote, COLL, "doc1", json!({ "name": remote_name }));
    save(&local, COLL, "doc1", json!({ "name": local_name }));
    (local, remote)
}

fn with_resolver<R>(target: &MemoryStore, kind: ReplicatorType, resolver: R) -> ReplicatorConfig
where
    R: docsync_engine::ConflictResolver + 'static,
{
    one_shot_config(
        target,
        kind,
        CollectionConfig::new(COLL).with_conflict_resolver(resolver),
    )
}

fn fast_retry(target: &MemoryStore, max_attempts: u32) -> ReplicatorConfig {
    builder(target, ReplicatorType::Push)
        .with_max_attempts(max_attempts)
        .with_initial_retry_delay(Duration::from_millis(10))
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap()
}

fn name_filter() -> ReplicationFilter {
    ReplicationFilter::new("skip-donotpass", |doc: &Document, _| {
        doc.string("name") != Some("donotpass")
    })
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn push_filter_keeps_documents_back() {
    let local = seeded_store(
        "local",
        COLL,
        &[("doc1", json!({"name": "donotpass"})), ("doc2", json!({"name": "pass"}))],
    );
    let remote = empty_store("remote");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let filter = ReplicationFilter::new("count-and-skip", move |doc: &Document, flags| {
        counter.fetch_add(1, Ordering::SeqCst);
        assert!(!flags.contains(DocumentFlags::DELETED));
        doc.string("name") != Some("donotpass")
    });
    let config = one_shot_config(
        &remote,
        ReplicatorType::Push,
        CollectionConfig::new(COLL).with_push_filter(filter),
    );
    let repl = local_replicator(&local, &remote, config);
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(live_ids(&remote, COLL), vec!["doc2"]);
    assert_eq!(recorder.replicated_ids(Direction::Push), vec!["doc2"]);
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
}

#[tokio::test]
async fn document_id_allowlist_limits_both_directions() {
    let local = seeded_store("local", COLL, &[("a", json!({})), ("b", json!({}))]);
    let remote = seeded_store("remote", COLL, &[("c", json!({})), ("d", json!({}))]);
    let config = one_shot_config(
        &remote,
        ReplicatorType::PushAndPull,
        CollectionConfig::new(COLL).with_document_ids(["a", "d"]),
    );
    let repl = local_replicator(&local, &remote, config);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(live_ids(&remote, COLL), vec!["a", "c", "d"]);
    assert_eq!(live_ids(&local, COLL), vec!["a", "b", "d"]);
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn remote_wins_replaces_local_edit() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let config = with_resolver(
        &remote,
        ReplicatorType::Pull,
        resolver(|conflict| {
            assert_eq!(conflict.doc_id(), "doc1");
            assert_eq!(conflict.local().and_then(|d| d.string("name")), Some("Tiger"));
            assert_eq!(conflict.remote().and_then(|d| d.string("name")), Some("Lion"));
            Ok(Resolution::Remote)
        }),
    );
    let repl = local_replicator(&local, &remote, config);
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(read_string(&local, COLL, "doc1", "name").as_deref(), Some("Lion"));
    assert!(local.conflict(COLL, "doc1").unwrap().is_none());
    assert_eq!(recorder.replicated_ids(Direction::Pull), vec!["doc1"]);
    assert_eq!(repl.pending_conflict_count(), 0);
}

#[tokio::test]
async fn default_resolver_settles_conflicts() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let repl = local_replicator(&local, &remote, pull_config(&remote, COLL));

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert!(local.conflicted_ids(COLL).unwrap().is_empty());
    let name = read_string(&local, COLL, "doc1", "name");
    assert!(matches!(name.as_deref(), Some("Tiger") | Some("Lion")));
}

#[tokio::test]
async fn resolver_runs_again_after_local_edit() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let names = seen.clone();
    let inner = local.clone();
    let config = with_resolver(
        &remote,
        ReplicatorType::Pull,
        resolver(move |conflict| {
            let name = conflict
                .local()
                .and_then(|d| d.string("name"))
                .unwrap_or_default()
                .to_string();
            let first = {
                let mut names = names.lock();
                names.push(name);
                names.len() == 1
            };
            if first {
                save(&inner, COLL, "doc1", json!({"name": "Puma"}));
            }
            Ok(Resolution::Local)
        }),
    );
    let repl = local_replicator(&local, &remote, config);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(*seen.lock(), vec!["Tiger".to_string(), "Puma".to_string()]);
    assert_eq!(read_string(&local, COLL, "doc1", "name").as_deref(), Some("Puma"));
    assert!(local.conflict(COLL, "doc1").unwrap().is_none());
}

#[tokio::test]
async fn merged_resolution_reaches_the_peer() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let config = with_resolver(
        &remote,
        ReplicatorType::PushAndPull,
        resolver(|conflict| {
            let mut merged = conflict.remote().map(Document::to_mutable).unwrap_or_else(|| {
                Document::new(conflict.doc_id())
            });
            merged.set("name", "Liger");
            Ok(Resolution::Merged(merged))
        }),
    );
    let repl = local_replicator(&local, &remote, config);
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(read_string(&local, COLL, "doc1", "name").as_deref(), Some("Liger"));
    assert_eq!(read_string(&remote, COLL, "doc1", "name").as_deref(), Some("Liger"));
    assert!(remote.conflict(COLL, "doc1").unwrap().is_none());
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
    // The local edit was pushed before the conflict was resolved.
    assert!(recorder.document_errors().iter().all(|(id, err)| {
        id == "doc1"
            && matches!(
                err,
                SyncError::PushRejected {
                    code: RevisionErrorCode::Conflict,
                    ..
                }
            )
    }));
}

#[tokio::test]
async fn resolver_error_leaves_conflict_in_place() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let config = with_resolver(
        &remote,
        ReplicatorType::Pull,
        resolver(|_| Err("custom failure".into())),
    );
    let repl = local_replicator(&local, &remote, config);
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    let errors = recorder.document_errors();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        (id, SyncError::UnexpectedError { doc_id, message }) => {
            assert_eq!(id, "doc1");
            assert_eq!(doc_id, "doc1");
            assert!(message.contains("custom failure"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(local.conflict(COLL, "doc1").unwrap().is_some());
}

#[tokio::test]
async fn foreign_blob_in_resolution_is_rejected() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let elsewhere = empty_store("elsewhere");
    let blob = elsewhere.save_blob("text/plain", b"not here").unwrap();
    let config = with_resolver(
        &remote,
        ReplicatorType::Pull,
        resolver(move |conflict| {
            let mut merged = Document::new(conflict.doc_id());
            merged.set("name", "Liger").set_blob("photo", &blob);
            Ok(Resolution::Merged(merged))
        }),
    );
    let repl = local_replicator(&local, &remote, config);
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(
        recorder.document_errors(),
        vec![(
            "doc1".to_string(),
            SyncError::ForeignBlob {
                doc_id: "doc1".into()
            }
        )]
    );
    assert!(local.conflict(COLL, "doc1").unwrap().is_some());
}

#[tokio::test]
async fn purge_during_resolution_reports_not_found() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let inner = local.clone();
    let config = with_resolver(
        &remote,
        ReplicatorType::Pull,
        resolver(move |_| {
            inner.purge(COLL, "doc1").unwrap();
            Ok(Resolution::Remote)
        }),
    );
    let repl = local_replicator(&local, &remote, config);
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(
        recorder.document_errors(),
        vec![(
            "doc1".to_string(),
            SyncError::DocumentNotFound {
                doc_id: "doc1".into()
            }
        )]
    );
    assert!(local.get_including_deleted(COLL, "doc1").unwrap().is_none());
}

#[tokio::test]
async fn suspension_freezes_conflict_resolution() {
    let local = empty_store("local");
    let remote = empty_store("remote");
    for i in 0..20 {
        make_conflict(&local, COLL, &format!("doc-{i:02}"), "Cat", "Lion");
    }
    let config = builder(&remote, ReplicatorType::Pull)
        .with_continuous(true)
        .with_conflict_pool_size(1)
        .unwrap()
        .add_collection(CollectionConfig::new(COLL).with_conflict_resolver(resolver(|_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Resolution::Local)
        })))
        .unwrap()
        .build()
        .unwrap();
    let repl = local_replicator(&local, &remote, config);
    repl.start(false).unwrap();

    eventually(|| {
        let pending = repl.pending_conflict_count();
        pending > 0 && pending < 20
    })
    .await;
    repl.set_suspended(true);
    eventually(|| repl.status().activity == ActivityLevel::Offline).await;

    // Let the resolution that was already running finish.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frozen = repl.pending_conflict_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(repl.pending_conflict_count(), frozen);
    assert!(frozen > 0);

    repl.set_suspended(false);
    eventually(|| repl.pending_conflict_count() == 0).await;
    assert!(local.conflicted_ids(COLL).unwrap().is_empty());

    let status = repl.shutdown().await;
    assert_eq!(status.error, None);
}

// ============================================================================
// Pending documents and checkpoints
// ============================================================================

#[tokio::test]
async fn deleted_document_is_pending_until_pushed() {
    let local = numbered_store("local", COLL, 50);
    let remote = empty_store("remote");
    let repl = local_replicator(&local, &remote, push_config(&remote, COLL));
    assert_eq!(repl.pending_document_ids(COLL).unwrap().len(), 50);

    let status = run_to_completion(&repl, false).await;
    assert_eq!(status.error, None);
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
    assert_eq!(remote.document_count(COLL).unwrap(), 50);

    local.delete(COLL, "doc-007").unwrap();
    let pending = repl.pending_document_ids(COLL).unwrap();
    assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec!["doc-007"]);
    assert!(repl.is_document_pending("doc-007", COLL).unwrap());
    assert!(!repl.is_document_pending("doc-008", COLL).unwrap());

    let status = run_to_completion(&repl, false).await;
    assert_eq!(status.error, None);
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
    assert!(remote.get(COLL, "doc-007").unwrap().is_none());
    assert!(remote
        .get_including_deleted(COLL, "doc-007")
        .unwrap()
        .is_some_and(|d| d.is_deleted()));
}

#[tokio::test]
async fn pending_ids_require_a_push_replicator() {
    let local = numbered_store("local", COLL, 3);
    let remote = empty_store("remote");
    let repl = local_replicator(&local, &remote, pull_config(&remote, COLL));
    assert!(matches!(
        repl.pending_document_ids(COLL),
        Err(SyncError::InvalidOperation(_))
    ));
    assert!(matches!(
        repl.is_document_pending("doc-000", COLL),
        Err(SyncError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn closed_database_is_reported() {
    let local = numbered_store("local", COLL, 3);
    let remote = empty_store("remote");
    let repl = local_replicator(&local, &remote, push_config(&remote, COLL));
    local.close();

    assert_eq!(
        repl.pending_document_ids(COLL).unwrap_err(),
        SyncError::DatabaseClosed
    );
    assert_eq!(repl.start(false).unwrap_err(), SyncError::DatabaseClosed);
    assert!(matches!(
        Replicator::new(
            push_config(&remote, COLL),
            local.clone(),
            LocalConnector::new(remote.clone())
        ),
        Err(SyncError::DatabaseClosed)
    ));
}

#[tokio::test]
async fn reset_checkpoint_pulls_everything_again() {
    let local = empty_store("local");
    let remote = numbered_store("remote", COLL, 10);
    let repl = local_replicator(&local, &remote, pull_config(&remote, COLL));

    run_to_completion(&repl, false).await;
    assert_eq!(live_ids(&local, COLL).len(), 10);

    for id in live_ids(&local, COLL) {
        local.purge(COLL, &id).unwrap();
    }
    let status = run_to_completion(&repl, false).await;
    assert_eq!(status.error, None);
    assert!(live_ids(&local, COLL).is_empty());

    let status = run_to_completion(&repl, true).await;
    assert_eq!(status.error, None);
    assert_eq!(live_ids(&local, COLL), live_ids(&remote, COLL));
}

#[tokio::test]
async fn reset_push_of_synced_collection_changes_nothing() {
    let local = numbered_store("local", COLL, 10);
    let remote = empty_store("remote");
    let repl = local_replicator(&local, &remote, push_config(&remote, COLL));
    assert_eq!(run_to_completion(&repl, false).await.error, None);

    let revisions = |store: &MemoryStore| -> Vec<_> {
        live_ids(store, COLL)
            .into_iter()
            .map(|id| {
                let doc = store.get(COLL, &id).unwrap().unwrap();
                (id, doc.revision().cloned())
            })
            .collect()
    };
    let before = revisions(&remote);

    assert_eq!(run_to_completion(&repl, true).await.error, None);
    assert_eq!(revisions(&remote), before);
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
}

#[tokio::test]
async fn rejected_push_stays_pending() {
    let (local, remote) = diverged("Tiger", "Lion").await;
    let repl = local_replicator(&local, &remote, push_config(&remote, COLL));
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    let errors = recorder.document_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "doc1");
    assert!(matches!(
        errors[0].1,
        SyncError::PushRejected {
            code: RevisionErrorCode::Conflict,
            ..
        }
    ));
    assert_eq!(read_string(&remote, COLL, "doc1", "name").as_deref(), Some("Lion"));
    assert!(repl.is_document_pending("doc1", COLL).unwrap());

    // Nothing new to push, but the rejection is remembered.
    assert_eq!(run_to_completion(&repl, false).await.error, None);
    assert!(repl.is_document_pending("doc1", COLL).unwrap());

    let pull = with_resolver(
        &remote,
        ReplicatorType::Pull,
        resolver(|_| Ok(Resolution::Remote)),
    );
    let status = run_to_completion(&local_replicator(&local, &remote, pull), false).await;
    assert_eq!(status.error, None);
    assert_eq!(read_string(&local, COLL, "doc1", "name").as_deref(), Some("Lion"));
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
}

// ============================================================================
// Access removal
// ============================================================================

async fn revoke_doc1(auto_purge: bool) -> (Arc<MemoryStore>, EventRecorder) {
    let remote = seeded_store(
        "remote",
        COLL,
        &[("doc1", json!({"name": "Cat"})), ("doc2", json!({"name": "Dog"}))],
    );
    let local = empty_store("local");
    run_to_completion(
        &local_replicator(&local, &remote, pull_config(&remote, COLL)),
        false,
    )
    .await;
    assert_eq!(live_ids(&local, COLL), vec!["doc1", "doc2"]);

    save(&remote, COLL, "doc1", json!({"name": "Lion"}));
    let config = builder(&remote, ReplicatorType::Pull)
        .with_auto_purge(auto_purge)
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap();
    let connector = LocalConnector::new(remote.clone()).with_options(
        PassiveOptions::default().with_access_check(|_, doc_id| doc_id != "doc1"),
    );
    let repl = Replicator::new(config, local.clone(), connector).unwrap();
    let recorder = EventRecorder::attach(&repl);
    let status = run_to_completion(&repl, false).await;
    assert_eq!(status.error, None);
    (local, recorder)
}

#[tokio::test]
async fn access_removed_document_is_purged() {
    let (local, recorder) = revoke_doc1(true).await;

    assert_eq!(live_ids(&local, COLL), vec!["doc2"]);
    assert!(local.get_including_deleted(COLL, "doc1").unwrap().is_none());
    let removed = recorder.flagged(DocumentFlags::ACCESS_REMOVED);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].document.id, "doc1");
    assert_eq!(removed[0].direction, Direction::Pull);
}

#[tokio::test]
async fn access_removed_document_is_kept_without_auto_purge() {
    let (local, recorder) = revoke_doc1(false).await;

    assert_eq!(live_ids(&local, COLL), vec!["doc1", "doc2"]);
    assert_eq!(read_string(&local, COLL, "doc1", "name").as_deref(), Some("Cat"));
    assert!(recorder.flagged(DocumentFlags::ACCESS_REMOVED).is_empty());
}

// ============================================================================
// Configuration and retries
// ============================================================================

#[test]
fn max_attempts_defaults_depend_on_mode() {
    let remote = empty_store("remote");
    let one_shot = push_config(&remote, COLL);
    assert_eq!(one_shot.max_attempts(), DEFAULT_ONE_SHOT_MAX_ATTEMPTS);
    assert_eq!(one_shot.max_attempts(), 10);

    let continuous = builder(&remote, ReplicatorType::Push)
        .with_continuous(true)
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(continuous.max_attempts(), DEFAULT_CONTINUOUS_MAX_ATTEMPTS);
    assert_eq!(continuous.max_attempts(), u32::MAX);

    let explicit = builder(&remote, ReplicatorType::Push)
        .with_max_attempts(3)
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(explicit.max_attempts(), 3);
}

#[test]
fn sub_second_intervals_are_rejected() {
    let remote = empty_store("remote");
    assert!(matches!(
        builder(&remote, ReplicatorType::Push).with_heartbeat(Duration::from_millis(500)),
        Err(SyncError::InvalidConfig(_))
    ));
    assert!(matches!(
        builder(&remote, ReplicatorType::Push)
            .with_max_attempts_wait_time(Duration::from_millis(999)),
        Err(SyncError::InvalidConfig(_))
    ));
    assert!(builder(&remote, ReplicatorType::Push)
        .with_heartbeat(Duration::from_secs(1))
        .is_ok());
}

#[tokio::test]
async fn permanent_error_stops_after_one_attempt() {
    let local = numbered_store("local", COLL, 2);
    let remote = empty_store("remote");
    let connector = FlakyConnector::always(
        LocalConnector::new(remote.clone()),
        SyncError::Unauthorized("bad password".into()),
    );
    let attempts = connector.attempts();
    let repl = Replicator::new(fast_retry(&remote, 5), local.clone(), connector).unwrap();

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, Some(SyncError::Unauthorized("bad password".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(live_ids(&remote, COLL).is_empty());
}

#[tokio::test]
async fn recoverable_error_retries_up_to_max_attempts() {
    let local = numbered_store("local", COLL, 2);
    let remote = empty_store("remote");
    let connector = FlakyConnector::always(
        LocalConnector::new(remote.clone()),
        SyncError::transport_retryable("connection refused"),
    );
    let attempts = connector.attempts();
    let repl = Replicator::new(fast_retry(&remote, 3), local.clone(), connector).unwrap();
    let recorder = EventRecorder::attach(&repl);

    let status = run_to_completion(&repl, false).await;

    assert_eq!(
        status.error,
        Some(SyncError::transport_retryable("connection refused"))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(recorder.saw(ActivityLevel::Offline));
}

#[tokio::test]
async fn recovers_after_transient_failures() {
    let local = numbered_store("local", COLL, 5);
    let remote = empty_store("remote");
    let connector = FlakyConnector::new(
        LocalConnector::new(remote.clone()),
        SyncError::transport_retryable("connection reset"),
        2,
    );
    let attempts = connector.attempts();
    let repl = Replicator::new(fast_retry(&remote, 10), local.clone(), connector).unwrap();

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, None);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(live_ids(&remote, COLL), live_ids(&local, COLL));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let local = numbered_store("local", COLL, 1);
    let remote = empty_store("remote");
    let config = builder(&remote, ReplicatorType::Push)
        .with_heartbeat(Duration::from_secs(1))
        .unwrap()
        .with_max_attempts(1)
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap();
    let connector = SilentConnector::new();
    let attempts = connector.attempts();
    let repl = Replicator::new(config, local.clone(), connector).unwrap();

    let status = run_to_completion(&repl, false).await;

    assert_eq!(status.error, Some(SyncError::Timeout));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

fn heartbeat_config(target: &MemoryStore) -> ReplicatorConfig {
    builder(target, ReplicatorType::Push)
        .with_continuous(true)
        .with_heartbeat(Duration::from_secs(1))
        .unwrap()
        .with_initial_retry_delay(Duration::from_millis(10))
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
async fn idle_peer_without_pongs_times_out_and_reconnects() {
    let local = numbered_store("local", COLL, 2);
    let remote = empty_store("remote");
    let connector = ScriptedConnector::new().without_pongs();
    let attempts = connector.attempts();
    let repl = Replicator::new(heartbeat_config(&remote), local.clone(), connector).unwrap();
    let recorder = EventRecorder::attach(&repl);

    repl.start(false).unwrap();
    eventually(|| attempts.load(Ordering::SeqCst) >= 2).await;

    assert!(recorder.saw(ActivityLevel::Idle));
    assert!(recorder
        .statuses()
        .iter()
        .any(|s| s.activity == ActivityLevel::Offline && s.error == Some(SyncError::Timeout)));

    let status = tokio::time::timeout(TEST_TIMEOUT, repl.shutdown())
        .await
        .unwrap();
    assert_eq!(status.error, None);
}

#[tokio::test]
async fn pongs_keep_an_idle_session_alive() {
    let local = numbered_store("local", COLL, 2);
    let remote = empty_store("remote");
    let connector = ScriptedConnector::new();
    let attempts = connector.attempts();
    let repl = Replicator::new(heartbeat_config(&remote), local.clone(), connector).unwrap();
    let recorder = EventRecorder::attach(&repl);

    repl.start(false).unwrap();
    eventually(|| repl.status().activity == ActivityLevel::Idle).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(repl.status().activity, ActivityLevel::Idle);
    assert!(!recorder.saw(ActivityLevel::Offline));

    let status = tokio::time::timeout(TEST_TIMEOUT, repl.shutdown())
        .await
        .unwrap();
    assert_eq!(status.error, None);
}

#[tokio::test]
async fn stop_waits_for_in_flight_push() {
    let local = numbered_store("local", COLL, 3);
    let remote = empty_store("remote");
    let connector = ScriptedConnector::new().with_held_acks();
    let pushes = connector.pushes();
    let gate = connector.ack_gate();
    let repl = Replicator::new(push_config(&remote, COLL), local.clone(), connector).unwrap();
    let recorder = EventRecorder::attach(&repl);

    repl.start(false).unwrap();
    eventually(|| pushes.load(Ordering::SeqCst) == 1).await;
    repl.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ne!(repl.status().activity, ActivityLevel::Stopped);

    gate.notify_one();
    let status = tokio::time::timeout(TEST_TIMEOUT, repl.wait_until_stopped())
        .await
        .unwrap();

    assert_eq!(status.error, None);
    assert_eq!(
        recorder.replicated_ids(Direction::Push),
        vec!["doc-000", "doc-001", "doc-002"]
    );
    let remote_key = repl.config().endpoint().key();
    for id in ["doc-000", "doc-001", "doc-002"] {
        let current = local.get(COLL, id).unwrap().unwrap().revision().cloned();
        assert_eq!(local.remote_revision(COLL, id, &remote_key).unwrap(), current);
    }
    assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
}

#[tokio::test]
async fn dropped_replicator_waits_quietly_for_in_flight_push() {
    let local = numbered_store("local", COLL, 3);
    let remote = empty_store("remote");
    let connector = ScriptedConnector::new().with_held_acks();
    let pushes = connector.pushes();
    let receives = connector.receives();
    let gate = connector.ack_gate();
    let repl = Replicator::new(push_config(&remote, COLL), local.clone(), connector).unwrap();
    let mut status = repl.status_watch();

    repl.start(false).unwrap();
    eventually(|| pushes.load(Ordering::SeqCst) == 1).await;
    drop(repl);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = receives.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(receives.load(Ordering::SeqCst) - before < 10);

    gate.notify_one();
    tokio::time::timeout(
        TEST_TIMEOUT,
        status.wait_for(|s| s.activity == ActivityLevel::Stopped),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn changes_arriving_while_stopping_are_ignored() {
    let local = numbered_store("local", COLL, 1);
    let remote = empty_store("remote");
    let late = seeded_store("late", COLL, &[("owl", json!({"name": "Owl"}))]);
    let rev = late.export_revision(COLL, "owl").unwrap().unwrap();
    let connector = ScriptedConnector::new()
        .with_held_acks()
        .with_message_before_ack(Message::Changes {
            collection: COLL.to_string(),
            revs: vec![rev],
            last_seq: 1,
            caught_up: true,
        });
    let pushes = connector.pushes();
    let gate = connector.ack_gate();
    let config = one_shot_config(
        &remote,
        ReplicatorType::PushAndPull,
        CollectionConfig::new(COLL),
    );
    let repl = Replicator::new(config, local.clone(), connector).unwrap();

    repl.start(false).unwrap();
    eventually(|| pushes.load(Ordering::SeqCst) == 1).await;
    repl.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.notify_one();
    let status = tokio::time::timeout(TEST_TIMEOUT, repl.wait_until_stopped())
        .await
        .unwrap();

    assert_eq!(status.error, None);
    assert!(local.get_including_deleted(COLL, "owl").unwrap().is_none());
    let key = checkpoint_id(local.id(), &CollectionConfig::new(COLL), repl.config().endpoint());
    assert_eq!(read_checkpoint(local.as_ref(), &key).unwrap().pull, 0);
}

#[tokio::test]
async fn stop_before_connect_finishes_cleanly() {
    let local = numbered_store("local", COLL, 1);
    let remote = empty_store("remote");
    let repl = Replicator::new(push_config(&remote, COLL), local.clone(), HangingConnector).unwrap();
    let recorder = EventRecorder::attach(&repl);

    repl.start(false).unwrap();
    assert_eq!(repl.status().activity, ActivityLevel::Connecting);
    let status = tokio::time::timeout(TEST_TIMEOUT, repl.shutdown())
        .await
        .unwrap();

    assert_eq!(status.activity, ActivityLevel::Stopped);
    assert_eq!(status.error, None);
    assert_eq!(recorder.activities().last(), Some(&ActivityLevel::Stopped));
}

#[tokio::test]
async fn suspend_toggling_does_not_get_stuck() {
    let local = numbered_store("local", COLL, 5);
    let remote = empty_store("remote");
    let config = builder(&remote, ReplicatorType::Push)
        .with_continuous(true)
        .add_collection(CollectionConfig::new(COLL))
        .unwrap()
        .build()
        .unwrap();
    let repl = local_replicator(&local, &remote, config);
    repl.start(false).unwrap();
    eventually(|| repl.status().activity == ActivityLevel::Idle).await;

    for _ in 0..5 {
        repl.set_suspended(true);
        repl.set_suspended(false);
    }
    repl.set_suspended(true);
    eventually(|| repl.status().activity == ActivityLevel::Offline).await;
    assert!(repl.is_suspended());

    save(&local, COLL, "late", json!({"name": "written while suspended"}));
    repl.set_suspended(false);
    eventually(|| remote.get(COLL, "late").unwrap().is_some()).await;
    eventually(|| repl.status().activity == ActivityLevel::Idle).await;

    let status = repl.shutdown().await;
    assert_eq!(status.error, None);
}

// ============================================================================
// Property-based
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn filtered_push_leaves_nothing_pending(docs in document_set_strategy(12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let local = empty_store("local");
            let remote = empty_store("remote");
            let mut accepted = Vec::new();
            for (id, mut body, pass) in docs {
                body.insert("pass".into(), Value::Bool(pass));
                local
                    .save(COLL, &Document::with_properties(id.clone(), body))
                    .unwrap();
                if pass {
                    accepted.push(id);
                }
            }
            accepted.sort();

            let filter = ReplicationFilter::new("pass-only", |doc: &Document, _| {
                doc.get("pass") == Some(&Value::Bool(true))
            });
            let config = one_shot_config(
                &remote,
                ReplicatorType::Push,
                CollectionConfig::new(COLL).with_push_filter(filter),
            );
            let repl = local_replicator(&local, &remote, config);
            let status = run_to_completion(&repl, false).await;

            assert_eq!(status.error, None);
            assert_eq!(live_ids(&remote, COLL), accepted);
            assert!(repl.pending_document_ids(COLL).unwrap().is_empty());
        });
    }
}

#[tokio::test]
async fn name_filter_is_stable_across_runs() {
    let local = seeded_store("local", COLL, &[("doc1", json!({"name": "donotpass"}))]);
    let remote = empty_store("remote");
    let config = one_shot_config(
        &remote,
        ReplicatorType::Push,
        CollectionConfig::new(COLL).with_push_filter(name_filter()),
    );
    let repl = local_replicator(&local, &remote, config);
    run_to_completion(&repl, false).await;
    assert!(live_ids(&remote, COLL).is_empty());

    save(&local, COLL, "doc1", json!({"name": "pass"}));
    run_to_completion(&repl, false).await;
    assert_eq!(live_ids(&remote, COLL), vec!["doc1"]);
}
