// Integration tests for the synchronization engine
// These run the engine against the in-memory remote store with scripted faults

use std::time::Duration;

use examsy_portal::cache::{FileCache, LocalCache, MemoryCache};
use examsy_portal::config::{CacheConfig, SyncConfig};
use examsy_portal::model::BulkStudentUpdate;
use examsy_portal::remote::{FetchFault, InMemoryRemote, WriteBehavior};
use examsy_portal::sync::RefreshOutcome;
use examsy_portal::{
    Action, Dataset, ExamSession, PortalError, Role, Room, Student, StudentStatus, SyncEngine,
    SyncStatus,
};

type Engine = SyncEngine<InMemoryRemote, MemoryCache>;

fn student(id: &str, room: Option<&str>) -> Student {
    Student {
        id: id.to_string(),
        display_name: format!("Student {}", id),
        class_label: "7".to_string(),
        credential_secret: "secret".to_string(),
        status: StudentStatus::NotStarted,
        room_ref: room.map(str::to_string),
    }
}

fn room(id: &str) -> Room {
    Room {
        id: id.to_string(),
        label: format!("ROOM {}", id),
        capacity: 30,
        proctor_username: Some(format!("proctor_{}", id)),
        proctor_secret: Some("proctor123".to_string()),
    }
}

fn seed() -> Dataset {
    Dataset {
        students: vec![
            student("1001", Some("r-1")),
            student("1002", Some("r-2")),
            student("1003", None),
        ],
        sessions: vec![ExamSession {
            id: "s-1".to_string(),
            label: "Mathematics".to_string(),
            class_label: "7".to_string(),
            access_code: "ABCD".to_string(),
            duration_minutes: 90,
            is_active: true,
            external_document_ref: None,
        }],
        rooms: vec![room("r-1"), room("r-2")],
    }
}

async fn engine() -> Engine {
    let engine = SyncEngine::new(
        InMemoryRemote::new(seed()),
        MemoryCache::default(),
        SyncConfig::default(),
    );
    assert_eq!(engine.bootstrap().await, RefreshOutcome::Accepted);
    engine
}

fn set_status(id: &str, status: StudentStatus) -> Action {
    Action::UpdateStudentStatus {
        id: id.to_string(),
        status,
    }
}

#[tokio::test]
async fn test_update_student_is_idempotent() {
    let engine = engine().await;
    let mut edited = student("1001", Some("r-1"));
    edited.display_name = "Renamed".to_string();

    assert!(engine.dispatch(&Role::Admin, Action::UpdateStudent(edited.clone())).await.unwrap());
    let once = engine.current_dataset();
    assert!(engine.dispatch(&Role::Admin, Action::UpdateStudent(edited)).await.unwrap());
    let twice = engine.current_dataset();

    assert_eq!(*once, *twice);
    assert_eq!(engine.remote().dataset(), *twice);
    assert_eq!(twice.student("1001").unwrap().display_name, "Renamed");
}

#[tokio::test]
async fn test_empty_snapshot_never_erases_known_data() {
    let engine = engine().await;
    let before = engine.current_dataset();

    engine.remote().push_fetch_fault(FetchFault::Empty);
    assert!(matches!(engine.refresh().await, RefreshOutcome::Stale(_)));
    assert_eq!(engine.status(), SyncStatus::Stale);
    assert_eq!(*engine.current_dataset(), *before);

    // The next good read brings the engine back online.
    assert_eq!(engine.refresh().await, RefreshOutcome::Accepted);
    assert_eq!(engine.status(), SyncStatus::Online);
}

#[tokio::test]
async fn test_status_feed_tracks_read_health() {
    let engine = SyncEngine::new(
        InMemoryRemote::new(seed()),
        MemoryCache::default(),
        SyncConfig::default(),
    );
    let mut status = engine.subscribe_status();
    assert_eq!(*status.borrow_and_update(), SyncStatus::Loading);

    engine.bootstrap().await;
    assert_eq!(*status.borrow_and_update(), SyncStatus::Online);

    engine.remote().push_fetch_fault(FetchFault::Fail);
    engine.refresh().await;
    assert_eq!(*status.borrow_and_update(), SyncStatus::Stale);

    // Another operator rewrote the store in the meantime.
    let mut replaced = seed();
    replaced.rooms.push(room("r-3"));
    engine.remote().set_dataset(replaced.clone());
    engine.refresh().await;

    assert_eq!(*status.borrow_and_update(), SyncStatus::Online);
    assert_eq!(*engine.current_dataset(), replaced);
}

#[tokio::test]
async fn test_read_failure_serves_last_known_good() {
    let engine = engine().await;
    engine.remote().push_fetch_fault(FetchFault::Fail);

    assert!(matches!(engine.refresh().await, RefreshOutcome::Stale(_)));
    assert_eq!(engine.current_dataset().students.len(), 3);
    assert_eq!(engine.status(), SyncStatus::Stale);
}

#[tokio::test]
async fn test_file_cache_survives_restart_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig {
        dir: dir.path().to_path_buf(),
        key: "examsy_backup".to_string(),
    };

    let first = SyncEngine::new(
        InMemoryRemote::new(seed()),
        FileCache::new(&cache_config),
        SyncConfig::default(),
    );
    assert_eq!(first.bootstrap().await, RefreshOutcome::Accepted);
    drop(first);

    let offline = InMemoryRemote::new(Dataset::default());
    offline.push_fetch_fault(FetchFault::Fail);
    let second = SyncEngine::new(offline, FileCache::new(&cache_config), SyncConfig::default());

    assert!(matches!(second.bootstrap().await, RefreshOutcome::Stale(_)));
    assert_eq!(*second.current_dataset(), seed());
    assert_eq!(second.status(), SyncStatus::Stale);
}

#[tokio::test]
async fn test_proctor_limited_to_own_room() {
    let engine = engine().await;
    let proctor = Role::Proctor {
        room_id: "r-1".to_string(),
    };

    assert!(engine
        .dispatch(&proctor, set_status("1001", StudentStatus::Blocked))
        .await
        .unwrap());
    assert_eq!(engine.student_status("1001"), Some(StudentStatus::Blocked));

    let other_room = engine
        .dispatch(&proctor, set_status("1002", StudentStatus::Blocked))
        .await;
    assert!(matches!(other_room, Err(PortalError::Forbidden { .. })));
    assert_eq!(engine.student_status("1002"), Some(StudentStatus::NotStarted));

    let overwrite = engine
        .dispatch(&proctor, Action::SyncAll((*engine.current_dataset()).clone()))
        .await;
    assert!(matches!(overwrite, Err(PortalError::Forbidden { .. })));

    let staged = engine
        .stage(&proctor, set_status("1001", StudentStatus::NotStarted))
        .await;
    assert!(matches!(staged, Err(PortalError::Forbidden { .. })));

    // Only the one permitted single-student write reached the remote store.
    let writes = engine.remote().writes();
    assert_eq!(writes, vec![set_status("1001", StudentStatus::Blocked)]);
}

#[tokio::test]
async fn test_bulk_update_reaches_remote() {
    let engine = engine().await;
    let bulk = Action::BulkUpdateStudents(BulkStudentUpdate {
        ids: vec!["1001".to_string(), " 1003 ".to_string()],
        status: Some(StudentStatus::NotStarted),
        room: Some(examsy_portal::model::RoomChange::Assign("r-2".to_string())),
    });

    assert!(engine.dispatch(&Role::Admin, bulk).await.unwrap());

    let remote = engine.remote().dataset();
    assert_eq!(remote.students_in_room("r-2").count(), 3);
    assert_eq!(*engine.current_dataset(), remote);
}

#[tokio::test]
async fn test_unconfirmed_write_reverts_on_next_poll() {
    let engine = engine().await;
    engine.remote().set_write_behavior(WriteBehavior::AmbiguousDropped);

    let confirmed = engine
        .dispatch(&Role::Admin, set_status("1001", StudentStatus::Completed))
        .await
        .unwrap();

    // Optimistic state stands until the next read.
    assert!(confirmed);
    assert_eq!(engine.student_status("1001"), Some(StudentStatus::Completed));

    assert_eq!(engine.refresh().await, RefreshOutcome::Accepted);
    assert_eq!(engine.student_status("1001"), Some(StudentStatus::NotStarted));
}

#[tokio::test]
async fn test_applied_ambiguous_write_survives_poll() {
    let engine = engine().await;
    engine.remote().set_write_behavior(WriteBehavior::AmbiguousApplied);

    assert!(engine
        .dispatch(&Role::Admin, set_status("1001", StudentStatus::Completed))
        .await
        .unwrap());
    engine.refresh().await;

    assert_eq!(engine.student_status("1001"), Some(StudentStatus::Completed));
}

#[tokio::test]
async fn test_rejected_write_reconciles_with_remote() {
    let engine = engine().await;
    engine
        .remote()
        .set_write_behavior(WriteBehavior::Reject("sheet locked".to_string()));

    let confirmed = engine.dispatch(&Role::Admin, Action::AddRoom(room("r-3"))).await.unwrap();

    assert!(!confirmed);
    assert!(engine.current_dataset().room("r-3").is_none());
    assert_eq!(*engine.current_dataset(), engine.remote().dataset());
}

#[tokio::test]
async fn test_full_overwrite_refuses_empty_students() {
    let engine = engine().await;
    let emptied = Dataset {
        students: Vec::new(),
        ..seed()
    };

    let result = engine.dispatch(&Role::Admin, Action::SyncAll(emptied)).await;

    assert!(matches!(result, Err(PortalError::EmptyOverwrite)));
    assert!(engine.remote().writes().is_empty());
    assert_eq!(engine.current_dataset().students.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_staged_edits_coalesce_into_one_full_sync() {
    let engine = engine().await;

    engine
        .stage(&Role::Admin, Action::AddRoom(room("r-3")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine
        .stage(&Role::Admin, set_status("1003", StudentStatus::Blocked))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine
        .stage(&Role::Admin, Action::DeleteStudent { id: "1002".to_string() })
        .await
        .unwrap();

    // Quiet period restarts on every edit: nothing pushed yet.
    assert!(engine.has_pending_stage());
    assert!(engine.remote().writes().is_empty());

    // A poll landing now must not wipe the staged edits.
    assert_eq!(engine.refresh().await, RefreshOutcome::Superseded);
    assert_eq!(engine.student_status("1003"), Some(StudentStatus::Blocked));

    tokio::time::sleep(SyncConfig::default().debounce * 2).await;

    let writes = engine.remote().writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].is_full_overwrite());

    let remote = engine.remote().dataset();
    assert!(remote.room("r-3").is_some());
    assert!(remote.student("1002").is_none());
    assert_eq!(remote.student("1003").unwrap().status, StudentStatus::Blocked);
    assert_eq!(*engine.current_dataset(), remote);
}

#[tokio::test]
async fn test_file_cache_follows_accepted_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig {
        dir: dir.path().to_path_buf(),
        key: "examsy_backup".to_string(),
    };
    let engine = SyncEngine::new(
        InMemoryRemote::new(seed()),
        FileCache::new(&cache_config),
        SyncConfig::default(),
    );
    engine.bootstrap().await;

    engine
        .remote()
        .apply_external(&Action::AddRoom(room("r-9")))
        .unwrap();
    assert_eq!(engine.refresh().await, RefreshOutcome::Accepted);

    let cached = FileCache::new(&cache_config).load().await.unwrap().unwrap();
    assert!(cached.room("r-9").is_some());
    assert_eq!(cached, *engine.current_dataset());
}

#[tokio::test]
async fn test_room_edit_from_served_view_keeps_proctor_credentials() {
    let engine = engine().await;
    let mut edited = engine.current_dataset().redacted().rooms[0].clone();
    edited.capacity = 40;

    assert!(engine.dispatch(&Role::Admin, Action::UpdateRoom(edited)).await.unwrap());

    let remote = engine.remote().dataset();
    let stored = remote.room("r-1").unwrap();
    assert_eq!(stored.capacity, 40);
    assert_eq!(stored.proctor_secret.as_deref(), Some("proctor123"));
    assert_eq!(*engine.current_dataset(), remote);

    // The write itself carries the stored credentials upstream.
    match &engine.remote().writes()[0] {
        Action::UpdateRoom(sent) => assert_eq!(sent.proctor_secret.as_deref(), Some("proctor123")),
        other => panic!("unexpected write {:?}", other),
    }
}
