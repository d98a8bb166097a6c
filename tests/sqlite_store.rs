//! SQLite store integration tests.
//!
//! Every storage contract is exercised against a database file in a temp
//! directory, including reopening the file to check nothing lives only in
//! memory.
//!
//! Run with: `cargo test --features persistence --test sqlite_store`

use chrono::{DateTime, Duration, TimeZone, Utc};
use run_tracker::geo_utils::destination_point;
use run_tracker::{
    AchievementDetector, AchievementRepository, AchievementType, ActivityPatch, ActivityRepository,
    ActivitySession, GeoSample, PersistenceError, PersonalRecord, RecordCategory,
    RecordRepository, SessionState, SnapshotStore, SqliteStore,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Helper: open a store on a fresh database file, return store + temp dir.
fn setup_store() -> (SqliteStore, TempDir) {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let store = open(&tmp_dir);
    (store, tmp_dir)
}

fn open(dir: &TempDir) -> SqliteStore {
    let db_path = dir.path().join("tracker.db");
    SqliteStore::new(db_path.to_str().unwrap()).expect("failed to open store")
}

fn t(day: u32, secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, day, 6, 0, 0).unwrap() + Duration::seconds(secs)
}

/// A completed run heading east, `meters` long over `seconds`.
fn completed(id: &str, day: u32, meters: f64, seconds: i64) -> ActivitySession {
    let mut session = ActivitySession::new(id, t(day, 0));
    session.start(t(day, 0)).unwrap();
    session.activate(t(day, 0)).unwrap();
    for i in 0..=10 {
        let (lat, lon) = destination_point(46.5, 6.6, 90.0, meters * i as f64 / 10.0);
        session.append_sample(GeoSample::new(lat, lon, t(day, seconds * i / 10)).with_altitude(400.0));
    }
    session.stop(t(day, seconds)).unwrap();
    session.complete(t(day, seconds)).unwrap();
    session
}

// ============================================================================
// Activities
// ============================================================================

#[tokio::test]
async fn test_activity_round_trip_survives_reopen() {
    let (store, dir) = setup_store();
    let session = completed("run-1", 3, 4_000.0, 1_300);
    ActivityRepository::save(&store, &session).await.unwrap();
    drop(store);

    let store = open(&dir);
    let loaded = store.find_by_id("run-1").await.unwrap().expect("stored");
    assert_eq!(loaded.state(), SessionState::Completed);
    assert_eq!(loaded.samples(), session.samples());
    assert_eq!(loaded.start_time(), session.start_time());
    assert_eq!(loaded.end_time(), session.end_time());
    assert_eq!(loaded.summary(), session.summary());
}

#[tokio::test]
async fn test_activities_listed_oldest_first() {
    let (store, _dir) = setup_store();
    for (id, day) in [("c", 9), ("a", 2), ("b", 5)] {
        ActivityRepository::save(&store, &completed(id, day, 2_000.0, 700))
            .await
            .unwrap();
    }

    let ids: Vec<String> = ActivityRepository::find_all(&store)
        .await
        .unwrap()
        .iter()
        .map(|s| s.id().to_string())
        .collect();
    assert_eq!(ids, ["a", "b", "c"]);
}

#[tokio::test]
async fn test_only_completed_activities_are_accepted() {
    let (store, _dir) = setup_store();
    let mut session = ActivitySession::new("live", t(1, 0));
    session.start(t(1, 0)).unwrap();
    session.activate(t(1, 0)).unwrap();

    let err = ActivityRepository::save(&store, &session).await.unwrap_err();
    assert!(matches!(err, PersistenceError::ValidationFailed(_)));
    assert!(store.find_by_id("live").await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_and_delete_activity() {
    let (store, _dir) = setup_store();
    ActivityRepository::save(&store, &completed("run-1", 3, 3_000.0, 1_000))
        .await
        .unwrap();

    let patch = ActivityPatch {
        name: Some("Lakeside".to_string()),
        notes: None,
    };
    let updated = store.update("run-1", &patch).await.unwrap();
    assert_eq!(updated.name(), Some("Lakeside"));
    let reloaded = store.find_by_id("run-1").await.unwrap().unwrap();
    assert_eq!(reloaded.name(), Some("Lakeside"));
    assert_eq!(reloaded.notes(), None);

    store.delete("run-1").await.unwrap();
    assert!(matches!(
        store.delete("run-1").await,
        Err(PersistenceError::NotFound(_))
    ));
    assert!(matches!(
        store.update("run-1", &patch).await,
        Err(PersistenceError::NotFound(_))
    ));
}

// ============================================================================
// Records and achievements
// ============================================================================

#[tokio::test]
async fn test_record_replaced_per_category() {
    let (store, _dir) = setup_store();
    let first = PersonalRecord {
        category: RecordCategory::LongestDistance,
        value: 8_000.0,
        source_session_id: "run-1".to_string(),
        achieved_at: t(1, 0),
        previous_value: None,
    };
    let better = PersonalRecord {
        value: 12_000.0,
        source_session_id: "run-2".to_string(),
        achieved_at: t(8, 0),
        previous_value: Some(8_000.0),
        ..first.clone()
    };
    RecordRepository::save(&store, &first).await.unwrap();
    RecordRepository::save(&store, &better).await.unwrap();

    assert_eq!(RecordRepository::find_all(&store).await.unwrap(), vec![better.clone()]);
    assert_eq!(
        store
            .find_by_category(RecordCategory::LongestDistance)
            .await
            .unwrap(),
        Some(better)
    );
    assert!(store
        .find_by_category(RecordCategory::FastestPace10k)
        .await
        .unwrap()
        .is_none());

    RecordRepository::delete_by_id(&store, "LONGEST_DISTANCE").await.unwrap();
    assert!(RecordRepository::find_all(&store).await.unwrap().is_empty());
    assert!(matches!(
        RecordRepository::delete_by_id(&store, "LONGEST_DISTANCE").await,
        Err(PersistenceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_achievements_round_trip() {
    let (store, _dir) = setup_store();
    let run = completed("run-1", 3, 5_100.0, 1_500).summary().unwrap();
    let earned = AchievementDetector::new().detect(&run, &[], &[]);
    assert!(!earned.is_empty());

    for achievement in &earned {
        AchievementRepository::save(&store, achievement).await.unwrap();
        // Saving again keeps one row per key
        AchievementRepository::save(&store, achievement).await.unwrap();
    }

    let mut stored = AchievementRepository::find_all(&store).await.unwrap();
    assert_eq!(stored.len(), earned.len());
    stored.sort_by_key(|a| a.id());
    let mut expected = earned.clone();
    expected.sort_by_key(|a| a.id());
    assert_eq!(stored, expected);

    let first = store
        .find_by_type(AchievementType::FirstActivity)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].source_session_id.as_deref(), Some("run-1"));

    AchievementRepository::delete_by_id(&store, &first[0].id())
        .await
        .unwrap();
    assert_eq!(
        AchievementRepository::find_all(&store).await.unwrap().len(),
        earned.len() - 1
    );
    AchievementRepository::delete_all(&store).await.unwrap();
    assert!(AchievementRepository::find_all(&store).await.unwrap().is_empty());
}

// ============================================================================
// Snapshot slot
// ============================================================================

#[tokio::test]
async fn test_snapshot_slot_holds_one_document() {
    let (store, dir) = setup_store();
    assert!(SnapshotStore::load(&store).await.unwrap().is_none());

    SnapshotStore::save(&store, "{\"first\":true}").await.unwrap();
    SnapshotStore::save(&store, "{\"second\":true}").await.unwrap();
    drop(store);

    let store = open(&dir);
    assert_eq!(
        SnapshotStore::load(&store).await.unwrap().as_deref(),
        Some("{\"second\":true}")
    );
    store.clear().await.unwrap();
    assert!(SnapshotStore::load(&store).await.unwrap().is_none());
    // Clearing an empty slot is fine
    store.clear().await.unwrap();
}

#[tokio::test]
async fn test_in_memory_store_is_usable() {
    init_logging();
    let store = SqliteStore::in_memory().unwrap();
    ActivityRepository::save(&store, &completed("run-1", 3, 1_000.0, 400))
        .await
        .unwrap();
    assert_eq!(ActivityRepository::find_all(&store).await.unwrap().len(), 1);
}
