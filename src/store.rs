//! Storage collaborator contracts.
//!
//! The session core never talks to a storage engine directly. It hands
//! finished activities, records, achievements and crash-recovery snapshots
//! to these traits. [`memory`] holds in-memory implementations used by tests
//! and hosts that persist elsewhere; the SQLite adapter lives in
//! `persistence` behind the `persistence` feature.

use async_trait::async_trait;

use crate::achievements::{Achievement, AchievementType};
use crate::error::PersistenceResult;
use crate::records::{PersonalRecord, RecordCategory};
use crate::session::{ActivityPatch, ActivitySession};

/// Finished activities.
#[async_trait]
pub trait ActivityRepository: Send + Sync {
    /// Store a completed session, replacing any copy with the same id.
    async fn save(&self, session: &ActivitySession) -> PersistenceResult<()>;

    async fn find_by_id(&self, id: &str) -> PersistenceResult<Option<ActivitySession>>;

    /// All stored activities, oldest start first.
    async fn find_all(&self) -> PersistenceResult<Vec<ActivitySession>>;

    async fn delete(&self, id: &str) -> PersistenceResult<()>;

    /// Edit metadata of a stored activity and return the updated copy.
    async fn update(&self, id: &str, patch: &ActivityPatch) -> PersistenceResult<ActivitySession>;
}

/// Personal records, one per category.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Store a record, replacing the current one of its category.
    async fn save(&self, record: &PersonalRecord) -> PersistenceResult<()>;

    async fn find_by_category(
        &self,
        category: RecordCategory,
    ) -> PersistenceResult<Option<PersonalRecord>>;

    async fn find_all(&self) -> PersistenceResult<Vec<PersonalRecord>>;

    async fn delete_by_id(&self, id: &str) -> PersistenceResult<()>;

    async fn delete_all(&self) -> PersistenceResult<()>;
}

/// Earned achievements, keyed by [`Achievement::id`].
#[async_trait]
pub trait AchievementRepository: Send + Sync {
    async fn save(&self, achievement: &Achievement) -> PersistenceResult<()>;

    async fn find_by_type(
        &self,
        achievement_type: AchievementType,
    ) -> PersistenceResult<Vec<Achievement>>;

    async fn find_all(&self) -> PersistenceResult<Vec<Achievement>>;

    async fn delete_by_id(&self, id: &str) -> PersistenceResult<()>;

    async fn delete_all(&self) -> PersistenceResult<()>;
}

/// Single-slot store for the crash-recovery snapshot document.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot.
    async fn save(&self, payload: &str) -> PersistenceResult<()>;

    async fn load(&self) -> PersistenceResult<Option<String>>;

    async fn clear(&self) -> PersistenceResult<()>;
}

/// Check that a session may be stored as a finished activity.
pub(crate) fn validate_activity(session: &ActivitySession) -> PersistenceResult<()> {
    use crate::error::PersistenceError;
    use crate::state::SessionState;

    if session.state() != SessionState::Completed {
        return Err(PersistenceError::ValidationFailed(format!(
            "activity {} is {}, only completed sessions are stored",
            session.id(),
            session.state()
        )));
    }
    if session.id().trim().is_empty() {
        return Err(PersistenceError::ValidationFailed(
            "activity id is empty".to_string(),
        ));
    }
    Ok(())
}

pub mod memory {
    //! In-memory implementations of the storage contracts.
    //!
    //! Each store can be told to fail its next saves, which is how the
    //! retry paths are exercised in tests.

    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};

    use async_trait::async_trait;

    use super::{
        validate_activity, AchievementRepository, ActivityRepository, RecordRepository,
        SnapshotStore,
    };
    use crate::achievements::{Achievement, AchievementType};
    use crate::error::{OptionExt, PersistenceError, PersistenceResult};
    use crate::records::{PersonalRecord, RecordCategory};
    use crate::session::{ActivityPatch, ActivitySession};

    fn lock<T>(mutex: &Mutex<T>) -> PersistenceResult<MutexGuard<'_, T>> {
        mutex
            .lock()
            .map_err(|_| PersistenceError::ConnectionFailed("store lock poisoned".to_string()))
    }

    /// Countdown of injected save failures.
    #[derive(Debug, Default)]
    struct FailureInjector(AtomicUsize);

    impl FailureInjector {
        fn arm(&self, count: usize) {
            self.0.store(count, Ordering::SeqCst);
        }

        fn check(&self, what: &str) -> PersistenceResult<()> {
            let hit = self
                .0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if hit {
                Err(PersistenceError::SaveFailed(format!("{}: injected failure", what)))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryActivityRepository {
        sessions: Mutex<HashMap<String, ActivitySession>>,
        failures: FailureInjector,
    }

    impl MemoryActivityRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` saves fail with `SaveFailed`.
        pub fn fail_next_saves(&self, count: usize) {
            self.failures.arm(count);
        }
    }

    #[async_trait]
    impl ActivityRepository for MemoryActivityRepository {
        async fn save(&self, session: &ActivitySession) -> PersistenceResult<()> {
            validate_activity(session)?;
            self.failures.check(session.id())?;
            lock(&self.sessions)?.insert(session.id().to_string(), session.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &str) -> PersistenceResult<Option<ActivitySession>> {
            Ok(lock(&self.sessions)?.get(id).cloned())
        }

        async fn find_all(&self) -> PersistenceResult<Vec<ActivitySession>> {
            let mut all: Vec<ActivitySession> = lock(&self.sessions)?.values().cloned().collect();
            all.sort_by_key(|s| s.start_time());
            Ok(all)
        }

        async fn delete(&self, id: &str) -> PersistenceResult<()> {
            lock(&self.sessions)?
                .remove(id)
                .map(|_| ())
                .ok_or_not_found(id)
        }

        async fn update(
            &self,
            id: &str,
            patch: &ActivityPatch,
        ) -> PersistenceResult<ActivitySession> {
            let mut sessions = lock(&self.sessions)?;
            let session = sessions.get_mut(id).ok_or_not_found(id)?;
            session.apply_patch(patch);
            Ok(session.clone())
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryRecordRepository {
        records: Mutex<BTreeMap<&'static str, PersonalRecord>>,
        failures: FailureInjector,
    }

    impl MemoryRecordRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_saves(&self, count: usize) {
            self.failures.arm(count);
        }
    }

    #[async_trait]
    impl RecordRepository for MemoryRecordRepository {
        async fn save(&self, record: &PersonalRecord) -> PersistenceResult<()> {
            self.failures.check(record.id())?;
            lock(&self.records)?.insert(record.id(), record.clone());
            Ok(())
        }

        async fn find_by_category(
            &self,
            category: RecordCategory,
        ) -> PersistenceResult<Option<PersonalRecord>> {
            Ok(lock(&self.records)?.get(category.as_str()).cloned())
        }

        async fn find_all(&self) -> PersistenceResult<Vec<PersonalRecord>> {
            Ok(lock(&self.records)?.values().cloned().collect())
        }

        async fn delete_by_id(&self, id: &str) -> PersistenceResult<()> {
            lock(&self.records)?
                .remove(id)
                .map(|_| ())
                .ok_or_not_found(id)
        }

        async fn delete_all(&self) -> PersistenceResult<()> {
            lock(&self.records)?.clear();
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryAchievementRepository {
        achievements: Mutex<BTreeMap<String, Achievement>>,
        failures: FailureInjector,
    }

    impl MemoryAchievementRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_saves(&self, count: usize) {
            self.failures.arm(count);
        }
    }

    #[async_trait]
    impl AchievementRepository for MemoryAchievementRepository {
        async fn save(&self, achievement: &Achievement) -> PersistenceResult<()> {
            let id = achievement.id();
            self.failures.check(&id)?;
            lock(&self.achievements)?.insert(id, achievement.clone());
            Ok(())
        }

        async fn find_by_type(
            &self,
            achievement_type: AchievementType,
        ) -> PersistenceResult<Vec<Achievement>> {
            Ok(lock(&self.achievements)?
                .values()
                .filter(|a| a.achievement_type == achievement_type)
                .cloned()
                .collect())
        }

        async fn find_all(&self) -> PersistenceResult<Vec<Achievement>> {
            Ok(lock(&self.achievements)?.values().cloned().collect())
        }

        async fn delete_by_id(&self, id: &str) -> PersistenceResult<()> {
            lock(&self.achievements)?
                .remove(id)
                .map(|_| ())
                .ok_or_not_found(id)
        }

        async fn delete_all(&self) -> PersistenceResult<()> {
            lock(&self.achievements)?.clear();
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct MemorySnapshotStore {
        slot: Mutex<Option<String>>,
        saves: AtomicUsize,
        failures: FailureInjector,
    }

    impl MemorySnapshotStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_saves(&self, count: usize) {
            self.failures.arm(count);
        }

        /// Number of successful saves so far.
        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotStore for MemorySnapshotStore {
        async fn save(&self, payload: &str) -> PersistenceResult<()> {
            self.failures.check("snapshot")?;
            *lock(&self.slot)? = Some(payload.to_string());
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn load(&self) -> PersistenceResult<Option<String>> {
            Ok(lock(&self.slot)?.clone())
        }

        async fn clear(&self) -> PersistenceResult<()> {
            *lock(&self.slot)? = None;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;
    use crate::error::PersistenceError;
    use chrono::{Duration, TimeZone, Utc};

    fn completed(id: &str, offset_secs: i64) -> ActivitySession {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap() + Duration::seconds(offset_secs);
        let mut session = ActivitySession::new(id, t0);
        session.start(t0).unwrap();
        session.activate(t0).unwrap();
        session.stop(t0 + Duration::seconds(60)).unwrap();
        session.complete(t0 + Duration::seconds(60)).unwrap();
        session
    }

    #[tokio::test]
    async fn test_activity_crud() {
        let repo = MemoryActivityRepository::new();
        repo.save(&completed("b", 100)).await.unwrap();
        repo.save(&completed("a", 0)).await.unwrap();

        let all = repo.find_all().await.unwrap();
        assert_eq!(all.iter().map(|s| s.id()).collect::<Vec<_>>(), vec!["a", "b"]);

        let patch = ActivityPatch {
            name: Some("Morning loop".to_string()),
            notes: None,
        };
        let updated = repo.update("a", &patch).await.unwrap();
        assert_eq!(updated.name(), Some("Morning loop"));
        assert_eq!(
            repo.find_by_id("a").await.unwrap().unwrap().name(),
            Some("Morning loop")
        );

        repo.delete("a").await.unwrap();
        assert!(repo.find_by_id("a").await.unwrap().is_none());
        assert!(matches!(
            repo.delete("a").await,
            Err(PersistenceError::NotFound(_))
        ));
        assert!(matches!(
            repo.update("zzz", &patch).await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_only_completed_sessions_are_stored() {
        let repo = MemoryActivityRepository::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let session = ActivitySession::new("open", t0);
        assert!(matches!(
            repo.save(&session).await,
            Err(PersistenceError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_count_down() {
        let repo = MemoryActivityRepository::new();
        repo.fail_next_saves(1);
        let session = completed("a", 0);
        assert!(matches!(
            repo.save(&session).await,
            Err(PersistenceError::SaveFailed(_))
        ));
        repo.save(&session).await.unwrap();
        assert_eq!(repo.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_slot() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save("one").await.unwrap();
        store.save("two").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.save_count(), 2);
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
