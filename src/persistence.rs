//! # SQLite Stores
//!
//! One SQLite database backing every storage contract:
//!
//! - **activities**: completed sessions as MessagePack blobs, with summary
//!   columns (start, distance, duration, name) for listing
//! - **personal_records**: one row per record category
//! - **achievements**: earned achievements keyed by their deduplication key
//! - **session_snapshot**: a single-row slot for the crash-recovery document
//!
//! The connection sits behind a mutex that is never held across an `.await`.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::achievements::{Achievement, AchievementType};
use crate::error::{OptionExt, PersistenceError, PersistenceResult};
use crate::records::{PersonalRecord, RecordCategory};
use crate::session::{ActivityPatch, ActivitySession};
use crate::store::{
    validate_activity, AchievementRepository, ActivityRepository, RecordRepository, SnapshotStore,
};

/// SQLite implementation of all storage contracts.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

fn query_failed(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::QueryFailed(e.to_string())
}

fn save_failed(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::SaveFailed(e.to_string())
}

fn delete_failed(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::DeleteFailed(e.to_string())
}

fn parse_time(value: &str) -> PersistenceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| query_failed(format!("bad timestamp '{}': {}", value, e)))
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> PersistenceResult<Self> {
        let db = Connection::open(db_path)
            .map_err(|e| PersistenceError::ConnectionFailed(format!("{}: {}", db_path, e)))?;
        Self::init_schema(&db)?;
        info!("[Store] Opened {}", db_path);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> PersistenceResult<Self> {
        Self::new(":memory:")
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> PersistenceResult<()> {
        conn.execute_batch(
            r#"
            -- Completed sessions
            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                distance_meters REAL NOT NULL,
                duration_seconds REAL NOT NULL,
                name TEXT,
                notes TEXT,
                session BLOB NOT NULL
            );

            -- One row per record category
            CREATE TABLE IF NOT EXISTS personal_records (
                category TEXT PRIMARY KEY,
                value REAL NOT NULL,
                source_session_id TEXT NOT NULL,
                achieved_at TEXT NOT NULL,
                previous_value REAL
            );

            -- Earned achievements, id is "<TYPE>-<target>"
            CREATE TABLE IF NOT EXISTS achievements (
                id TEXT PRIMARY KEY,
                achievement_type TEXT NOT NULL,
                target_value INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            -- Crash-recovery document, at most one row
            CREATE TABLE IF NOT EXISTS session_snapshot (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activities_start ON activities(start_time);
            CREATE INDEX IF NOT EXISTS idx_achievements_type ON achievements(achievement_type);
            "#,
        )
        .map_err(|e| PersistenceError::ConnectionFailed(format!("schema: {}", e)))
    }

    fn conn(&self) -> PersistenceResult<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| PersistenceError::ConnectionFailed("connection lock poisoned".to_string()))
    }

    fn write_activity(conn: &Connection, session: &ActivitySession) -> PersistenceResult<()> {
        let end_time = session.end_time().ok_or_else(|| {
            PersistenceError::ValidationFailed(format!("activity {} has no end time", session.id()))
        })?;
        let blob = rmp_serde::to_vec_named(session).map_err(save_failed)?;
        let metrics = session.metrics();

        conn.execute(
            "INSERT OR REPLACE INTO activities
                (id, start_time, end_time, distance_meters, duration_seconds, name, notes, session)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                session.id(),
                session.start_time().to_rfc3339(),
                end_time.to_rfc3339(),
                metrics.distance_meters,
                metrics.duration_seconds,
                session.name(),
                session.notes(),
                blob
            ],
        )
        .map_err(save_failed)?;
        Ok(())
    }

    fn read_activity(blob: &[u8]) -> PersistenceResult<ActivitySession> {
        rmp_serde::from_slice(blob).map_err(query_failed)
    }

    fn read_record(row: &Row<'_>) -> rusqlite::Result<(String, f64, String, String, Option<f64>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn to_record(
        (category, value, source, achieved_at, previous): (String, f64, String, String, Option<f64>),
    ) -> PersistenceResult<PersonalRecord> {
        Ok(PersonalRecord {
            category: category.parse::<RecordCategory>().map_err(query_failed)?,
            value,
            source_session_id: source,
            achieved_at: parse_time(&achieved_at)?,
            previous_value: previous,
        })
    }

    fn read_achievements(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> PersistenceResult<Vec<Achievement>> {
        let mut stmt = conn.prepare(sql).map_err(query_failed)?;
        let rows: Vec<String> = stmt
            .query_map(args, |row| row.get(0))
            .map_err(query_failed)?
            .collect::<rusqlite::Result<_>>()
            .map_err(query_failed)?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(query_failed))
            .collect()
    }
}

#[async_trait]
impl ActivityRepository for SqliteStore {
    async fn save(&self, session: &ActivitySession) -> PersistenceResult<()> {
        validate_activity(session)?;
        let conn = self.conn()?;
        Self::write_activity(&conn, session)?;
        debug!("[Store] Saved activity {}", session.id());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> PersistenceResult<Option<ActivitySession>> {
        let conn = self.conn()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT session FROM activities WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_failed)?;
        blob.map(|b| Self::read_activity(&b)).transpose()
    }

    async fn find_all(&self) -> PersistenceResult<Vec<ActivitySession>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT session FROM activities ORDER BY start_time ASC")
            .map_err(query_failed)?;
        let blobs: Vec<Vec<u8>> = stmt
            .query_map([], |row| row.get(0))
            .map_err(query_failed)?
            .collect::<rusqlite::Result<_>>()
            .map_err(query_failed)?;

        blobs.iter().map(|b| Self::read_activity(b)).collect()
    }

    async fn delete(&self, id: &str) -> PersistenceResult<()> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM activities WHERE id = ?", params![id])
            .map_err(delete_failed)?;
        (removed > 0).then_some(()).ok_or_not_found(id)
    }

    async fn update(&self, id: &str, patch: &ActivityPatch) -> PersistenceResult<ActivitySession> {
        let conn = self.conn()?;
        let blob: Vec<u8> = conn
            .query_row(
                "SELECT session FROM activities WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_failed)?
            .ok_or_not_found(id)?;

        let mut session = Self::read_activity(&blob)?;
        session.apply_patch(patch);
        Self::write_activity(&conn, &session)?;
        Ok(session)
    }
}

#[async_trait]
impl RecordRepository for SqliteStore {
    async fn save(&self, record: &PersonalRecord) -> PersistenceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO personal_records
                (category, value, source_session_id, achieved_at, previous_value)
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.category.as_str(),
                record.value,
                record.source_session_id,
                record.achieved_at.to_rfc3339(),
                record.previous_value
            ],
        )
        .map_err(save_failed)?;
        Ok(())
    }

    async fn find_by_category(
        &self,
        category: RecordCategory,
    ) -> PersistenceResult<Option<PersonalRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT category, value, source_session_id, achieved_at, previous_value
             FROM personal_records WHERE category = ?",
            params![category.as_str()],
            Self::read_record,
        )
        .optional()
        .map_err(query_failed)?
        .map(Self::to_record)
        .transpose()
    }

    async fn find_all(&self) -> PersistenceResult<Vec<PersonalRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT category, value, source_session_id, achieved_at, previous_value
                 FROM personal_records ORDER BY category",
            )
            .map_err(query_failed)?;
        let rows: Vec<_> = stmt
            .query_map([], Self::read_record)
            .map_err(query_failed)?
            .collect::<rusqlite::Result<_>>()
            .map_err(query_failed)?;

        rows.into_iter().map(Self::to_record).collect()
    }

    async fn delete_by_id(&self, id: &str) -> PersistenceResult<()> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM personal_records WHERE category = ?", params![id])
            .map_err(delete_failed)?;
        (removed > 0).then_some(()).ok_or_not_found(id)
    }

    async fn delete_all(&self) -> PersistenceResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM personal_records", [])
            .map_err(delete_failed)?;
        Ok(())
    }
}

#[async_trait]
impl AchievementRepository for SqliteStore {
    async fn save(&self, achievement: &Achievement) -> PersistenceResult<()> {
        let data = serde_json::to_string(achievement).map_err(save_failed)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO achievements (id, achievement_type, target_value, data)
             VALUES (?, ?, ?, ?)",
            params![
                achievement.id(),
                achievement.criteria.achievement_type.as_str(),
                achievement.criteria.target_value,
                data
            ],
        )
        .map_err(save_failed)?;
        Ok(())
    }

    async fn find_by_type(
        &self,
        achievement_type: AchievementType,
    ) -> PersistenceResult<Vec<Achievement>> {
        let conn = self.conn()?;
        Self::read_achievements(
            &conn,
            "SELECT data FROM achievements WHERE achievement_type = ? ORDER BY target_value",
            &[&achievement_type.as_str()],
        )
    }

    async fn find_all(&self) -> PersistenceResult<Vec<Achievement>> {
        let conn = self.conn()?;
        Self::read_achievements(
            &conn,
            "SELECT data FROM achievements ORDER BY achievement_type, target_value",
            &[],
        )
    }

    async fn delete_by_id(&self, id: &str) -> PersistenceResult<()> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM achievements WHERE id = ?", params![id])
            .map_err(delete_failed)?;
        (removed > 0).then_some(()).ok_or_not_found(id)
    }

    async fn delete_all(&self) -> PersistenceResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM achievements", [])
            .map_err(delete_failed)?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save(&self, payload: &str) -> PersistenceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_snapshot (slot, payload) VALUES (0, ?)",
            params![payload],
        )
        .map_err(save_failed)?;
        Ok(())
    }

    async fn load(&self) -> PersistenceResult<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT payload FROM session_snapshot WHERE slot = 0",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(query_failed)
    }

    async fn clear(&self) -> PersistenceResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM session_snapshot", [])
            .map_err(delete_failed)?;
        Ok(())
    }
}
