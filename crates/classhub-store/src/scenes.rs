use rusqlite::OptionalExtension;
use tracing::instrument;

use classhub_core::ids::{SceneId, UnitId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::SceneRecord;

/// Scene counters and per-scene start/end records.
pub struct SceneRepo {
    db: Database,
}

impl SceneRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn current(&self, unit: &UnitId) -> Result<Option<SceneId>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT scene_id FROM scene_counters WHERE unit_id = ?1",
                    [unit.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Current scene id, seeding the counter with 1 when the unit has none.
    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn init(&self, unit: &UnitId) -> Result<SceneId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO scene_counters (unit_id, scene_id) VALUES (?1, 1)",
                [unit.as_str()],
            )?;
            Ok(conn.query_row(
                "SELECT scene_id FROM scene_counters WHERE unit_id = ?1",
                [unit.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Increment the counter and return the new value. A missing counter
    /// becomes 1.
    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn incr(&self, unit: &UnitId) -> Result<SceneId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scene_counters (unit_id, scene_id) VALUES (?1, 1)
                 ON CONFLICT(unit_id) DO UPDATE SET scene_id = scene_id + 1",
                [unit.as_str()],
            )?;
            Ok(conn.query_row(
                "SELECT scene_id FROM scene_counters WHERE unit_id = ?1",
                [unit.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn record(&self, unit: &UnitId, scene_id: SceneId) -> Result<Option<SceneRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT start_time, end_time FROM scenes WHERE unit_id = ?1 AND scene_id = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![unit.as_str(), scene_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(SceneRecord {
                    unit_id: unit.clone(),
                    scene_id,
                    start_time: row_helpers::get(row, 0, "scenes", "start_time")?,
                    end_time: row_helpers::get(row, 1, "scenes", "end_time")?,
                })),
                None => Ok(None),
            }
        })
    }

    /// Overwrite the record for `(unit_id, scene_id)`.
    #[instrument(skip(self), fields(unit_id = %record.unit_id, scene_id = record.scene_id))]
    pub fn put(&self, record: &SceneRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scenes (unit_id, scene_id, start_time, end_time) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(unit_id, scene_id) DO UPDATE SET
                    start_time = excluded.start_time,
                    end_time = excluded.end_time",
                rusqlite::params![
                    record.unit_id.as_str(),
                    record.scene_id,
                    record.start_time,
                    record.end_time,
                ],
            )?;
            Ok(())
        })
    }
}
