use rusqlite::OptionalExtension;
use tracing::instrument;

use classhub_core::ids::{SceneId, UnitId};
use classhub_core::protocol::ModuleStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::ModuleHistory;

/// Module snapshots (one per unit+scene+module) and their append-only history.
pub struct ModuleRepo {
    db: Database,
}

impl ModuleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn snapshot(
        &self,
        unit: &UnitId,
        scene_id: SceneId,
        module: &str,
    ) -> Result<Option<ModuleStatus>, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT payload FROM module_snapshots
                     WHERE unit_id = ?1 AND scene_id = ?2 AND module = ?3",
                    rusqlite::params![unit.as_str(), scene_id, module],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| row_helpers::parse_payload(&raw, "module_snapshots", "payload"))
                .transpose()
        })
    }

    /// Replace the snapshot stored under `module`.
    #[instrument(skip(self, status), fields(unit_id = %unit))]
    pub fn put_snapshot(
        &self,
        unit: &UnitId,
        scene_id: SceneId,
        module: &str,
        status: &ModuleStatus,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(status)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO module_snapshots (unit_id, scene_id, module, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(unit_id, scene_id, module) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                rusqlite::params![unit.as_str(), scene_id, module, payload, status.updated_at],
            )?;
            Ok(())
        })
    }

    /// All snapshots of a scene keyed by module, newest update first.
    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn snapshots(
        &self,
        unit: &UnitId,
        scene_id: SceneId,
    ) -> Result<Vec<(String, ModuleStatus)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT module, payload FROM module_snapshots
                 WHERE unit_id = ?1 AND scene_id = ?2
                 ORDER BY updated_at DESC, module",
            )?;
            let mut rows = stmt.query(rusqlite::params![unit.as_str(), scene_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let module: String = row_helpers::get(row, 0, "module_snapshots", "module")?;
                let raw: String = row_helpers::get(row, 1, "module_snapshots", "payload")?;
                out.push((
                    module,
                    row_helpers::parse_payload(&raw, "module_snapshots", "payload")?,
                ));
            }
            Ok(out)
        })
    }

    #[instrument(skip(self, entry), fields(unit_id = %unit))]
    pub fn append_history(
        &self,
        unit: &UnitId,
        scene_id: SceneId,
        module: &str,
        entry: &ModuleStatus,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(entry)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO module_history (unit_id, scene_id, module, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![unit.as_str(), scene_id, module, payload, entry.created_at],
            )?;
            Ok(())
        })
    }

    /// History of a scene grouped by module. Modules appear in the order of
    /// their first entry; entries keep insertion order.
    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn history(&self, unit: &UnitId, scene_id: SceneId) -> Result<Vec<ModuleHistory>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT module, payload FROM module_history
                 WHERE unit_id = ?1 AND scene_id = ?2
                 ORDER BY id",
            )?;
            let mut rows = stmt.query(rusqlite::params![unit.as_str(), scene_id])?;
            let mut groups: Vec<ModuleHistory> = Vec::new();
            while let Some(row) = rows.next()? {
                let module: String = row_helpers::get(row, 0, "module_history", "module")?;
                let raw: String = row_helpers::get(row, 1, "module_history", "payload")?;
                let entry: ModuleStatus =
                    row_helpers::parse_payload(&raw, "module_history", "payload")?;
                match groups.iter_mut().find(|g| g.module == module) {
                    Some(group) => group.entries.push(entry),
                    None => groups.push(ModuleHistory {
                        module,
                        entries: vec![entry],
                    }),
                }
            }
            groups.sort_by_key(|g| g.first_created_at());
            Ok(groups)
        })
    }
}
