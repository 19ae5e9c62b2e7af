use tracing::instrument;

use classhub_core::ids::{SceneId, UnitId};
use classhub_core::protocol::ChatText;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::ChatEntry;

/// Per unit+scene chat log. Positions start at 1 and are never reused.
pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append and return the new entry's position.
    #[instrument(skip(self, chat), fields(unit_id = %unit))]
    pub fn append(&self, unit: &UnitId, scene_id: SceneId, chat: &ChatText) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(chat)?;
        self.db.with_conn(|conn| {
            let position: i64 = conn.query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM chat_history
                 WHERE unit_id = ?1 AND scene_id = ?2",
                rusqlite::params![unit.as_str(), scene_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO chat_history (unit_id, scene_id, position, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![unit.as_str(), scene_id, position, payload, chat.created_at],
            )?;
            Ok(position)
        })
    }

    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn count(&self, unit: &UnitId, scene_id: SceneId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM chat_history WHERE unit_id = ?1 AND scene_id = ?2",
                rusqlite::params![unit.as_str(), scene_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Entries with `first <= position <= last`, oldest first.
    #[instrument(skip(self), fields(unit_id = %unit))]
    pub fn range(
        &self,
        unit: &UnitId,
        scene_id: SceneId,
        first: i64,
        last: i64,
    ) -> Result<Vec<ChatEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT position, payload FROM chat_history
                 WHERE unit_id = ?1 AND scene_id = ?2 AND position BETWEEN ?3 AND ?4
                 ORDER BY position",
            )?;
            let mut rows = stmt.query(rusqlite::params![unit.as_str(), scene_id, first, last])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 1, "chat_history", "payload")?;
                out.push(ChatEntry {
                    chat_id: row_helpers::get(row, 0, "chat_history", "position")?,
                    chat: row_helpers::parse_payload(&raw, "chat_history", "payload")?,
                });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat(text: &str, at: i64) -> ChatText {
        ChatText {
            from: "s1".into(),
            msg: json!({ "c": text }),
            created_at: at,
        }
    }

    #[test]
    fn append_assigns_consecutive_positions() {
        let repo = ChatRepo::new(Database::in_memory().unwrap());
        let unit = UnitId::from_raw("u1");
        assert_eq!(repo.append(&unit, 1, &chat("a", 1)).unwrap(), 1);
        assert_eq!(repo.append(&unit, 1, &chat("b", 2)).unwrap(), 2);
        assert_eq!(repo.append(&unit, 2, &chat("c", 3)).unwrap(), 1);
        assert_eq!(repo.count(&unit, 1).unwrap(), 2);
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let repo = ChatRepo::new(Database::in_memory().unwrap());
        let unit = UnitId::from_raw("u1");
        for i in 0..5 {
            repo.append(&unit, 1, &chat(&format!("m{i}"), i)).unwrap();
        }
        let page = repo.range(&unit, 1, 2, 4).unwrap();
        let ids: Vec<i64> = page.iter().map(|e| e.chat_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(page[0].chat.text(), Some("m1"));
    }
}
