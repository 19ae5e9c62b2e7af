use std::path::Path;

use serde::{Deserialize, Serialize};

use classhub_core::ids::{SceneId, UnitId};
use classhub_core::protocol::{ChatText, ModuleStatus};

use crate::chat::ChatRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::modules::ModuleRepo;
use crate::scenes::SceneRepo;

/// Start/end times of one scene, unix seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub unit_id: UnitId,
    pub scene_id: SceneId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl SceneRecord {
    pub fn new(unit_id: UnitId, scene_id: SceneId) -> Self {
        Self {
            unit_id,
            scene_id,
            start_time: None,
            end_time: None,
        }
    }
}

/// History entries of one module within a scene.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleHistory {
    pub module: String,
    pub entries: Vec<ModuleStatus>,
}

impl ModuleHistory {
    pub fn first_created_at(&self) -> i64 {
        self.entries.first().map(|e| e.created_at).unwrap_or_default()
    }
}

/// A chat message with its 1-based position in the scene's log.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatEntry {
    pub chat_id: i64,
    pub chat: ChatText,
}

/// Durable state of classroom units.
///
/// Calls are synchronous and short; callers on async tasks invoke them
/// directly, the same way the connection actors touch their own state.
pub trait UnitStore: Send + Sync {
    fn scene_id(&self, unit: &UnitId) -> Result<Option<SceneId>, StoreError>;

    /// Current scene id, initialized to 1 if the unit has none yet.
    fn init_scene_id(&self, unit: &UnitId) -> Result<SceneId, StoreError>;

    fn incr_scene_id(&self, unit: &UnitId) -> Result<SceneId, StoreError>;

    fn scene_record(&self, unit: &UnitId, scene: SceneId) -> Result<Option<SceneRecord>, StoreError>;

    fn put_scene_record(&self, record: &SceneRecord) -> Result<(), StoreError>;

    fn module_snapshot(
        &self,
        unit: &UnitId,
        scene: SceneId,
        module: &str,
    ) -> Result<Option<ModuleStatus>, StoreError>;

    fn put_module_snapshot(
        &self,
        unit: &UnitId,
        scene: SceneId,
        module: &str,
        status: &ModuleStatus,
    ) -> Result<(), StoreError>;

    fn module_snapshots(
        &self,
        unit: &UnitId,
        scene: SceneId,
    ) -> Result<Vec<(String, ModuleStatus)>, StoreError>;

    fn append_module_history(
        &self,
        unit: &UnitId,
        scene: SceneId,
        module: &str,
        entry: &ModuleStatus,
    ) -> Result<(), StoreError>;

    fn module_history(&self, unit: &UnitId, scene: SceneId) -> Result<Vec<ModuleHistory>, StoreError>;

    fn append_chat(&self, unit: &UnitId, scene: SceneId, chat: &ChatText) -> Result<i64, StoreError>;

    fn chat_count(&self, unit: &UnitId, scene: SceneId) -> Result<i64, StoreError>;

    /// Chat entries with positions in `first..=last`.
    fn chat_range(
        &self,
        unit: &UnitId,
        scene: SceneId,
        first: i64,
        last: i64,
    ) -> Result<Vec<ChatEntry>, StoreError>;
}

/// SQLite-backed [`UnitStore`].
pub struct SqliteStore {
    scenes: SceneRepo,
    modules: ModuleRepo,
    chat: ChatRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            scenes: SceneRepo::new(db.clone()),
            modules: ModuleRepo::new(db.clone()),
            chat: ChatRepo::new(db),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }
}

impl UnitStore for SqliteStore {
    fn scene_id(&self, unit: &UnitId) -> Result<Option<SceneId>, StoreError> {
        self.scenes.current(unit)
    }

    fn init_scene_id(&self, unit: &UnitId) -> Result<SceneId, StoreError> {
        self.scenes.init(unit)
    }

    fn incr_scene_id(&self, unit: &UnitId) -> Result<SceneId, StoreError> {
        self.scenes.incr(unit)
    }

    fn scene_record(&self, unit: &UnitId, scene: SceneId) -> Result<Option<SceneRecord>, StoreError> {
        self.scenes.record(unit, scene)
    }

    fn put_scene_record(&self, record: &SceneRecord) -> Result<(), StoreError> {
        self.scenes.put(record)
    }

    fn module_snapshot(
        &self,
        unit: &UnitId,
        scene: SceneId,
        module: &str,
    ) -> Result<Option<ModuleStatus>, StoreError> {
        self.modules.snapshot(unit, scene, module)
    }

    fn put_module_snapshot(
        &self,
        unit: &UnitId,
        scene: SceneId,
        module: &str,
        status: &ModuleStatus,
    ) -> Result<(), StoreError> {
        self.modules.put_snapshot(unit, scene, module, status)
    }

    fn module_snapshots(
        &self,
        unit: &UnitId,
        scene: SceneId,
    ) -> Result<Vec<(String, ModuleStatus)>, StoreError> {
        self.modules.snapshots(unit, scene)
    }

    fn append_module_history(
        &self,
        unit: &UnitId,
        scene: SceneId,
        module: &str,
        entry: &ModuleStatus,
    ) -> Result<(), StoreError> {
        self.modules.append_history(unit, scene, module, entry)
    }

    fn module_history(&self, unit: &UnitId, scene: SceneId) -> Result<Vec<ModuleHistory>, StoreError> {
        self.modules.history(unit, scene)
    }

    fn append_chat(&self, unit: &UnitId, scene: SceneId, chat: &ChatText) -> Result<i64, StoreError> {
        self.chat.append(unit, scene, chat)
    }

    fn chat_count(&self, unit: &UnitId, scene: SceneId) -> Result<i64, StoreError> {
        self.chat.count(unit, scene)
    }

    fn chat_range(
        &self,
        unit: &UnitId,
        scene: SceneId,
        first: i64,
        last: i64,
    ) -> Result<Vec<ChatEntry>, StoreError> {
        self.chat.range(unit, scene, first, last)
    }
}
