/// SQL DDL for the classroom store.
/// One row per logical key: scene counters, scene records and module
/// snapshots are upserted; module history and chat are append-only lists.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS scene_counters (
    unit_id TEXT PRIMARY KEY,
    scene_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scenes (
    unit_id TEXT NOT NULL,
    scene_id INTEGER NOT NULL,
    start_time INTEGER,
    end_time INTEGER,
    PRIMARY KEY (unit_id, scene_id)
);

CREATE TABLE IF NOT EXISTS module_snapshots (
    unit_id TEXT NOT NULL,
    scene_id INTEGER NOT NULL,
    module TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (unit_id, scene_id, module)
);

CREATE TABLE IF NOT EXISTS module_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_id TEXT NOT NULL,
    scene_id INTEGER NOT NULL,
    module TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_history (
    unit_id TEXT NOT NULL,
    scene_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (unit_id, scene_id, position)
);

CREATE INDEX IF NOT EXISTS idx_module_history_scene ON module_history(unit_id, scene_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
