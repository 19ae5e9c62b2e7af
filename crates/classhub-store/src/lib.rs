pub mod chat;
pub mod database;
pub mod error;
pub mod modules;
pub mod row_helpers;
pub mod scenes;
pub mod schema;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use store::{ChatEntry, ModuleHistory, SceneRecord, SqliteStore, UnitStore};
