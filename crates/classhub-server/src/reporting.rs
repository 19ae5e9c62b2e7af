//! Read-only HTTP views over the Hub and the store.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use classhub_core::protocol::ModuleStatus;
use classhub_core::{Principal, SceneId, UnitId};
use classhub_store::{ChatEntry, ModuleHistory, StoreError};

use crate::client::ClientHandle;
use crate::error::ServiceError;
use crate::server::AppState;

const DEFAULT_CHAT_LIMIT: i64 = 20;
const MAX_CHAT_LIMIT: i64 = 200;

/// `{"errcode":0,"errmsg":"OK","data":...}`
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub errcode: i32,
    pub errmsg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            errcode: 0,
            errmsg: "OK".to_string(),
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errcode: 1,
            errmsg: message.into(),
            data: None,
        }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("missing param token")]
    MissingToken,

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ReportError {
    fn into_response(self) -> Response {
        if let Self::Store(error) = &self {
            warn!(kind = error.error_kind(), %error, "report query failed");
        }
        Envelope::error(self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub total: usize,
    pub list: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(list: Vec<T>) -> Self {
        Self {
            total: list.len(),
            list,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    pub token: Option<String>,
    pub module_id: Option<String>,
    pub scene_id: Option<SceneId>,
    pub chat_id: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
}

// ── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserInfoRow {
    pub sex: i64,
    pub avatar: String,
    pub identity: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserRow {
    #[serde(rename = "type")]
    pub kind: i64,
    pub id: String,
    pub name: String,
    pub videointeract: i64,
    pub handwrite: i64,
    pub online_at: i64,
    pub classroom: String,
    pub userinfo: UserInfoRow,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceRow {
    #[serde(rename = "type")]
    pub kind: i64,
    pub id: String,
    pub name: String,
    pub videointeract: i64,
    pub handwrite: i64,
    pub online_at: i64,
    pub classroom: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RosterRow {
    User(UserRow),
    Device(DeviceRow),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModuleRow {
    pub id: String,
    #[serde(rename = "mod")]
    pub module: String,
    pub msg: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRow {
    pub chat_id: i64,
    pub from: String,
    pub msg: Value,
    pub created_at: String,
}

fn atoi(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}

/// Unix seconds as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Roster of registered clients. A local controller also contributes one
/// row per terminal it reported.
pub fn roster(clients: &[Arc<ClientHandle>]) -> Vec<RosterRow> {
    let mut rows = Vec::new();
    for client in clients.iter().filter(|c| c.is_registered()) {
        let caps = client.capabilities();
        let classroom = match &client.principal {
            Principal::Device(d) if !d.classroom_id.is_empty() => d.classroom_id.clone(),
            _ => client.unit_info.primary_classroom().to_string(),
        };

        match &client.principal {
            Principal::User(user) => rows.push(RosterRow::User(UserRow {
                kind: 0,
                id: user.uid.clone(),
                name: user.name.clone(),
                videointeract: atoi(&caps.vi),
                handwrite: atoi(&caps.hw),
                online_at: client.registered_at(),
                classroom: classroom.clone(),
                userinfo: UserInfoRow {
                    sex: user.sex,
                    avatar: user.avatar.clone(),
                    identity: i64::from(client.identity.code()),
                },
            })),
            Principal::Device(_) => rows.push(RosterRow::Device(DeviceRow {
                kind: atoi(&caps.dt),
                id: client.id.to_string(),
                name: client.id.to_string(),
                videointeract: atoi(&caps.vi),
                handwrite: atoi(&caps.hw),
                online_at: client.registered_at(),
                classroom: classroom.clone(),
            })),
        }

        if !client.is_local_control() {
            continue;
        }
        for item in client.local_users() {
            rows.push(RosterRow::User(UserRow {
                kind: 0,
                name: item.nm,
                videointeract: atoi(&item.vi),
                handwrite: atoi(&item.hw),
                online_at: item.registered_at,
                classroom: classroom.clone(),
                userinfo: UserInfoRow {
                    sex: atoi(&item.sex),
                    avatar: String::new(),
                    identity: atoi(&item.idt),
                },
                id: item.uid,
            }));
        }
        for item in client.local_devices() {
            rows.push(RosterRow::Device(DeviceRow {
                kind: atoi(&item.dt),
                name: if item.nm.is_empty() { item.did.clone() } else { item.nm },
                id: item.did,
                videointeract: atoi(&item.vi),
                handwrite: atoi(&item.hw),
                online_at: item.registered_at,
                classroom: classroom.clone(),
            }));
        }
    }
    rows
}

/// Current snapshots, newest update first, optionally one module only.
pub fn module_status_rows(snapshots: Vec<(String, ModuleStatus)>, module_id: Option<&str>) -> Vec<ModuleRow> {
    snapshots
        .into_iter()
        .filter(|(module, _)| module_id.map_or(true, |wanted| wanted.is_empty() || wanted == module))
        .enumerate()
        .map(|(i, (module, status))| ModuleRow {
            id: (i + 1).to_string(),
            module,
            msg: status.msg,
            updated_at: Some(format_time(status.updated_at)),
            created_at: None,
        })
        .collect()
}

/// Module history flattened in module order, numbered from 1.
pub fn module_history_rows(history: Vec<ModuleHistory>) -> Vec<ModuleRow> {
    history
        .into_iter()
        .flat_map(|group| {
            let module = group.module;
            group.entries.into_iter().map(move |entry| (module.clone(), entry))
        })
        .enumerate()
        .map(|(i, (module, entry))| ModuleRow {
            id: (i + 1).to_string(),
            module,
            msg: entry.msg,
            updated_at: None,
            created_at: Some(format_time(entry.created_at)),
        })
        .collect()
}

/// Positions `first..=last` of the page ending just before `chat_id`
/// (the newest page when `chat_id` is 0). `None` when the page is empty.
pub fn chat_window(count: i64, chat_id: i64, limit: i64) -> Option<(i64, i64)> {
    let last = if chat_id <= 0 { count } else { (chat_id - 1).min(count) };
    if last < 1 || limit < 1 {
        return None;
    }
    Some(((last - limit + 1).max(1), last))
}

pub fn chat_rows(entries: Vec<ChatEntry>, descending: bool) -> Vec<ChatRow> {
    let mut rows: Vec<ChatRow> = entries
        .into_iter()
        .map(|entry| ChatRow {
            chat_id: entry.chat_id,
            from: entry.chat.from,
            msg: entry.chat.msg,
            created_at: format_time(entry.chat.created_at),
        })
        .collect();
    if descending {
        rows.reverse();
    }
    rows
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Open-access units skip the token; everything else needs one that
/// resolves.
async fn authorize(state: &AppState, unit: &UnitId, token: Option<&str>) -> Result<(), ReportError> {
    if state.directory.is_open_access(unit).await? {
        return Ok(());
    }
    let token = token.filter(|t| !t.is_empty()).ok_or(ReportError::MissingToken)?;
    state.identity.resolve_token(token).await?;
    Ok(())
}

pub async fn users(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Envelope, ReportError> {
    let unit = UnitId::from_raw(unit_id);
    authorize(&state, &unit, query.token.as_deref()).await?;
    let clients = state.hub.list_unit(&unit);
    Ok(Envelope::ok(Page::new(roster(&clients))))
}

pub async fn module_status(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Envelope, ReportError> {
    let unit = UnitId::from_raw(unit_id);
    authorize(&state, &unit, query.token.as_deref()).await?;
    let Some(scene) = state.store.scene_id(&unit)? else {
        return Ok(Envelope::ok(Page::<ModuleRow>::new(Vec::new())));
    };
    let snapshots = state.store.module_snapshots(&unit, scene)?;
    Ok(Envelope::ok(Page::new(module_status_rows(
        snapshots,
        query.module_id.as_deref(),
    ))))
}

pub async fn module_list(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Envelope, ReportError> {
    let unit = UnitId::from_raw(unit_id);
    authorize(&state, &unit, query.token.as_deref()).await?;
    let scene = match query.scene_id.filter(|s| *s > 0) {
        Some(scene) => scene,
        None => match state.store.scene_id(&unit)? {
            Some(scene) => scene,
            None => return Ok(Envelope::ok(Page::<ModuleRow>::new(Vec::new()))),
        },
    };
    let history = state.store.module_history(&unit, scene)?;
    Ok(Envelope::ok(Page::new(module_history_rows(history))))
}

pub async fn chat_messages(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Envelope, ReportError> {
    let unit = UnitId::from_raw(unit_id);
    authorize(&state, &unit, query.token.as_deref()).await?;
    let empty = || Envelope::ok(Page::<ChatRow>::new(Vec::new()));

    let scene = match query.scene_id.filter(|s| *s > 0) {
        Some(scene) => scene,
        None => {
            let Some(current) = state.store.scene_id(&unit)? else {
                return Ok(empty());
            };
            // Between scenes the latest chat belongs to the one that ended.
            if state.directory.unit_info(&unit).await?.is_in_progress() {
                current
            } else {
                current - 1
            }
        }
    };
    if scene < 1 {
        return Ok(empty());
    }

    let count = state.store.chat_count(&unit, scene)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHAT_LIMIT)
        .clamp(1, MAX_CHAT_LIMIT);
    let Some((first, last)) = chat_window(count, query.chat_id.unwrap_or(0), limit) else {
        return Ok(empty());
    };
    let entries = state.store.chat_range(&unit, scene, first, last)?;
    let descending = query.sort.as_deref() == Some("desc");
    Ok(Envelope::ok(Page::new(chat_rows(entries, descending))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{device, user};
    use classhub_core::principal::LOCAL_CONTROL_DEVICE_TYPE;
    use classhub_core::protocol::{ChatText, LocalDeviceItem, LocalUserItem};
    use classhub_core::{Capabilities, Identity};
    use serde_json::json;

    #[test]
    fn roster_lists_registered_clients_and_local_terminals() {
        let (teacher, _t) = user("t1", Identity::Teacher, "u1");
        teacher.mark_registered(
            Capabilities {
                vi: "1".into(),
                hw: "0".into(),
                ..Default::default()
            },
            1_700_000_000,
        );
        let (pending, _p) = user("s9", Identity::Student, "u1");
        let (nds, _n) = device("nds", LOCAL_CONTROL_DEVICE_TYPE, "u1");
        nds.mark_registered(
            Capabilities {
                dt: "1".into(),
                ..Default::default()
            },
            5,
        );
        nds.add_local(
            vec![LocalUserItem {
                uid: "101".into(),
                nm: "Ann".into(),
                sex: "2".into(),
                idt: "2".into(),
                vi: "x".into(),
                registered_at: 6,
                ..Default::default()
            }],
            vec![LocalDeviceItem {
                did: "p1".into(),
                dt: "4".into(),
                registered_at: 7,
                ..Default::default()
            }],
        );

        let rows = roster(&[teacher, pending, nds]);
        let value = serde_json::to_value(&rows).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(
            value[0],
            json!({
                "type": 0, "id": "t1", "name": "name-t1", "videointeract": 1, "handwrite": 0,
                "online_at": 1_700_000_000, "classroom": "",
                "userinfo": {"sex": 1, "avatar": "", "identity": 1}
            })
        );
        assert_eq!(value[1]["type"], 1);
        assert_eq!(value[1]["id"], "nds");
        assert_eq!(value[2]["id"], "101");
        assert_eq!(value[2]["videointeract"], 0);
        assert_eq!(value[2]["userinfo"]["identity"], 2);
        assert_eq!(value[3], json!({
            "type": 4, "id": "p1", "name": "p1", "videointeract": 0, "handwrite": 0,
            "online_at": 7, "classroom": ""
        }));
    }

    #[test]
    fn module_status_rows_filter_and_format() {
        let snapshot = |module: &str, at: i64| {
            (
                module.to_string(),
                ModuleStatus {
                    module: module.into(),
                    msg: json!({"nm": module}),
                    updated_at: at,
                    ..Default::default()
                },
            )
        };
        let rows = module_status_rows(vec![snapshot("quiz", 60), snapshot("vote", 0)], None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "1");
        assert_eq!(rows[0].updated_at.as_deref(), Some("1970-01-01 00:01:00"));

        let only = module_status_rows(vec![snapshot("quiz", 60), snapshot("vote", 0)], Some("vote"));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].module, "vote");
        assert_eq!(only[0].id, "1");
    }

    #[test]
    fn module_history_numbered_across_modules() {
        let entry = |at: i64| ModuleStatus {
            created_at: at,
            ..Default::default()
        };
        let rows = module_history_rows(vec![
            ModuleHistory {
                module: "quiz".into(),
                entries: vec![entry(1), entry(3)],
            },
            ModuleHistory {
                module: "vote".into(),
                entries: vec![entry(2)],
            },
        ]);
        let ids: Vec<(&str, &str)> = rows.iter().map(|r| (r.id.as_str(), r.module.as_str())).collect();
        assert_eq!(ids, vec![("1", "quiz"), ("2", "quiz"), ("3", "vote")]);
        let value = serde_json::to_value(&rows[0]).unwrap();
        assert!(value.get("updated_at").is_none());
        assert_eq!(value["created_at"], "1970-01-01 00:00:01");
    }

    #[test]
    fn chat_windows() {
        assert_eq!(chat_window(0, 0, 20), None);
        assert_eq!(chat_window(5, 0, 20), Some((1, 5)));
        assert_eq!(chat_window(50, 0, 20), Some((31, 50)));
        assert_eq!(chat_window(50, 31, 20), Some((11, 30)));
        assert_eq!(chat_window(50, 1, 20), None);
        assert_eq!(chat_window(5, 99, 2), Some((4, 5)));
    }

    #[test]
    fn chat_rows_sorting() {
        let entry = |id: i64| ChatEntry {
            chat_id: id,
            chat: ChatText {
                from: "s1".into(),
                msg: json!({"c": format!("m{id}")}),
                created_at: 0,
            },
        };
        let asc = chat_rows(vec![entry(1), entry(2)], false);
        assert_eq!(asc[0].chat_id, 1);
        let desc = chat_rows(vec![entry(1), entry(2)], true);
        assert_eq!(desc[0].chat_id, 2);
        assert_eq!(desc[0].created_at, "1970-01-01 00:00:00");
    }

    #[test]
    fn envelope_shapes() {
        let ok = serde_json::to_value(Envelope::ok(Page::new(vec![1, 2]))).unwrap();
        assert_eq!(ok, json!({"errcode": 0, "errmsg": "OK", "data": {"total": 2, "list": [1, 2]}}));
        let err = serde_json::to_value(Envelope::error("missing param token")).unwrap();
        assert_eq!(err, json!({"errcode": 1, "errmsg": "missing param token"}));
    }
}
