//! Axum transport: the classroom WebSocket, reporting routes and health.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Instrument};

use classhub_core::{Identity, Principal, SceneId, UnitId};
use classhub_settings::ServerSettings;
use classhub_store::UnitStore;

use crate::client::ClientHandle;
use crate::connection::{run_connection, ConnectionLimits};
use crate::error::ConnectError;
use crate::hub::{Hub, HubConfig, HubHandle};
use crate::processor::Processor;
use crate::reporting;
use crate::services::{IdentityService, UnitDirectory};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: Arc<dyn UnitStore>,
    pub identity: Arc<dyn IdentityService>,
    pub directory: Arc<dyn UnitDirectory>,
    pub limits: ConnectionLimits,
    pub outbound_queue: usize,
    pub max_message_size: usize,
}

/// A connection that passed authentication, not yet in the Hub.
pub struct Admission {
    pub client: Arc<ClientHandle>,
    pub outbound: mpsc::Receiver<String>,
    pub scene_id: SceneId,
}

/// Resolve the token and unit for a new connection. Nothing in the Hub is
/// touched; the only side effect is creating the unit's scene counter.
pub async fn admit(state: &AppState, unit_id: &str, token: &str) -> Result<Admission, ConnectError> {
    let unit_id = unit_id.trim();
    if unit_id.is_empty() {
        return Err(ConnectError::MissingUnit);
    }
    if token.is_empty() {
        return Err(ConnectError::MissingToken);
    }
    let unit = UnitId::from_raw(unit_id);

    let principal = state.identity.resolve_token(token).await?;
    let mut unit_info = state.directory.unit_info(&unit).await?;
    unit_info.unit_id = unit.clone();
    let identity = match &principal {
        Principal::User(user) => state.directory.unit_identity(&unit, &user.uid).await?,
        Principal::Device(_) => Identity::Unclassified,
    };
    let scene_id = state.store.init_scene_id(&unit)?;

    let (client, outbound) =
        ClientHandle::new(principal, identity, Arc::new(unit_info), state.outbound_queue);
    Ok(Admission {
        client,
        outbound,
        scene_id,
    })
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/ngx/center/units/{unit_id}", get(ws_handler))
        .route("/v2/ngx/center/units/{unit_id}/", get(ws_handler))
        .route("/v2/units/{unit_id}/users", get(reporting::users))
        .route("/v2/units/{unit_id}/modules/status", get(reporting::module_status))
        .route("/v2/units/{unit_id}/modules/list", get(reporting::module_list))
        .route("/v2/units/{unit_id}/chat/message", get(reporting::chat_messages))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the Hub and the HTTP server.
pub async fn start(
    settings: &ServerSettings,
    store: Arc<dyn UnitStore>,
    identity: Arc<dyn IdentityService>,
    directory: Arc<dyn UnitDirectory>,
) -> Result<ServerHandle, std::io::Error> {
    let (hub, hub_task) = Hub::spawn(HubConfig {
        command_queue: settings.hub_queue,
        ink_capacity: settings.ink_channel_capacity,
        send_timeout: settings.hub_send_timeout(),
    });

    let state = AppState {
        hub: hub.clone(),
        store,
        identity,
        directory,
        limits: ConnectionLimits::from(settings),
        outbound_queue: settings.outbound_queue,
        max_message_size: settings.max_message_size,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), host = %settings.host, "classhub server started");

    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            error!(%error, "http server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        server,
        hub_task,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub hub: HubHandle,
    server: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and stop the Hub.
    pub fn shutdown(self) {
        self.server.abort();
        self.hub_task.abort();
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    #[serde(default)]
    token: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(unit_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, unit_id, query.token, state))
}

async fn handle_socket(mut socket: WebSocket, unit_id: String, token: String, state: AppState) {
    let admission = match admit(&state, &unit_id, &token).await {
        Ok(admission) => admission,
        Err(error) => {
            warn!(unit_id = %unit_id, %error, "connection refused");
            let _ = socket.send(WsMessage::Text(error.to_string().into())).await;
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let Admission {
        client,
        outbound,
        scene_id,
    } = admission;
    let span = info_span!("conn", unit_id = %client.unit_id, client_id = %client.id);
    let processor = Processor::new(client, state.hub.clone(), state.store.clone(), scene_id);
    let (sink, stream) = socket.split();

    run_connection(sink, stream, outbound, processor, state.hub, state.limits)
        .instrument(span)
        .await;
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "clients": state.hub.client_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use classhub_core::{DevicePrincipal, UnitInfo, UserPrincipal};
    use classhub_store::SqliteStore;

    struct StubIdentity;

    #[async_trait]
    impl IdentityService for StubIdentity {
        async fn resolve_token(&self, token: &str) -> Result<Principal, ServiceError> {
            match token {
                "teacher-token" => Ok(Principal::User(UserPrincipal {
                    uid: "t1".into(),
                    ..Default::default()
                })),
                "pad-token" => Ok(Principal::Device(DevicePrincipal {
                    client_id: "pad".into(),
                    device_type: 4,
                    ..Default::default()
                })),
                _ => Err(ServiceError::InvalidToken),
            }
        }
    }

    struct StubDirectory {
        open: bool,
    }

    #[async_trait]
    impl UnitDirectory for StubDirectory {
        async fn unit_info(&self, unit: &UnitId) -> Result<UnitInfo, ServiceError> {
            if unit.as_str() == "missing" {
                return Err(ServiceError::UnitNotFound(unit.to_string()));
            }
            Ok(UnitInfo {
                status: "1".into(),
                ..Default::default()
            })
        }

        async fn unit_identity(&self, _: &UnitId, _: &str) -> Result<Identity, ServiceError> {
            Ok(Identity::Teacher)
        }

        async fn is_open_access(&self, _: &UnitId) -> Result<bool, ServiceError> {
            Ok(self.open)
        }
    }

    fn app_state(open: bool) -> (AppState, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let state = AppState {
            hub,
            store: store.clone(),
            identity: Arc::new(StubIdentity),
            directory: Arc::new(StubDirectory { open }),
            limits: ConnectionLimits::default(),
            outbound_queue: 8,
            max_message_size: 512,
        };
        (state, store)
    }

    #[tokio::test]
    async fn admit_requires_unit_and_token() {
        let (state, _) = app_state(false);
        assert!(matches!(admit(&state, " ", "x").await, Err(ConnectError::MissingUnit)));
        assert!(matches!(admit(&state, "u1", "").await, Err(ConnectError::MissingToken)));
    }

    #[tokio::test]
    async fn admit_refuses_bad_token_and_unknown_unit() {
        let (state, store) = app_state(false);
        let bad = admit(&state, "u1", "forged").await;
        assert!(matches!(bad, Err(ConnectError::Service(ServiceError::InvalidToken))));
        let missing = admit(&state, "missing", "teacher-token").await;
        assert!(matches!(
            missing,
            Err(ConnectError::Service(ServiceError::UnitNotFound(_)))
        ));
        assert_eq!(state.hub.client_count(), 0);
        assert_eq!(store.scene_id(&UnitId::from_raw("u1")).unwrap(), None);
    }

    #[tokio::test]
    async fn admit_classifies_users_and_devices() {
        let (state, store) = app_state(false);

        let teacher = admit(&state, "u1", "teacher-token").await.unwrap();
        assert_eq!(teacher.client.identity, Identity::Teacher);
        assert_eq!(teacher.client.unit_id.as_str(), "u1");
        assert_eq!(teacher.scene_id, 1);

        let pad = admit(&state, "u1", "pad-token").await.unwrap();
        assert_eq!(pad.client.identity, Identity::Unclassified);
        assert!(pad.client.is_device());

        assert_eq!(store.scene_id(&UnitId::from_raw("u1")).unwrap(), Some(1));
        assert_eq!(state.hub.client_count(), 0);
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let (state, _) = app_state(true);
        let _router = build_router(state);
    }

    async fn serve(open: bool) -> ServerHandle {
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        start(
            &settings,
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(StubIdentity),
            Arc::new(StubDirectory { open }),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = serve(true).await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn closed_unit_reports_need_a_token() {
        let handle = serve(false).await;
        let base = format!("http://127.0.0.1:{}/v2/units/u1/users", handle.port);

        let denied: serde_json::Value = reqwest::get(&base).await.unwrap().json().await.unwrap();
        assert_eq!(denied["errcode"], 1);
        assert_eq!(denied["errmsg"], "missing param token");

        let forged: serde_json::Value = reqwest::get(format!("{base}?token=forged"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(forged["errmsg"], "invalid token");

        let ok: serde_json::Value = reqwest::get(format!("{base}?token=teacher-token"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ok["errcode"], 0);
        assert_eq!(ok["data"]["total"], 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn open_unit_chat_page_without_token() {
        let handle = serve(true).await;
        let url = format!("http://127.0.0.1:{}/v2/units/u1/chat/message", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["errcode"], 0);
        assert_eq!(body["data"]["list"], serde_json::json!([]));
        handle.shutdown();
    }
}
