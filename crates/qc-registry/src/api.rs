//! HTTP surface for the registry.
//!
//! Thin axum handlers over [`RegistryService`]. Error mapping:
//! `NotFound` → 404, `HotpathAgent` → 409, everything else → 500.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use qc_types::registry::{AgentHeartbeat, AgentRegistration};

use crate::error::RegistryError;
use crate::service::RegistryService;

type ApiError = (StatusCode, Json<Value>);

fn map_error(err: RegistryError) -> ApiError {
    let (status, detail) = match &err {
        RegistryError::NotFound => (StatusCode::NOT_FOUND, "Agent not found".to_string()),
        RegistryError::HotpathAgent => (StatusCode::CONFLICT, "hotpath_agent".to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    };
    (status, Json(json!({ "detail": detail })))
}

/// Build the registry router.
pub fn router(service: Arc<RegistryService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents/register", post(register_agent))
        .route("/agents/{agent_id}/heartbeat", post(agent_heartbeat))
        .route("/agents/{agent_id}/hotpath", post(set_hotpath))
        .route("/agents/{agent_id}", get(get_agent).delete(remove_agent))
        .route("/agents", get(list_agents))
        .route("/stats", get(stats))
        .with_state(service)
}

/// Bind and serve until the task is dropped or the listener fails.
pub async fn serve(service: Arc<RegistryService>, addr: SocketAddr) -> qc_types::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(qc_types::QcError::Io)?;
    info!(addr = %addr, "registry listening");
    axum::serve(listener, router(service))
        .await
        .map_err(qc_types::QcError::Io)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn register_agent(
    State(service): State<Arc<RegistryService>>,
    Json(registration): Json<AgentRegistration>,
) -> Result<Json<Value>, ApiError> {
    service.register(&registration).await.map_err(map_error)?;
    Ok(Json(json!({ "status": "success" })))
}

async fn agent_heartbeat(
    State(service): State<Arc<RegistryService>>,
    Path(agent_id): Path<String>,
    Json(heartbeat): Json<AgentHeartbeat>,
) -> Result<Json<Value>, ApiError> {
    let known = service
        .heartbeat(&agent_id, &heartbeat)
        .await
        .map_err(map_error)?;
    if !known {
        return Err(map_error(RegistryError::NotFound));
    }
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    #[serde(default)]
    healthy_only: bool,
    #[serde(default)]
    hotpath_only: bool,
}

async fn list_agents(
    State(service): State<Arc<RegistryService>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let listed = service
        .list_agents(query.healthy_only, query.hotpath_only)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::to_value(listed).map_err(|e| {
        map_error(RegistryError::Db(e.to_string()))
    })?))
}

async fn get_agent(
    State(service): State<Arc<RegistryService>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match service.get_agent(&agent_id).await.map_err(map_error)? {
        Some(agent) => Ok(Json(serde_json::to_value(agent).map_err(|e| {
            map_error(RegistryError::Db(e.to_string()))
        })?)),
        None => Err(map_error(RegistryError::NotFound)),
    }
}

#[derive(Debug, Deserialize, Default)]
struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

async fn remove_agent(
    State(service): State<Arc<RegistryService>>,
    Path(agent_id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<Value>, ApiError> {
    service
        .remove_agent(&agent_id, query.force)
        .await
        .map_err(map_error)?;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Deserialize)]
struct HotpathBody {
    hotpath: bool,
}

async fn set_hotpath(
    State(service): State<Arc<RegistryService>>,
    Path(agent_id): Path<String>,
    Json(body): Json<HotpathBody>,
) -> Result<Json<Value>, ApiError> {
    let agent = service
        .set_hotpath(&agent_id, body.hotpath)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::to_value(agent).map_err(|e| {
        map_error(RegistryError::Db(e.to_string()))
    })?))
}

async fn stats(State(service): State<Arc<RegistryService>>) -> Result<Json<Value>, ApiError> {
    let stats = service.stats().await.map_err(map_error)?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        map_error(RegistryError::Db(e.to_string()))
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AgentStore;
    use std::net::{Ipv4Addr, SocketAddrV4};

    async fn spawn_api() -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::open(dir.path().join("agents.db")).await.unwrap();
        let service = Arc::new(RegistryService::new(store, 60));

        let listener = tokio::net::TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(service)).await.unwrap();
        });
        (format!("http://{addr}"), dir)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (base, _dir) = spawn_api().await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn register_list_get_remove_cycle() {
        let (base, _dir) = spawn_api().await;
        let http = reqwest::Client::new();

        let response = http
            .post(format!("{base}/agents/register"))
            .json(&json!({"agent_id": "agent-0a1b2c3d", "host": "127.0.0.1", "port": 9100}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let listed: Value = http
            .get(format!("{base}/agents"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["agents"].as_array().unwrap().len(), 1);

        let agent: Value = http
            .get(format!("{base}/agents/agent-0a1b2c3d"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agent["agent_id"], "agent-0a1b2c3d");

        let gone = http
            .delete(format!("{base}/agents/agent-0a1b2c3d"))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::OK);

        let missing = http
            .get(format!("{base}/agents/agent-0a1b2c3d"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hotpath_delete_conflicts_without_force() {
        let (base, _dir) = spawn_api().await;
        let http = reqwest::Client::new();

        http.post(format!("{base}/agents/register"))
            .json(&json!({"agent_id": "alpha", "host": "h", "port": 1, "hotpath": true}))
            .send()
            .await
            .unwrap();

        let blocked = http
            .delete(format!("{base}/agents/alpha"))
            .send()
            .await
            .unwrap();
        assert_eq!(blocked.status(), StatusCode::CONFLICT);
        let body: Value = blocked.json().await.unwrap();
        assert_eq!(body["detail"], "hotpath_agent");

        let forced = http
            .delete(format!("{base}/agents/alpha?force=true"))
            .send()
            .await
            .unwrap();
        assert_eq!(forced.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_is_404() {
        let (base, _dir) = spawn_api().await;
        let http = reqwest::Client::new();
        let response = http
            .post(format!("{base}/agents/agent-ffffffff/heartbeat"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_endpoint() {
        let (base, _dir) = spawn_api().await;
        let http = reqwest::Client::new();
        http.post(format!("{base}/agents/register"))
            .json(&json!({"agent_id": "agent-00000001", "host": "h", "port": 1}))
            .send()
            .await
            .unwrap();

        let stats: Value = http
            .get(format!("{base}/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total_agents"], 1);
        assert_eq!(stats["healthy_agents"], 1);
    }
}
