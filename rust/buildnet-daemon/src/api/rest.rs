//! REST API server

use crate::api::models::{CreateBuildRequest, ErrorBody, LedgerQuery, RemoveResourceQuery};
use crate::api::sse;
use crate::daemon::MasterDaemon;
use crate::error::{DaemonError, DaemonResult};
use crate::registry::{ResourceSpec, ResourceUpdate};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use buildnet_ledger::{Actor, ActorKind};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Error wrapper mapping the daemon taxonomy onto status codes
pub struct ApiError(DaemonError);

impl From<DaemonError> for ApiError {
    fn from(e: DaemonError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONFLICTING_STATE" | "SESSION_QUOTA_EXCEEDED" => StatusCode::CONFLICT,
            "BACKEND_UNAVAILABLE" | "LEASE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            "DEADLOCK" | "BUILD_ERROR" | "CANCELLED" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The actor attributed to changes arriving over HTTP
fn api_actor() -> Actor {
    Actor::new("http-api", "HTTP API", ActorKind::Service)
}

/// REST API server over a master daemon
pub struct ApiServer {
    daemon: Arc<MasterDaemon>,
}

impl ApiServer {
    pub fn new(daemon: Arc<MasterDaemon>) -> Self {
        Self { daemon }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/dashboard", get(dashboard))
            .route("/builds", post(create_build))
            .route("/builds/:id", get(get_build))
            .route("/builds/:id/cancel", post(cancel_build))
            .route("/resources", get(list_resources).post(add_resource))
            .route(
                "/resources/:id",
                axum::routing::patch(update_resource).delete(remove_resource),
            )
            .route("/resources/:id/drain", post(drain_resource))
            .route("/resources/:id/resume", post(resume_resource))
            .route("/sessions", get(list_sessions))
            .route("/sessions/:id", delete(end_session))
            .route("/ledger/entries", get(query_ledger))
            .route("/ledger/verify", get(verify_ledger))
            .route("/ledger/stats", get(ledger_stats))
            .route("/events", get(sse::stream_events))
            .layer(TraceLayer::new_for_http())
            .with_state(self.daemon.clone())
    }

    /// Bind and serve until the process exits
    pub async fn serve(&self, bind: &str) -> DaemonResult<()> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| DaemonError::Internal(format!("Failed to bind {}: {}", bind, e)))?;
        info!("REST API listening on http://{}", bind);
        axum::serve(listener, self.router())
            .await
            .map_err(|e| DaemonError::Internal(format!("Server error: {}", e)))?;
        Ok(())
    }
}

async fn health(State(daemon): State<Arc<MasterDaemon>>) -> Json<Value> {
    Json(daemon.health())
}

async fn dashboard(State(daemon): State<Arc<MasterDaemon>>) -> ApiResult<Json<Value>> {
    Ok(Json(daemon.get_dashboard_state().await?))
}

async fn create_build(
    State(daemon): State<Arc<MasterDaemon>>,
    Json(request): Json<CreateBuildRequest>,
) -> ApiResult<Json<Value>> {
    let result = daemon
        .request_build(request.targets, api_actor(), request.options)
        .await?;
    Ok(Json(json!(result)))
}

async fn get_build(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let snapshot = daemon
        .get_orchestrator()
        .get_build_status(&id)
        .await
        .ok_or(DaemonError::NotFound {
            entity: "build",
            id,
        })?;
    Ok(Json(json!(snapshot)))
}

async fn cancel_build(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let accepted = daemon
        .get_orchestrator()
        .cancel_build(&id, &api_actor())
        .await?;
    Ok(Json(json!({"accepted": accepted})))
}

async fn list_resources(State(daemon): State<Arc<MasterDaemon>>) -> Json<Value> {
    Json(json!(daemon.get_resources().list().await))
}

async fn add_resource(
    State(daemon): State<Arc<MasterDaemon>>,
    Json(spec): Json<ResourceSpec>,
) -> ApiResult<Json<Value>> {
    let resource = daemon.get_resources().add(spec, &api_actor()).await?;
    Ok(Json(json!(resource)))
}

async fn update_resource(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
    Json(fields): Json<ResourceUpdate>,
) -> ApiResult<Json<Value>> {
    let resource = daemon
        .get_resources()
        .update(&id, fields, &api_actor())
        .await?;
    Ok(Json(json!(resource)))
}

async fn remove_resource(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveResourceQuery>,
) -> ApiResult<StatusCode> {
    daemon
        .get_resources()
        .remove(&id, &api_actor(), query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn drain_resource(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let resource = daemon.get_resources().drain(&id, &api_actor()).await?;
    Ok(Json(json!(resource)))
}

async fn resume_resource(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let resource = daemon.get_resources().resume(&id, &api_actor()).await?;
    Ok(Json(json!(resource)))
}

async fn list_sessions(State(daemon): State<Arc<MasterDaemon>>) -> Json<Value> {
    Json(json!(daemon.get_sessions().list_active().await))
}

async fn end_session(
    State(daemon): State<Arc<MasterDaemon>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    daemon
        .get_sessions()
        .end(&id, Some("ended via api"))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query_ledger(
    State(daemon): State<Arc<MasterDaemon>>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Json<Value>> {
    let entries = daemon
        .get_ledger()
        .query_entries(
            &query.filter(),
            query.limit.unwrap_or(100),
            query.offset.unwrap_or(0),
        )
        .await
        .map_err(DaemonError::from)?;
    Ok(Json(json!(entries)))
}

async fn verify_ledger(State(daemon): State<Arc<MasterDaemon>>) -> ApiResult<Json<Value>> {
    let report = daemon
        .get_ledger()
        .verify_integrity(None)
        .await
        .map_err(DaemonError::from)?;
    Ok(Json(json!(report)))
}

async fn ledger_stats(State(daemon): State<Arc<MasterDaemon>>) -> ApiResult<Json<Value>> {
    let stats = daemon
        .get_ledger()
        .stats()
        .await
        .map_err(DaemonError::from)?;
    Ok(Json(json!(stats)))
}
