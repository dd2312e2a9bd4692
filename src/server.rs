//! Orchestrator HTTP facade.
//!
//! Receives validated expressions from already-authenticated callers,
//! heartbeats from workers, and worker registrations. Owner identity is an
//! opaque string supplied by the (external) auth layer.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::liveness::LivenessMonitor;
use crate::model::{CostTable, Job};
use crate::rpc::{ErrorBody, PingRequest, RegisterRequest, RegisterResponse, WorkerClient};
use crate::storage::Storage;

pub struct AppState<C: WorkerClient> {
    pub dispatcher: Arc<Dispatcher<C>>,
    pub liveness: Arc<LivenessMonitor>,
    pub storage: Arc<Mutex<Storage>>,
}

impl<C: WorkerClient> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            liveness: Arc::clone(&self.liveness),
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<C: WorkerClient> AppState<C> {
    fn storage(&self) -> MutexGuard<'_, Storage> {
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Deserialize)]
pub struct CalculateApiRequest {
    pub expression: String,
    pub owner: String,
    /// Five per-operator costs in milliseconds; omitted operators cost 0.
    #[serde(default)]
    pub costs: CostTable,
}

#[derive(Debug, Serialize)]
pub struct CalculateApiResponse {
    pub result: i64,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub owner: String,
}

#[derive(Debug, Deserialize)]
pub struct LivenessUpdate {
    pub timeout_ms: u64,
}

/// Error wrapper mapping failure kinds onto HTTP statuses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidExpression(_) => StatusCode::BAD_REQUEST,
            Error::DivisionByZero => StatusCode::UNPROCESSABLE_ENTITY,
            Error::JobInProgress(_) => StatusCode::CONFLICT,
            Error::NoWorkerAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::WorkerUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. }
            | Error::Storage(_)
            | Error::Config(_)
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router<C: WorkerClient>(state: AppState<C>) -> Router {
    Router::new()
        .route("/api/calculate", post(calculate::<C>))
        .route("/api/ping", post(ping::<C>))
        .route("/api/agents", post(register_worker::<C>))
        .route("/api/jobs", get(list_jobs::<C>))
        .route("/api/config/liveness", put(set_liveness_timeout::<C>))
        .with_state(state)
}

/// Bind and serve the orchestrator until `shutdown` resolves; in-flight
/// requests drain before this returns.
pub async fn serve<C: WorkerClient>(
    addr: SocketAddr,
    state: AppState<C>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);
    info!(addr = %addr, "orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Other(format!("bind {addr}: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Other(format!("server error: {e}")))?;
    info!("orchestrator stopped");
    Ok(())
}

async fn calculate<C: WorkerClient>(
    State(state): State<AppState<C>>,
    Json(req): Json<CalculateApiRequest>,
) -> ApiResult<Json<CalculateApiResponse>> {
    let result = state
        .dispatcher
        .submit(&req.expression, &req.owner, &req.costs)
        .await?;
    Ok(Json(CalculateApiResponse { result }))
}

/// Heartbeat receipt: touch the worker, sweep stale workers, then try to
/// clear the owner's pending backlog in the background.
async fn ping<C: WorkerClient>(
    State(state): State<AppState<C>>,
    Json(req): Json<PingRequest>,
) -> ApiResult<StatusCode> {
    state.liveness.heartbeat(req.worker_id, &req.owner)?;
    state.liveness.sweep()?;

    let dispatcher = Arc::clone(&state.dispatcher);
    let owner = req.owner.clone();
    tokio::spawn(async move {
        match dispatcher.dispatch_pending(&owner).await {
            Ok(0) => {}
            Ok(n) => info!(owner = %owner, dispatched = n, "backlog cleared on heartbeat"),
            Err(e) => warn!(owner = %owner, error = %e, "backlog dispatch on heartbeat failed"),
        }
    });

    Ok(StatusCode::OK)
}

async fn register_worker<C: WorkerClient>(
    State(state): State<AppState<C>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    let worker_id = state.storage().insert_worker(&req.endpoint, &req.owner)?;
    info!(worker_id, endpoint = %req.endpoint, owner = %req.owner, "worker registered");
    Ok(Json(RegisterResponse { worker_id }))
}

async fn list_jobs<C: WorkerClient>(
    State(state): State<AppState<C>>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let jobs = state.storage().list_jobs(&query.owner)?;
    Ok(Json(jobs))
}

async fn set_liveness_timeout<C: WorkerClient>(
    State(state): State<AppState<C>>,
    Json(update): Json<LivenessUpdate>,
) -> ApiResult<StatusCode> {
    state
        .liveness
        .set_timeout(Duration::from_millis(update.timeout_ms));
    Ok(StatusCode::NO_CONTENT)
}
