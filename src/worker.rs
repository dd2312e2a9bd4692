//! Worker (agent) process: evaluates one expression at a time and reports
//! heartbeats to the orchestrator.
//!
//! A worker registers itself at startup, serves `CalculateExpression`
//! requests over HTTP, and pings the orchestrator on a fixed cadence until
//! shutdown. It holds no durable state of its own.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::expr;
use crate::rpc::{
    CalculateRequest, CalculateResponse, ErrorBody, PingRequest, RegisterRequest, RegisterResponse,
};

/// Everything a worker needs to run: where it listens, who owns it, and
/// where the orchestrator lives.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub bind_addr: SocketAddr,
    /// Endpoint advertised to the orchestrator; usually `bind_addr` again,
    /// but may differ behind NAT or in containers.
    pub endpoint: String,
    pub owner: String,
    pub orchestrator_url: String,
    pub heartbeat_interval: Duration,
}

/// Register with the orchestrator and return the assigned worker id.
pub async fn register(http: &reqwest::Client, opts: &AgentOptions) -> Result<i64> {
    let url = format!("{}/api/agents", opts.orchestrator_url);
    let request = RegisterRequest {
        endpoint: opts.endpoint.clone(),
        owner: opts.owner.clone(),
    };
    let response = http
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| Error::Other(format!("registration failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Other(format!("registration rejected: {e}")))?
        .json::<RegisterResponse>()
        .await
        .map_err(|e| Error::Other(format!("bad registration reply: {e}")))?;
    Ok(response.worker_id)
}

/// Ping the orchestrator once.
async fn send_ping(http: &reqwest::Client, opts: &AgentOptions, worker_id: i64) -> Result<()> {
    let url = format!("{}/api/ping", opts.orchestrator_url);
    let request = PingRequest {
        worker_id,
        owner: opts.owner.clone(),
    };
    http.post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| Error::Other(format!("ping failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Other(format!("ping rejected: {e}")))?;
    Ok(())
}

/// Heartbeat emitter: ping on a fixed interval forever. A failed ping is
/// logged and retried on the next tick — the orchestrator's sweep decides
/// what silence means.
pub async fn run_heartbeat(http: reqwest::Client, opts: AgentOptions, worker_id: i64) {
    let mut ticker = tokio::time::interval(opts.heartbeat_interval);
    // The first tick fires immediately, announcing the worker as alive.
    loop {
        ticker.tick().await;
        if let Err(e) = send_ping(&http, &opts, worker_id).await {
            warn!(worker_id, error = %e, "heartbeat failed");
        }
    }
}

struct EvalError(Error);

impl IntoResponse for EvalError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidExpression(_) => StatusCode::BAD_REQUEST,
            Error::DivisionByZero => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

/// `CalculateExpression`: evaluate, sleep the simulated cost, reply with
/// the whole-number-truncated result as a numeric string.
async fn calculate(
    Json(req): Json<CalculateRequest>,
) -> std::result::Result<Json<CalculateResponse>, EvalError> {
    let evaluation = expr::evaluate(&req.expression, &req.costs)
        .await
        .map_err(EvalError)?;
    info!(
        expression = %req.expression,
        value = evaluation.value,
        elapsed_ms = evaluation.elapsed.as_millis() as u64,
        "expression evaluated"
    );
    Ok(Json(CalculateResponse {
        result: format!("{}", evaluation.value as i64),
    }))
}

pub fn router() -> Router {
    Router::new().route("/calculate", post(calculate))
}

/// Run a worker to completion: register, start the heartbeat emitter,
/// serve evaluation requests.
pub async fn run(opts: AgentOptions) -> Result<()> {
    let http = reqwest::Client::new();

    let worker_id = register(&http, &opts).await?;
    info!(worker_id, owner = %opts.owner, endpoint = %opts.endpoint, "agent registered");

    let heartbeat_opts = opts.clone();
    let heartbeat_http = http.clone();
    tokio::spawn(async move {
        run_heartbeat(heartbeat_http, heartbeat_opts, worker_id).await;
    });

    let listener = tokio::net::TcpListener::bind(opts.bind_addr)
        .await
        .map_err(|e| Error::Other(format!("bind {}: {e}", opts.bind_addr)))?;
    info!(addr = %opts.bind_addr, "agent listening");
    if let Err(e) = axum::serve(listener, router()).await {
        error!(error = %e, "agent server failed");
        return Err(Error::Other(format!("agent server error: {e}")));
    }
    Ok(())
}
