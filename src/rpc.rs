//! Wire types and the worker RPC client.
//!
//! Two JSON surfaces: `CalculateExpression` (dispatcher → worker) and
//! `Ping` (worker → orchestrator). The client side is a trait so the
//! dispatcher can be exercised in tests without a network.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::CostTable;

/// Dispatcher → worker evaluation request. Carries the cost table
/// explicitly; workers hold no per-request state between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateRequest {
    pub expression: String,
    pub costs: CostTable,
}

/// Worker → dispatcher reply. The result is a whole-number-truncated
/// numeric string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateResponse {
    pub result: String,
}

/// Worker → orchestrator heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub worker_id: i64,
    pub owner: String,
}

/// Worker registration, sent once at worker startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub endpoint: String,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: i64,
}

/// Structured error payload, shared by both HTTP surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Reconstruct a typed error from a worker reply so evaluation
    /// failures keep their kind across the RPC boundary.
    pub fn into_error(self) -> Error {
        match self.kind.as_str() {
            "division_by_zero" => Error::DivisionByZero,
            "invalid_expression" => Error::InvalidExpression(self.message),
            _ => Error::Other(self.message),
        }
    }
}

/// Seam between the dispatcher and the worker transport.
pub trait WorkerClient: Send + Sync + 'static {
    /// Synchronous evaluation call: blocks until the worker replies or the
    /// transport fails. Deadline enforcement is the dispatcher's job.
    fn calculate(
        &self,
        endpoint: &str,
        request: &CalculateRequest,
    ) -> impl Future<Output = Result<CalculateResponse>> + Send;
}

/// HTTP/JSON transport to a worker's `/calculate` route.
#[derive(Debug, Clone, Default)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl WorkerClient for HttpWorkerClient {
    async fn calculate(
        &self,
        endpoint: &str,
        request: &CalculateRequest,
    ) -> Result<CalculateResponse> {
        let url = format!("http://{endpoint}/calculate");
        let unreachable = |reason: String| Error::WorkerUnreachable {
            endpoint: endpoint.to_string(),
            reason,
        };

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        if response.status().is_success() {
            return response
                .json::<CalculateResponse>()
                .await
                .map_err(|e| unreachable(format!("bad reply body: {e}")));
        }

        // The worker reports evaluation failures as a structured body;
        // anything unparseable is a transport-level failure.
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(body.into_error()),
            Err(_) => Err(unreachable(format!("status {status}"))),
        }
    }
}
