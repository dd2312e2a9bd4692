//! Core data model.
//!
//! A job is one tracked (expression, owner) evaluation request and its
//! outcome. A worker is one evaluation process, privately owned, that
//! reports heartbeats. Both live in SQLite; ids are assigned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One distinct (expression, owner) pair and its evaluation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Monotonically assigned on insert.
    pub id: i64,

    /// The raw infix expression as submitted.
    pub expression: String,

    /// Opaque caller identity. A job is only ever dispatched to a worker
    /// with the same owner.
    pub owner: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Numeric result, present iff status is `Success`.
    pub result: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet handed to a worker.
    Pending,
    /// A worker RPC is in flight.
    Processing,
    /// Evaluated; result stored. Terminal — later submissions are cache hits.
    Success,
    /// Worker RPC or evaluation failed. Re-dispatchable on resubmission.
    Failed,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Pending) // startup recovery after a crash mid-dispatch
                | (Failed, Processing) // resubmission re-dispatches
        )
    }

    /// Is this a terminal status? Only `Success` is — a failed job can be
    /// driven again by submitting the same (expression, owner) pair.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// One evaluation process known to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,

    /// host:port the dispatcher calls for evaluation.
    pub endpoint: String,

    /// Only this owner's jobs may be dispatched here.
    pub owner: String,

    pub status: WorkerStatus,

    /// Monotonically non-decreasing; bumped on every heartbeat receipt.
    pub last_ping: DateTime<Utc>,
}

/// Liveness status of a worker.
///
/// `Alive ⇄ Busy` brackets one evaluation; `Dead` is entered only by the
/// timeout sweep and left only by a later heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Alive,
    Busy,
    Dead,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Alive => "alive",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "alive" => Ok(WorkerStatus::Alive),
            "busy" => Ok(WorkerStatus::Busy),
            "dead" => Ok(WorkerStatus::Dead),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Operator cost table
// ---------------------------------------------------------------------------

/// Per-request mapping of operator to simulated execution duration (ms).
///
/// Travels explicitly from the facade through the dispatcher into the RPC
/// payload; never process-global state. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTable {
    #[serde(default)]
    pub add: u64,
    #[serde(default)]
    pub sub: u64,
    #[serde(default)]
    pub mul: u64,
    #[serde(default)]
    pub div: u64,
    #[serde(default)]
    pub pow: u64,
}

impl CostTable {
    /// Cost in milliseconds for one occurrence of `op`, if it is an operator.
    pub fn cost_of(&self, op: char) -> Option<u64> {
        match op {
            '+' => Some(self.add),
            '-' => Some(self.sub),
            '*' => Some(self.mul),
            '/' => Some(self.div),
            '^' => Some(self.pow),
            _ => None,
        }
    }
}
