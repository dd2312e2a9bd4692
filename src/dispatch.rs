//! Dispatcher: binds a pending job to an eligible worker and drives the
//! RPC exchange.
//!
//! One caller, one worker, synchronous: the submitting task blocks through
//! the whole worker round trip, including the simulated cost sleep. Worker
//! claims happen inside the same transaction that reads the alive status,
//! so two concurrent dispatches cannot pick the same worker.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::expr;
use crate::model::{CostTable, Job, JobStatus, Worker};
use crate::rpc::{CalculateRequest, WorkerClient};
use crate::storage::Storage;

/// Outcome of the planning transaction. Only `Dispatch` leads to an RPC;
/// the other arms commit whatever was written (a new pending row must
/// survive a failed worker claim) and report to the caller.
enum Plan {
    Cached(i64),
    InProgress(i64),
    NoWorker,
    Dispatch { job_id: i64, worker: Worker },
}

pub struct Dispatcher<C: WorkerClient> {
    storage: Arc<Mutex<Storage>>,
    client: C,
    rpc_timeout: Duration,
}

impl<C: WorkerClient> Dispatcher<C> {
    pub fn new(storage: Arc<Mutex<Storage>>, client: C, rpc_timeout: Duration) -> Self {
        Self {
            storage,
            client,
            rpc_timeout,
        }
    }

    fn storage(&self) -> MutexGuard<'_, Storage> {
        // A poisoned lock only means another request panicked mid-access;
        // the SQLite transaction it held has already rolled back.
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submit an expression for evaluation on behalf of `owner`.
    ///
    /// Returns the cached result without any worker RPC when the same
    /// (expression, owner) pair already succeeded. A job left `pending` by
    /// an earlier `NoWorkerAvailable`, or one that `failed`, is driven
    /// again; a job currently `processing` is not dispatched a second time.
    pub async fn submit(&self, expression: &str, owner: &str, costs: &CostTable) -> Result<i64> {
        expr::validate(expression)?;

        let plan = self.storage().with_transaction(|ctx| {
            let job = match ctx.find_job(expression, owner)? {
                Some(job) => match job.status {
                    JobStatus::Success => {
                        let result = job
                            .result
                            .ok_or_else(|| Error::Other("success row without result".to_string()))?;
                        return Ok(Plan::Cached(result));
                    }
                    JobStatus::Processing => return Ok(Plan::InProgress(job.id)),
                    JobStatus::Pending | JobStatus::Failed => job,
                },
                None => ctx.insert_job(expression, owner)?,
            };

            let Some(worker) = ctx.claim_worker(owner)? else {
                return Ok(Plan::NoWorker);
            };
            ctx.update_job_status(job.id, JobStatus::Processing)?;

            Ok(Plan::Dispatch {
                job_id: job.id,
                worker,
            })
        })?;

        match plan {
            Plan::Cached(result) => {
                info!(owner, expression, result, "cache hit");
                Ok(result)
            }
            Plan::InProgress(job_id) => Err(Error::JobInProgress(job_id)),
            Plan::NoWorker => Err(Error::NoWorkerAvailable {
                owner: owner.to_string(),
            }),
            Plan::Dispatch { job_id, worker } => {
                self.run_rpc(job_id, expression, costs, &worker).await
            }
        }
    }

    /// Re-dispatch an owner's pending backlog, one job at a time. Invoked
    /// on heartbeat receipt so a worker that just came alive clears jobs
    /// without the caller re-polling. Stops at the first missing worker.
    ///
    /// Cost tables are not persisted, so backlog jobs run with zero
    /// simulated cost.
    pub async fn dispatch_pending(&self, owner: &str) -> Result<usize> {
        let pending: Vec<Job> = self.storage().pending_jobs(owner)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let costs = CostTable::default();
        let mut dispatched = 0;
        for job in pending {
            match self.drive_pending(&job, owner, &costs).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(Error::NoWorkerAvailable { .. }) => break,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "backlog dispatch failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Claim a worker for one backlog job and run it to completion.
    /// Returns false when the job no longer needs dispatching.
    async fn drive_pending(&self, job: &Job, owner: &str, costs: &CostTable) -> Result<bool> {
        let worker = self.storage().with_transaction(|ctx| {
            // The job may have been resolved between listing and now.
            if ctx.get_job(job.id)?.status != JobStatus::Pending {
                return Ok(None);
            }
            let Some(worker) = ctx.claim_worker(owner)? else {
                return Err(Error::NoWorkerAvailable {
                    owner: owner.to_string(),
                });
            };
            ctx.update_job_status(job.id, JobStatus::Processing)?;
            Ok(Some(worker))
        })?;

        match worker {
            Some(worker) => {
                self.run_rpc(job.id, &job.expression, costs, &worker).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The synchronous worker exchange: RPC with a deadline, then one
    /// finalizing transaction that records the outcome and releases the
    /// busy claim on every path.
    async fn run_rpc(
        &self,
        job_id: i64,
        expression: &str,
        costs: &CostTable,
        worker: &Worker,
    ) -> Result<i64> {
        info!(job_id, worker_id = worker.id, endpoint = %worker.endpoint, "dispatching");

        let request = CalculateRequest {
            expression: expression.to_string(),
            costs: *costs,
        };
        let reply = match tokio::time::timeout(
            self.rpc_timeout,
            self.client.calculate(&worker.endpoint, &request),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => Err(Error::WorkerUnreachable {
                endpoint: worker.endpoint.clone(),
                reason: format!("deadline of {:?} exceeded", self.rpc_timeout),
            }),
        };

        let outcome = reply.and_then(|response| {
            response.result.parse::<i64>().map_err(|_| {
                Error::WorkerUnreachable {
                    endpoint: worker.endpoint.clone(),
                    reason: format!("non-numeric result '{}'", response.result),
                }
            })
        });

        self.storage().with_transaction(|ctx| {
            ctx.release_worker(worker.id)?;
            match &outcome {
                Ok(result) => {
                    ctx.complete_job(job_id, *result)?;
                }
                Err(e) => {
                    warn!(job_id, worker_id = worker.id, error = %e, "dispatch failed");
                    ctx.update_job_status(job_id, JobStatus::Failed)?;
                }
            }
            Ok(())
        })?;

        if let Ok(result) = &outcome {
            info!(job_id, result, "job succeeded");
        }
        outcome
    }
}
