//! Integration tests for the dispatcher: caching, worker claiming, and
//! failure handling, exercised through an in-process worker client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use calcd::dispatch::Dispatcher;
use calcd::error::Error;
use calcd::expr;
use calcd::model::{CostTable, JobStatus, WorkerStatus};
use calcd::rpc::{CalculateRequest, CalculateResponse, WorkerClient};
use calcd::storage::Storage;

/// Evaluates in-process and counts calls, standing in for a real worker.
#[derive(Clone)]
struct LocalWorker {
    calls: Arc<AtomicUsize>,
}

impl LocalWorker {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl WorkerClient for LocalWorker {
    async fn calculate(
        &self,
        _endpoint: &str,
        request: &CalculateRequest,
    ) -> calcd::error::Result<CalculateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = expr::compute(&request.expression)?;
        Ok(CalculateResponse {
            result: format!("{}", value as i64),
        })
    }
}

/// Fails every call at the transport level.
struct UnreachableWorker;

impl WorkerClient for UnreachableWorker {
    async fn calculate(
        &self,
        endpoint: &str,
        _request: &CalculateRequest,
    ) -> calcd::error::Result<CalculateResponse> {
        Err(Error::WorkerUnreachable {
            endpoint: endpoint.to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

/// Fails the first call, then behaves like LocalWorker.
struct FlakyWorker {
    calls: Arc<AtomicUsize>,
}

impl WorkerClient for FlakyWorker {
    async fn calculate(
        &self,
        endpoint: &str,
        request: &CalculateRequest,
    ) -> calcd::error::Result<CalculateResponse> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::WorkerUnreachable {
                endpoint: endpoint.to_string(),
                reason: "first call drops".to_string(),
            });
        }
        let value = expr::compute(&request.expression)?;
        Ok(CalculateResponse {
            result: format!("{}", value as i64),
        })
    }
}

fn test_storage() -> Arc<Mutex<Storage>> {
    Arc::new(Mutex::new(Storage::in_memory().unwrap()))
}

fn dispatcher<C: WorkerClient>(storage: Arc<Mutex<Storage>>, client: C) -> Dispatcher<C> {
    Dispatcher::new(storage, client, Duration::from_secs(5))
}

#[tokio::test]
async fn end_to_end_submit_then_cache_hit() {
    let storage = test_storage();
    storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let client = LocalWorker::new();
    let calls = Arc::clone(&client.calls);
    let d = dispatcher(Arc::clone(&storage), client);
    let costs = CostTable::default();

    let result = d.submit("3+4*2", "alice", &costs).await.unwrap();
    assert_eq!(result, 11);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    {
        let s = storage.lock().unwrap();
        let job = s.find_job("3+4*2", "alice").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.result, Some(11));
    }

    // Second submission: identical result, no second worker RPC.
    let result = d.submit("3+4*2", "alice", &costs).await.unwrap();
    assert_eq!(result, 11);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_is_released_after_success() {
    let storage = test_storage();
    let worker_id = storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let d = dispatcher(Arc::clone(&storage), LocalWorker::new());
    d.submit("2+2", "alice", &CostTable::default()).await.unwrap();

    let status = storage.lock().unwrap().get_worker(worker_id).unwrap().status;
    assert_eq!(status, WorkerStatus::Alive);
}

#[tokio::test]
async fn invalid_expression_is_rejected_before_dispatch() {
    let storage = test_storage();
    let client = LocalWorker::new();
    let calls = Arc::clone(&client.calls);
    let d = dispatcher(Arc::clone(&storage), client);

    for bad in ["1a+2", "(1+2", "1.2.3", ""] {
        let err = d.submit(bad, "alice", &CostTable::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidExpression(_)), "{bad}: {err}");
    }

    // Nothing was stored and nothing was called.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(storage.lock().unwrap().list_jobs("alice").unwrap().is_empty());
}

#[tokio::test]
async fn no_worker_leaves_job_pending() {
    let storage = test_storage();
    let d = dispatcher(Arc::clone(&storage), LocalWorker::new());

    let err = d
        .submit("1+1", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoWorkerAvailable { .. }));

    let job = storage
        .lock()
        .unwrap()
        .find_job("1+1", "alice")
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn pending_job_succeeds_once_a_worker_appears() {
    let storage = test_storage();
    let d = dispatcher(Arc::clone(&storage), LocalWorker::new());
    let costs = CostTable::default();

    assert!(d.submit("6*7", "alice", &costs).await.is_err());

    storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let result = d.submit("6*7", "alice", &costs).await.unwrap();
    assert_eq!(result, 42);
}

#[tokio::test]
async fn heartbeat_backlog_dispatch_clears_pending_jobs() {
    let storage = test_storage();
    let d = dispatcher(Arc::clone(&storage), LocalWorker::new());
    let costs = CostTable::default();

    assert!(d.submit("1+2", "alice", &costs).await.is_err());
    assert!(d.submit("2+3", "alice", &costs).await.is_err());

    storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let dispatched = d.dispatch_pending("alice").await.unwrap();
    assert_eq!(dispatched, 2);

    let s = storage.lock().unwrap();
    assert_eq!(s.find_job("1+2", "alice").unwrap().unwrap().result, Some(3));
    assert_eq!(s.find_job("2+3", "alice").unwrap().unwrap().result, Some(5));
}

#[tokio::test]
async fn workers_are_private_to_their_owner() {
    let storage = test_storage();
    storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "bob")
        .unwrap();

    let d = dispatcher(Arc::clone(&storage), LocalWorker::new());
    let err = d
        .submit("1+1", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoWorkerAvailable { .. }));
}

#[tokio::test]
async fn division_by_zero_fails_the_job_and_releases_the_worker() {
    let storage = test_storage();
    let worker_id = storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let d = dispatcher(Arc::clone(&storage), LocalWorker::new());
    let err = d
        .submit("10/0", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DivisionByZero));

    let s = storage.lock().unwrap();
    let job = s.find_job("10/0", "alice").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result, None);
    assert_eq!(s.get_worker(worker_id).unwrap().status, WorkerStatus::Alive);
}

#[tokio::test]
async fn unreachable_worker_fails_job_but_not_liveness() {
    let storage = test_storage();
    let worker_id = storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let d = dispatcher(Arc::clone(&storage), UnreachableWorker);
    let err = d
        .submit("1+1", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerUnreachable { .. }));

    let s = storage.lock().unwrap();
    assert_eq!(
        s.find_job("1+1", "alice").unwrap().unwrap().status,
        JobStatus::Failed
    );
    // An RPC failure alone never marks a worker dead; only the sweep does.
    assert_eq!(s.get_worker(worker_id).unwrap().status, WorkerStatus::Alive);
}

#[tokio::test]
async fn failed_job_is_redispatchable() {
    let storage = test_storage();
    storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let flaky = FlakyWorker {
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let d = dispatcher(Arc::clone(&storage), flaky);
    let costs = CostTable::default();

    assert!(d.submit("5+5", "alice", &costs).await.is_err());
    assert_eq!(
        storage
            .lock()
            .unwrap()
            .find_job("5+5", "alice")
            .unwrap()
            .unwrap()
            .status,
        JobStatus::Failed
    );

    // Resubmitting the same pair drives the failed job again.
    let result = d.submit("5+5", "alice", &costs).await.unwrap();
    assert_eq!(result, 10);
}

#[tokio::test]
async fn processing_job_is_not_dispatched_twice() {
    let storage = test_storage();
    storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let job_id = {
        let mut s = storage.lock().unwrap();
        let job = s.with_transaction(|ctx| ctx.insert_job("7*3", "alice")).unwrap();
        s.update_job_status(job.id, JobStatus::Processing).unwrap();
        job.id
    };

    let client = LocalWorker::new();
    let calls = Arc::clone(&client.calls);
    let d = dispatcher(Arc::clone(&storage), client);

    let err = d
        .submit("7*3", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobInProgress(id) if id == job_id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn startup_recovery_frees_jobs_orphaned_in_processing() {
    let storage = test_storage();
    let worker_id = storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    // A crash between the claim and the finalizing transaction leaves the
    // job processing and the worker busy.
    let job_id = {
        let mut s = storage.lock().unwrap();
        let job = s.with_transaction(|ctx| ctx.insert_job("1+1", "alice")).unwrap();
        s.update_job_status(job.id, JobStatus::Processing).unwrap();
        s.with_transaction(|ctx| {
            ctx.claim_worker("alice")?;
            Ok(())
        })
        .unwrap();
        job.id
    };

    // Without recovery the pair would 409 forever: the resubmission path
    // refuses a processing job and the backlog scan only sees pending.
    let client = LocalWorker::new();
    let calls = Arc::clone(&client.calls);
    let d = dispatcher(Arc::clone(&storage), client);
    let err = d
        .submit("1+1", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobInProgress(_)));
    assert_eq!(d.dispatch_pending("alice").await.unwrap(), 0);

    // The startup pass resets both rows.
    {
        let mut s = storage.lock().unwrap();
        let counts = s.with_transaction(|ctx| ctx.recover_interrupted()).unwrap();
        assert_eq!(counts, (1, 1));
        assert_eq!(s.get_job(job_id).unwrap().status, JobStatus::Pending);
        assert_eq!(s.get_worker(worker_id).unwrap().status, WorkerStatus::Alive);
    }

    // And the pair is dispatchable again.
    assert_eq!(
        d.submit("1+1", "alice", &CostTable::default()).await.unwrap(),
        2
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rpc_deadline_fails_the_job() {
    /// Never replies within the deadline.
    struct StuckWorker;

    impl WorkerClient for StuckWorker {
        async fn calculate(
            &self,
            _endpoint: &str,
            _request: &CalculateRequest,
        ) -> calcd::error::Result<CalculateResponse> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("deadline should fire first")
        }
    }

    let storage = test_storage();
    let worker_id = storage
        .lock()
        .unwrap()
        .insert_worker("127.0.0.1:9001", "alice")
        .unwrap();

    let d = Dispatcher::new(
        Arc::clone(&storage),
        StuckWorker,
        Duration::from_millis(50),
    );
    let err = d
        .submit("1+1", "alice", &CostTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerUnreachable { .. }));

    let s = storage.lock().unwrap();
    assert_eq!(
        s.find_job("1+1", "alice").unwrap().unwrap().status,
        JobStatus::Failed
    );
    // The deadline releases the busy claim too.
    assert_eq!(s.get_worker(worker_id).unwrap().status, WorkerStatus::Alive);
}
