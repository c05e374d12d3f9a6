//! Job Scheduler (§4.5): cron-like periodic jobs plus on-demand runs,
//! backed by a single worker pool with a per-job-name concurrency cap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::jobs::{JobRun, JobState};
use crate::store::Store;

/// A runnable unit of work. Boxed so the scheduler can hold a
/// heterogeneous set of jobs behind one interface.
pub type JobFn = Arc<dyn Fn() -> futures_util::future::BoxFuture<'static, Result<String, AppError>> + Send + Sync>;

#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub interval: Duration,
    /// Multiple concurrent runs of the same job name are allowed only when
    /// this is set (§4.5 "per-job-name concurrency cap = 1 unless
    /// explicitly marked re-entrant").
    pub reentrant: bool,
    pub run: JobFn,
}

/// Drives periodic jobs and tracks on-demand submissions. Concurrency is
/// bounded globally by a semaphore and per job name by `running_job_names`.
pub struct JobScheduler {
    store: Store,
    definitions: Vec<JobDefinition>,
    permits: Arc<Semaphore>,
    running_job_names: Arc<SyncMutex<HashSet<String>>>,
}

impl JobScheduler {
    pub fn new(store: Store, worker_pool_size: usize) -> Self {
        Self {
            store,
            definitions: Vec::new(),
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            running_job_names: Arc::new(SyncMutex::new(HashSet::new())),
        }
    }

    pub fn register(&mut self, definition: JobDefinition) {
        self.definitions.push(definition);
    }

    /// Spawns one ticking task per registered job plus the 24h retention
    /// sweep (§4.5 "retrievable by id for at least 24h").
    pub fn spawn_all(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for definition in self.definitions.clone() {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(definition.interval);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    if let Err(err) = scheduler.run_now(&definition).await {
                        error!(job = %definition.name, error = %err, "job run failed to start");
                    }
                }
            }));
        }

        let sweep_store = self.store.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match sweep_store.sweep_expired_job_runs().await {
                    Ok(n) if n > 0 => info!(dropped = n, "swept expired job runs"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "job run retention sweep failed"),
                }
            }
        }));

        handles
    }

    /// Submits a job by name for immediate, on-demand execution (§4.5
    /// "on-demand jobs submitted by API"). Returns the `JobRun` id the
    /// caller can poll.
    pub async fn submit_on_demand(&self, name: &str) -> Result<Uuid, AppError> {
        let definition = self
            .definitions
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("job '{name}'")))?;
        let run = self.store.create_job_run(name).await?;
        let scheduler_store = self.store.clone();
        let permits = self.permits.clone();
        let running_job_names = self.running_job_names.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            Self::execute(
                scheduler_store,
                permits,
                running_job_names,
                run_id,
                definition,
            )
            .await;
        });
        Ok(run_id)
    }

    async fn run_now(&self, definition: &JobDefinition) -> Result<(), AppError> {
        let run = self.store.create_job_run(&definition.name).await?;
        let scheduler_store = self.store.clone();
        let permits = self.permits.clone();
        let running_job_names = self.running_job_names.clone();
        let definition = definition.clone();
        tokio::spawn(async move {
            Self::execute(scheduler_store, permits, running_job_names, run.id, definition).await;
        });
        Ok(())
    }

    async fn execute(
        store: Store,
        permits: Arc<Semaphore>,
        running_job_names: Arc<SyncMutex<HashSet<String>>>,
        run_id: Uuid,
        definition: JobDefinition,
    ) {
        if !definition.reentrant {
            let mut running = running_job_names.lock();
            if running.contains(&definition.name) {
                drop(running);
                let _ = store
                    .update_job_run(
                        run_id,
                        JobState::Cancelled,
                        None,
                        Some("another instance of this job is already running".to_string()),
                    )
                    .await;
                return;
            }
            running.insert(definition.name.clone());
        }

        let _permit = permits.acquire_owned().await.expect("semaphore not closed");
        let _ = store.update_job_run(run_id, JobState::Running, None, None).await;

        let result = (definition.run)().await;

        if !definition.reentrant {
            running_job_names.lock().remove(&definition.name);
        }

        match result {
            Ok(payload) => {
                let _ = store
                    .update_job_run(run_id, JobState::Succeeded, Some(payload), None)
                    .await;
            }
            Err(err) => {
                error!(job = %definition.name, error = %err, "job run failed");
                let _ = store
                    .update_job_run(run_id, JobState::Failed, None, Some(err.to_string()))
                    .await;
            }
        }
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>, AppError> {
        self.store.get_job_run(id).await
    }
}
