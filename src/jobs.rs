use crate::error::LifecycleResult;
use crate::models::Actor;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work that runs off the request path, always after the unit of work that
/// produced it has committed.
#[derive(Debug, Clone)]
pub enum BackgroundTask {
    /// `actor: None` is the retry sweep acting on behalf of the listing owner.
    FinalizeMedia {
        listing_id: u64,
        upload_ids: Vec<u64>,
        actor: Option<Actor>,
    },
    DeleteObjects {
        references: Vec<String>,
    },
    PurgeUploads {
        upload_ids: Vec<u64>,
    },
}

impl BackgroundTask {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundTask::FinalizeMedia { .. } => "finalize_media",
            BackgroundTask::DeleteObjects { .. } => "delete_objects",
            BackgroundTask::PurgeUploads { .. } => "purge_uploads",
        }
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: BackgroundTask) -> LifecycleResult<Value>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: Value },
    Failed { error: String, kind: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub task: &'static str,
    #[serde(flatten)]
    pub state: JobState,
}

struct Job {
    id: Uuid,
    task: BackgroundTask,
}

type Statuses = Arc<Mutex<HashMap<Uuid, (&'static str, JobState)>>>;

/// Bounded background pool. Producers only ever enqueue; a fixed number of
/// workers drain the channel.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Job>,
    statuses: Statuses,
}

/// Receiving half, turned into workers once the runner exists.
pub struct TaskReceiver {
    rx: mpsc::Receiver<Job>,
    statuses: Statuses,
}

impl TaskQueue {
    pub fn channel(capacity: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses: Statuses = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                tx,
                statuses: statuses.clone(),
            },
            TaskReceiver { rx, statuses },
        )
    }

    /// Queues `task` under a caller-chosen id and waits for channel capacity.
    pub async fn enqueue_with_id(&self, id: Uuid, task: BackgroundTask) -> bool {
        let name = task.name();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, (name, JobState::Queued));
        }
        if self.tx.send(Job { id, task }).await.is_err() {
            let mut guard = self.statuses.lock().await;
            guard.insert(
                id,
                (
                    name,
                    JobState::Failed {
                        error: "worker not available".into(),
                        kind: "internal_error".into(),
                    },
                ),
            );
            error!(target = "listings.jobs", job_id = %id, task = name, "queue_send_failed");
            return false;
        }
        debug!(target = "listings.jobs", job_id = %id, task = name, "task queued");
        true
    }

    pub async fn enqueue(&self, task: BackgroundTask) -> Uuid {
        let id = Uuid::new_v4();
        self.enqueue_with_id(id, task).await;
        id
    }

    /// Non-blocking variant for synchronous contexts such as after-commit
    /// hooks. The id is valid immediately; the status appears once queued.
    pub fn submit_with_id(&self, id: Uuid, task: BackgroundTask) {
        let queue = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    queue.enqueue_with_id(id, task).await;
                });
            }
            Err(_) => {
                warn!(target = "listings.jobs", job_id = %id, task = task.name(), "no runtime; task dropped")
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|(task, state)| JobInfo {
            id: id.to_string(),
            task,
            state,
        })
    }

    #[cfg(test)]
    pub async fn wait_for(&self, id: Uuid) -> JobInfo {
        for _ in 0..500 {
            if let Some(info) = self.get(id).await
                && matches!(info.state, JobState::Completed { .. } | JobState::Failed { .. })
            {
                return info;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job {id} did not finish");
    }
}

impl TaskReceiver {
    /// Runs up to `concurrency` tasks at a time until every sender is gone.
    pub fn spawn(self, runner: Arc<dyn TaskRunner>, concurrency: usize) -> JoinHandle<()> {
        let TaskReceiver { mut rx, statuses } = self;
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            info!(target = "listings.jobs", concurrency, "task workers started");
            while let Some(job) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let runner = runner.clone();
                let statuses = statuses.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let name = job.task.name();
                    {
                        let mut guard = statuses.lock().await;
                        guard.insert(job.id, (name, JobState::Running));
                    }

                    let started = std::time::Instant::now();
                    let result = runner.run(job.task).await;
                    crate::metrics::task_elapsed(name, started.elapsed().as_millis());
                    let state = match result {
                        Ok(result) => JobState::Completed { result },
                        Err(err) => {
                            warn!(target = "listings.jobs", job_id = %job.id, task = name, error = %err, "task failed");
                            JobState::Failed {
                                error: err.detail().to_string(),
                                kind: err.kind().code().to_string(),
                            }
                        }
                    };
                    let mut guard = statuses.lock().await;
                    guard.insert(job.id, (name, state));
                });
            }
            info!(target = "listings.jobs", "task workers stopped");
        })
    }
}
