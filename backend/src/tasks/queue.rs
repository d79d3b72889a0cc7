use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::tasks::job::JobRunner;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job queue is full")]
    Full,
    #[error("Job queue is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Input already saved to disk.
    Upload { path: PathBuf },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub task_id: Uuid,
    pub kind: JobKind,
}

pub type JobReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Bounded submission side of the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, Arc::new(Mutex::new(receiver)))
    }

    pub fn try_enqueue(&self, job: Job) -> Result<(), QueueError> {
        let task_id = job.task_id;
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        log::debug!("Job for task {} enqueued", task_id);
        Ok(())
    }
}

/// Starts `count` workers on the current actix runtime, each running one job at a time.
pub fn spawn_workers(count: usize, receiver: JobReceiver, runner: Arc<JobRunner>) {
    for worker in 0..count {
        let receiver = receiver.clone();
        let runner = runner.clone();
        actix_web::rt::spawn(async move {
            log::info!("Worker {} started", worker);
            loop {
                let job = { receiver.lock().await.recv().await };
                let Some(job) = job else {
                    break;
                };
                log::info!("Worker {} picked up task {}", worker, job.task_id);
                runner.run(job).await;
            }
            log::info!("Worker {} stopped", worker);
        });
    }
}
