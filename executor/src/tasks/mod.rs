use crate::Result;
use futures::future::BoxFuture;
use tracing::error;

pub mod executions;
pub mod publish;

pub use executions::execute_query_task;

pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The engine work queue.
///
/// Each accepted submission enqueues one task that owns its run to a
/// terminal status. The channel is bounded by `task_queue_size`, so a burst
/// of submissions backpressures the HTTP surface instead of piling up
/// futures, and `thread_pool_size` workers drain it, which is the
/// process-wide bound on concurrently executing runs.
pub struct TasksQueue {
    workers: usize,
    sender: flume::Sender<TaskFn>,
    receiver: flume::Receiver<TaskFn>,
}

impl TasksQueue {
    pub fn new(queue_size: usize, workers: usize) -> Self {
        let (sender, receiver) = flume::bounded(queue_size);
        Self { workers, sender, receiver }
    }

    /// Enqueue a task, waiting for a slot while the queue is full.
    ///
    /// A successful push only means the run was accepted; its outcome is
    /// reflected in the query record, not here.
    pub async fn push(&self, task: TaskFn) -> Result<()> {
        self.sender.send_async(task).await?;
        Ok(())
    }

    /// Start the worker set.
    ///
    /// A task returning an error is logged and dropped, the worker moves on
    /// to the next run. Engine tasks swallow their own failures into the
    /// query record, so an error surfacing here means the orchestration
    /// never even started.
    pub async fn start(&self) {
        for worker in 0..self.workers {
            let receiver = self.receiver.clone();
            tokio::spawn(async move {
                while let Ok(task) = receiver.recv_async().await {
                    if let Err(e) = task().await {
                        error!("Engine worker {} dropped a failed task: {:?}", worker, e);
                    }
                }
            });
        }
    }
}
