use crate::db::{ConnectionGuard, ConnectionPool};
use crate::settings;
use crate::tasks::{TaskFn, TasksQueue};
use anyhow::{Context, Result};
use std::sync::Arc;

/// The state shared by the HTTP surface and the background workers.
#[derive(Clone)]
pub struct ServerState {
    /// A queue of engine tasks; one worker slot per concurrently running
    /// query execution.
    tasks_queue: Arc<TasksQueue>,

    /// The connection pool to the operational database.
    db_conn_pool: Arc<ConnectionPool>,
}

impl ServerState {
    pub fn new(db_conn_pool: Arc<ConnectionPool>) -> Self {
        Self {
            tasks_queue: Arc::new(TasksQueue::new(settings::get_task_queue_size(), settings::get_thread_pool_size())),
            db_conn_pool,
        }
    }

    /// Start the background tasks run by the state.
    pub async fn start(&self) {
        self.tasks_queue.start().await
    }

    /// Get a connection to the operational database.
    ///
    /// The connection is taken from the connection pool and will return to
    /// the pool once dropped.
    pub async fn get_db_connection(&self) -> Result<ConnectionGuard> {
        self.db_conn_pool
            .get()
            .await
            .map_err(anyhow::Error::from)
            .context("Cannot get a connection to the operational database.")
    }

    /// Push a task into the queue.
    ///
    /// The returned result indicates whether the task was successfully pushed
    /// into the queue, not whether it was successfully executed.
    pub async fn push_task(&self, task: TaskFn) -> Result<()> {
        self.tasks_queue.push(task).await
    }
}
