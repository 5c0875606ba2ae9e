//! Bounded worker-pool task dispatcher (spec §4.5). Tasks are pushed onto a
//! shared work channel; up to `worker_count` workers pull and run handlers
//! concurrently. Completions and mid-execution messages fan out over
//! `tokio::sync::broadcast` channels — the same notifier pattern the
//! teacher's `QueueWorker` uses for change events.

mod types;

pub use types::{QueueStatus, Task, TaskMessage, TaskResult, TaskStatus};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::value::Value;

pub type TaskOutput = Result<Value, String>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = TaskOutput> + Send>>;
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Per-task timeout (spec §5: "a per-task timeout, default 10 minutes").
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// A fixed-size worker pool dispatching typed task payloads to registered
/// handlers (spec §4.5). Shared via `Arc<TaskQueue>`, matching the teacher's
/// `Arc<QueueWorker>` usage (`self: Arc<Self>` on `start`).
pub struct TaskQueue {
    handlers: DashMap<String, Handler>,
    work_tx: mpsc::UnboundedSender<Task>,
    work_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Task>>>,
    completion_tx: broadcast::Sender<TaskResult>,
    message_tx: broadcast::Sender<TaskMessage>,
    counters: Arc<Counters>,
    worker_count: usize,
    timeout: Duration,
}

impl TaskQueue {
    pub fn new(worker_count: usize) -> Self {
        Self::with_timeout(worker_count, DEFAULT_TASK_TIMEOUT)
    }

    pub fn with_timeout(worker_count: usize, timeout: Duration) -> Self {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (completion_tx, _) = broadcast::channel(1024);
        let (message_tx, _) = broadcast::channel(1024);
        TaskQueue {
            handlers: DashMap::new(),
            work_tx,
            work_rx: Arc::new(AsyncMutex::new(work_rx)),
            completion_tx,
            message_tx,
            counters: Arc::new(Counters::default()),
            worker_count: worker_count.max(1),
            timeout,
        }
    }

    /// Register the handler invoked for every task of `kind`. Registering
    /// again for the same `kind` replaces the previous handler.
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        self.handlers
            .insert(kind.into(), Arc::new(move |data| Box::pin(handler(data)) as HandlerFuture));
    }

    /// Spawn `worker_count` worker loops pulling from the shared work queue.
    pub fn start(self: &Arc<Self>) {
        for i in 0..self.worker_count {
            let queue = self.clone();
            tokio::spawn(async move {
                tracing::info!(worker = i, "task queue worker started");
                queue.run_worker().await
            });
        }
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let task = {
                let mut rx = self.work_rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else { break };

            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.counters.running.fetch_add(1, Ordering::SeqCst);

            let result = self.run_task(task).await;

            self.counters.running.fetch_sub(1, Ordering::SeqCst);
            match result.status {
                TaskStatus::Completed => {
                    self.counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                TaskStatus::Failed => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
            let _ = self.completion_tx.send(result);
        }
    }

    async fn run_task(&self, task: Task) -> TaskResult {
        let Task { id, kind, data } = task;
        let handler = self.handlers.get(&kind).map(|h| h.clone());
        let Some(handler) = handler else {
            warn!(task_id = %id, %kind, "no handler registered for task kind");
            return TaskResult {
                id,
                kind: kind.clone(),
                status: TaskStatus::Failed,
                output: None,
                error: Some(format!("no handler registered for '{kind}'")),
            };
        };

        match tokio::time::timeout(self.timeout, handler(data)).await {
            Ok(Ok(output)) => TaskResult {
                id,
                kind,
                status: TaskStatus::Completed,
                output: Some(output),
                error: None,
            },
            Ok(Err(error)) => TaskResult {
                id,
                kind,
                status: TaskStatus::Failed,
                output: None,
                error: Some(error),
            },
            Err(_) => TaskResult {
                id,
                kind,
                status: TaskStatus::Failed,
                output: None,
                error: Some("task timed out".to_string()),
            },
        }
    }

    /// Emit a mid-execution message from inside a handler, visible to
    /// `subscribe_messages` subscribers.
    pub fn emit_message(&self, id: impl Into<String>, kind: impl Into<String>, payload: Value) {
        let _ = self.message_tx.send(TaskMessage {
            id: id.into(),
            kind: kind.into(),
            payload,
        });
    }

    /// `addTask`: enqueue a task, returning its generated id immediately.
    pub fn add_task(&self, kind: impl Into<String>, data: Value) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let task = Task {
            id: id.clone(),
            kind: kind.into(),
            data,
        };
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        // An unbounded channel only errs once every receiver has dropped;
        // that can't happen while `self` (and thus `work_rx`) is alive.
        let _ = self.work_tx.send(task);
        id
    }

    /// `awaitTask`: enqueue a task and wait for its completion.
    pub async fn await_task(&self, kind: impl Into<String>, data: Value) -> TaskResult {
        let mut completions = self.completion_tx.subscribe();
        let id = self.add_task(kind, data);
        loop {
            match completions.recv().await {
                Ok(result) if result.id == id => return result,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return TaskResult {
                        id,
                        kind: String::new(),
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some("task queue shut down before completion".to_string()),
                    }
                }
            }
        }
    }

    /// `awaitAllTasks`: block until no task is pending or running.
    pub async fn await_all_tasks(&self) {
        loop {
            if self.counters.pending.load(Ordering::SeqCst) == 0 && self.counters.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// `getStatus`.
    pub fn get_status(&self) -> QueueStatus {
        let pending = self.counters.pending.load(Ordering::SeqCst);
        let running = self.counters.running.load(Ordering::SeqCst);
        let completed = self.counters.completed.load(Ordering::SeqCst);
        let failed = self.counters.failed.load(Ordering::SeqCst);
        QueueStatus {
            pending,
            running,
            completed,
            failed,
            total: pending + running + completed + failed,
        }
    }

    /// `onTaskComplete` / `onAnyTaskComplete`: subscribe to every task's
    /// terminal result; filter on `TaskResult::id`/`kind` as needed.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<TaskResult> {
        self.completion_tx.subscribe()
    }

    /// `onTaskMessage` / `onAnyTaskMessage`: subscribe to mid-execution
    /// messages from every task; filter on `TaskMessage::id`/`kind` as needed.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<TaskMessage> {
        self.message_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let queue = Arc::new(TaskQueue::new(2));
        queue.register_handler("double", |data| async move {
            match data {
                Value::Int64(n) => Ok(Value::Int64(n * 2)),
                _ => Err("expected an int".to_string()),
            }
        });
        queue.start();

        let result = queue.await_task("double", Value::Int64(21)).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.output, Some(Value::Int64(42)));
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_blocking_other_tasks() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.register_handler("known", |_| async move { Ok(Value::Bool(true)) });
        queue.start();

        let unknown = queue.await_task("mystery", Value::Null).await;
        assert_eq!(unknown.status, TaskStatus::Failed);

        let known = queue.await_task("known", Value::Null).await;
        assert_eq!(known.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn await_all_tasks_waits_for_every_submission() {
        let queue = Arc::new(TaskQueue::new(4));
        let counter = Arc::new(AtomicU32::new(0));
        let handler_counter = counter.clone();
        queue.register_handler("count", move |_| {
            let counter = handler_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        queue.start();

        for _ in 0..10 {
            queue.add_task("count", Value::Null);
        }
        queue.await_all_tasks().await;

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        let status = queue.get_status();
        assert_eq!(status.completed, 10);
        assert_eq!(status.pending + status.running, 0);
    }

    #[tokio::test]
    async fn subscribers_observe_mid_execution_messages() {
        let queue = Arc::new(TaskQueue::new(1));
        let mut messages = queue.subscribe_messages();
        let queue_for_handler = queue.clone();
        queue.register_handler("chatty", move |_| {
            let queue = queue_for_handler.clone();
            async move {
                queue.emit_message("chatty-task", "chatty", Value::String("working".to_string()));
                Ok(Value::Null)
            }
        });
        queue.start();

        queue.add_task("chatty", Value::Null);
        let message = messages.recv().await.unwrap();
        assert_eq!(message.payload, Value::String("working".to_string()));
    }
}
