//! Keyed pool of spawned async work.
//!
//! Each task is identified by a `u64` (an execution id on the executor, a
//! session id on the host). When a task ends the pool receives a
//! [`TaskEvent`] carrying its output, so an owner loop can `select!` on
//! [`TaskPool::recv`] next to its network input.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum TaskEvent<T> {
    Finished(u64, T),
    /// The task panicked; the payload is the panic message if it had one.
    Panicked(u64, String),
}

impl<T> TaskEvent<T> {
    pub fn id(&self) -> u64 {
        match self {
            Self::Finished(id, _) | Self::Panicked(id, _) => *id,
        }
    }
}

pub struct TaskPool<T> {
    tasks: HashMap<u64, JoinHandle<()>>,
    pool_rx: mpsc::Receiver<TaskEvent<T>>,
    pool_tx: mpsc::Sender<TaskEvent<T>>,
}

impl<T: Send + 'static> TaskPool<T> {
    pub fn new() -> Self {
        let (pool_tx, pool_rx) = mpsc::channel(1024);
        Self {
            tasks: HashMap::new(),
            pool_rx,
            pool_tx,
        }
    }

    /// Spawn `fut` under `id`. A task already running under the same id is
    /// aborted first.
    pub fn spawn<Fut>(&mut self, id: u64, fut: Fut)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let event_tx = self.pool_tx.clone();
        let handle = tokio::spawn(async move {
            let event = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(output) => TaskEvent::Finished(id, output),
                Err(payload) => TaskEvent::Panicked(id, panic_message(payload)),
            };
            let _ = event_tx.send(event).await;
        });
        if let Some(old) = self.tasks.insert(id, handle) {
            warn!(id, "replacing running task");
            old.abort();
        }
    }

    /// Wait for the next task to end and forget it.
    pub async fn recv(&mut self) -> Option<TaskEvent<T>> {
        let event = self.pool_rx.recv().await?;
        self.tasks.remove(&event.id());
        if let TaskEvent::Panicked(id, msg) = &event {
            warn!(id, panic = %msg, "task panicked");
        }
        Some(event)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn abort_all(&mut self) {
        for (id, handle) in self.tasks.drain() {
            debug!(id, "aborting task");
            handle.abort();
        }
    }
}

impl<T: Send + 'static> Default for TaskPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskPool<T> {
    fn drop(&mut self) {
        for handle in self.tasks.values() {
            handle.abort();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn finished_tasks_report_output() {
        let mut pool = TaskPool::new();
        pool.spawn(7, async { 42u32 });
        match pool.recv().await.unwrap() {
            TaskEvent::Finished(id, out) => assert_eq!((id, out), (7, 42)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let mut pool: TaskPool<()> = TaskPool::new();
        pool.spawn(1, async { panic!("boom") });
        match pool.recv().await.unwrap() {
            TaskEvent::Panicked(1, msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn respawning_an_id_replaces_the_old_task() {
        let mut pool = TaskPool::new();
        pool.spawn(1, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "old"
        });
        pool.spawn(1, async { "new" });
        match pool.recv().await.unwrap() {
            TaskEvent::Finished(1, out) => assert_eq!(out, "new"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn aborted_tasks_stay_silent() {
        let mut pool = TaskPool::new();
        pool.spawn(1, std::future::pending::<()>());
        pool.abort_all();
        assert!(pool.is_empty());
        pool.spawn(2, async {});
        assert_eq!(pool.recv().await.map(|e| e.id()), Some(2));
    }
}
