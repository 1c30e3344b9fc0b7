//! Bounded worker pool for off-loop message dispatch.
//!
//! When a session has a task pool bound, decoded packets are handed to the
//! pool instead of being processed inline on the read loop. The pool is a
//! fixed set of workers pulling from one bounded queue, so slow `on_message`
//! handlers exert backpressure on dispatch instead of spawning unboundedly.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

type Task = BoxFuture<'static, ()>;

/// A fixed-size pool of workers sharing one bounded task queue
pub struct TaskPool {
    tx: mpsc::Sender<Task>,
}

impl TaskPool {
    /// Start `workers` worker tasks behind a queue of `depth` pending tasks
    pub fn new(workers: usize, depth: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Task>(depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next task
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => task.await,
                        None => break,
                    }
                }
                debug!(worker, "task pool worker stopped");
            });
        }

        Arc::new(Self { tx })
    }

    /// Queue a task for the workers, waiting for queue space if needed. If
    /// the pool has shut down the task runs inline instead of being lost.
    pub async fn dispatch(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let task: Task = Box::pin(fut);
        if let Err(err) = self.tx.send(task).await {
            err.0.await;
        }
    }
}
