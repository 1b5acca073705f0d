use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::PreKeyError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs submitted operations one at a time, in submission order.
///
/// Every pre-key operation goes through a single queue so that two tasks
/// never interleave their generate/upload/persist phases. Must be created
/// inside a tokio runtime.
pub struct OperationQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl OperationQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(rx));
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Enqueue `operation` and wait for its result.
    ///
    /// Fails with [`PreKeyError::ShutDown`] if the queue is closed, or if the
    /// operation never reported back (it panicked).
    pub async fn run<T, F>(&self, operation: F) -> Result<T, PreKeyError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, PreKeyError>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = operation.await;
            // Caller may have stopped waiting
            let _ = reply_tx.send(result);
        });

        {
            let guard = self.tx.lock();
            let Some(tx) = guard.as_ref() else {
                return Err(PreKeyError::ShutDown);
            };
            tx.send(job).map_err(|_| PreKeyError::ShutDown)?;
        }

        reply_rx.await.map_err(|_| PreKeyError::ShutDown)?
    }

    /// Stop accepting operations. Already queued operations still run.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            tracing::debug!("operation queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        if let Err(e) = tokio::spawn(job).await {
            tracing::error!(error = %e, "pre-key operation panicked");
        }
    }
    tracing::debug!("operation queue drained");
}
