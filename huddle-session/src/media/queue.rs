//! Single-worker FIFO executor
//!
//! Items are processed strictly one at a time in push order. A failing item is
//! logged and the worker moves on to the next one.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

enum Job<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
}

/// Cloneable producer side of a [`SerialQueue`]
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<Job<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    pub fn push(&self, item: T) -> Result<()> {
        self.tx
            .send(Job::Item(item))
            .map_err(|_| Error::SessionClosed)
    }
}

pub struct SerialQueue<T> {
    name: &'static str,
    sender: QueueSender<T>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Debug + Send + 'static> SerialQueue<T> {
    /// Spawn the worker. It stops when `cancel` fires or the queue is closed.
    pub fn spawn<F, Fut>(name: &'static str, cancel: CancellationToken, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<T>>();
        let token = cancel.clone();

        let worker = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    () = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                match job {
                    Job::Item(item) => {
                        let description = format!("{item:?}");
                        let outcome = tokio::select! {
                            () = token.cancelled() => break,
                            outcome = handler(item) => outcome,
                        };
                        if let Err(e) = outcome {
                            warn!(queue = name, item = %description, error = %e, "Queued item failed");
                        }
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(queue = name, "Serial queue worker stopped");
        });

        Self {
            name,
            sender: QueueSender { tx },
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    #[must_use]
    pub fn sender(&self) -> QueueSender<T> {
        self.sender.clone()
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.sender.push(item)
    }

    /// Wait until everything pushed before this call has been processed
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.sender
            .tx
            .send(Job::Flush(done_tx))
            .map_err(|_| Error::SessionClosed)?;
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            done = done_rx => done.map_err(|_| Error::SessionClosed),
        }
    }

    /// Stop the worker, abandoning anything still queued
    pub async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(queue = self.name, error = %e, "Serial queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_items_run_in_order_one_at_a_time() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let queue = {
            let log = Arc::clone(&log);
            let active = Arc::clone(&active);
            SerialQueue::spawn("test", CancellationToken::new(), move |n: u32| {
                let log = Arc::clone(&log);
                let active = Arc::clone(&active);
                async move {
                    let concurrent = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(concurrent, 0);
                    // later items finish faster; order must still hold
                    tokio::time::sleep(Duration::from_millis(u64::from(10 - n))).await;
                    log.lock().push(n);
                    active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        for n in 0..5 {
            queue.push(n).unwrap();
        }
        queue.flush().await.unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        queue.close().await;
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_items() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let log = Arc::clone(&log);
            SerialQueue::spawn("test", CancellationToken::new(), move |n: u32| {
                let log = Arc::clone(&log);
                async move {
                    if n == 1 {
                        return Err(Error::Negotiation("boom".to_string()));
                    }
                    log.lock().push(n);
                    Ok(())
                }
            })
        };

        for n in 0..3 {
            queue.push(n).unwrap();
        }
        queue.flush().await.unwrap();
        assert_eq!(*log.lock(), vec![0, 2]);
        queue.close().await;
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let queue = SerialQueue::spawn("test", CancellationToken::new(), |_: u32| async { Ok(()) });
        queue.close().await;
        assert!(matches!(queue.push(1), Err(Error::SessionClosed)));
        assert!(queue.flush().await.is_err());
    }
}
