// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Work = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fixed-size pool of workers for arbitrary work. Incoming work is queued
/// in a bounded FIFO channel which the individual workers pull from.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Work>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool with the given worker count and work queue capacity.
    /// Both must be positive.
    #[must_use]
    pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
        assert!(num_workers > 0, "worker count must be positive");
        assert!(queue_capacity > 0, "queue capacity must be positive");

        let (tx, rx) = mpsc::channel::<Work>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..num_workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let work = {
                            let mut rx = rx.lock().await;
                            match rx.recv().await {
                                Some(work) => work,
                                None => break,
                            }
                        };
                        work.await;
                    }
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue work for asynchronous execution. Strictly non-blocking: returns
    /// `false` when the queue is full (or the pool is closed) and the work is
    /// dropped; otherwise the work runs exactly once. Admission is FIFO but
    /// completion order across workers is not.
    pub fn try_submit<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.try_send(Box::pin(work)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work and wait until everything already queued has
    /// finished.
    pub async fn close(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn accepts_exactly_queue_capacity_while_workers_are_busy() {
        let pool = WorkerPool::new(1, 2);

        // Park the lone worker so queued work cannot drain.
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(pool.try_submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        }));
        started_rx.await.expect("worker started");

        assert!(pool.try_submit(async {}));
        assert!(pool.try_submit(async {}));
        assert!(!pool.try_submit(async {}), "queue should be full");

        release_tx.send(()).expect("release worker");
        pool.close().await;
    }

    #[tokio::test]
    async fn a_completed_item_frees_a_slot() {
        let pool = WorkerPool::new(1, 1);

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(pool.try_submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        }));
        started_rx.await.expect("worker started");

        assert!(pool.try_submit(async {}));
        assert!(!pool.try_submit(async {}));

        release_tx.send(()).expect("release worker");
        pool.close().await;

        // Closed pools reject new work outright.
        assert!(!pool.try_submit(async {}));
    }

    #[tokio::test]
    async fn close_drains_all_queued_work() {
        let pool = WorkerPool::new(4, 64);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let done = Arc::clone(&done);
            assert!(pool.try_submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 32);
    }
}
