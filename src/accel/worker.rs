//! Background disk-cache worker
//!
//! A dedicated tokio runtime consumes a bounded task channel. Tasks are
//! blocking closures (file I/O and buffer maps) run one after another on the
//! blocking pool. `flush` sends a marker through the same channel and waits
//! for the worker to acknowledge it, so every task queued before the flush
//! has finished when it returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

use crate::core::Result;

/// Unit of background work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task(Task),
    Flush(oneshot::Sender<()>),
}

pub struct CacheWorker {
    tx: Option<mpsc::Sender<WorkerMessage>>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
    /// Owned runtime; shut down on drop
    runtime: Option<Runtime>,
}

impl CacheWorker {
    /// Start the worker with a queue of `capacity` tasks
    pub fn new(capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerMessage>(capacity.max(1));
        let completed = Arc::new(AtomicU64::new(0));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("gpusnap-cache")
            .enable_all()
            .build()?;

        let completed_clone = Arc::clone(&completed);
        runtime.spawn(async move {
            Self::worker_loop(rx, completed_clone).await;
        });

        Ok(Self {
            tx: Some(tx),
            submitted: AtomicU64::new(0),
            completed,
            runtime: Some(runtime),
        })
    }

    async fn worker_loop(mut rx: mpsc::Receiver<WorkerMessage>, completed: Arc<AtomicU64>) {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Task(task) => {
                    if let Err(e) = tokio::task::spawn_blocking(task).await {
                        log::error!("Disk cache task panicked: {}", e);
                    }
                    completed.fetch_add(1, Ordering::AcqRel);
                }
                WorkerMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        log::debug!("Disk cache worker stopped");
    }

    /// Queue a task, waiting for room if the queue is full
    ///
    /// Returns false if the worker has stopped.
    pub fn submit(&self, task: Task) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.blocking_send(WorkerMessage::Task(task)).is_err() {
            log::warn!("Disk cache worker is gone, dropping task");
            return false;
        }
        self.submitted.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Queue a task without waiting
    ///
    /// Returns false, dropping the task, if the queue is full or the worker
    /// has stopped.
    pub fn try_submit(&self, task: Task) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(WorkerMessage::Task(task)) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Disk cache worker is gone, dropping task");
                false
            }
        }
    }

    /// Wait until every task queued so far has run
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.blocking_send(WorkerMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.blocking_recv();
        }
    }

    /// Tasks queued but not yet finished
    pub fn pending(&self) -> u64 {
        self.submitted
            .load(Ordering::Acquire)
            .saturating_sub(self.completed.load(Ordering::Acquire))
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        self.flush();
        // closing the channel ends the worker loop
        self.tx.take();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_flush_waits_for_queued_tasks() {
        let worker = CacheWorker::new(2).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            assert!(worker.submit(Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(2));
                log.lock().unwrap().push(i);
            })));
        }
        worker.flush();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn test_try_submit_refuses_when_full() {
        let worker = CacheWorker::new(1).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        assert!(worker.try_submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })));
        // the worker holds the first task, so the queue has one free slot
        started_rx.recv().unwrap();
        assert!(worker.try_submit(Box::new(|| {})));

        let start = std::time::Instant::now();
        assert!(!worker.try_submit(Box::new(|| {})));
        assert!(start.elapsed() < std::time::Duration::from_millis(50));

        release_tx.send(()).unwrap();
        worker.flush();
        assert_eq!(worker.pending(), 0);
        assert!(worker.try_submit(Box::new(|| {})));
        worker.flush();
    }

    #[test]
    fn test_panicking_task_does_not_stop_worker() {
        let worker = CacheWorker::new(4).unwrap();
        worker.submit(Box::new(|| panic!("task failure")));
        let ran = Arc::new(AtomicU64::new(0));
        let ran_clone = Arc::clone(&ran);
        worker.submit(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        worker.flush();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
