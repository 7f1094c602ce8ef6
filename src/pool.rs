//! # Worker Pool
//!
//! Runs non-blocking driver bodies and inbound request handlers off the
//! dispatcher. Jobs are boxed futures pushed onto an mpsc queue and drained by
//! a set of worker tasks that grows on demand between `min_workers` and
//! `max_workers`. Workers above the minimum retire after sitting idle for
//! `idle_keepalive`.
//!
//! Each job runs in its own task, owned by the worker through an abort-on-drop
//! handle: a panicking job cannot take its worker down, and aborting a worker
//! on shutdown cancels the job it is running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Default lower bound on live workers.
pub const DEFAULT_MIN_WORKERS: usize = 4;

/// Default upper bound on live workers.
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// Default idle time after which surplus workers retire.
pub const DEFAULT_IDLE_KEEPALIVE: Duration = Duration::from_secs(30);

/// Returned by [`WorkerPool::submit`] once the pool has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClosed;

impl std::fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker pool is shut down")
    }
}

impl std::error::Error for PoolClosed {}

struct Shared {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    min_workers: usize,
    max_workers: usize,
    idle_keepalive: Duration,
    workers: AtomicUsize,
    idle: AtomicUsize,
    queued: AtomicUsize,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create the pool and start `min_workers` workers. Must be called from
    /// within a tokio runtime.
    pub fn new(min_workers: usize, max_workers: usize, idle_keepalive: Duration) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        let min_workers = min_workers.min(max_workers);
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            tx,
            shared: Arc::new(Shared {
                rx: tokio::sync::Mutex::new(rx),
                min_workers,
                max_workers,
                idle_keepalive,
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        for _ in 0..min_workers {
            pool.grow();
        }
        debug!(min_workers, max_workers, "worker pool started");
        pool
    }

    /// Queue a job. Spawns an extra worker when none is idle and the pool is
    /// below its maximum.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolClosed);
        }
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Box::pin(job)).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolClosed);
        }
        if self.shared.idle.load(Ordering::Acquire) == 0 {
            self.grow();
        }
        Ok(())
    }

    fn grow(&self) {
        let shared = &self.shared;
        let mut current = shared.workers.load(Ordering::Acquire);
        loop {
            if current >= shared.max_workers {
                return;
            }
            match shared.workers.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let handle = tokio::spawn(worker_loop(shared.clone()));
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
        trace!(workers = current + 1, "worker spawned");
    }

    /// Abort every worker (and the job each one is running) and drop queued jobs.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        self.shared.workers.store(0, Ordering::Release);
        // An aborted worker may still hold the receiver until it is polled.
        match self.shared.rx.try_lock() {
            Ok(mut rx) => drain(&self.shared, &mut rx),
            Err(_) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let shared = self.shared.clone();
                    runtime.spawn(async move {
                        let mut rx = shared.rx.lock().await;
                        drain(&shared, &mut rx);
                    });
                }
            }
        }
        debug!("worker pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(shared: &Shared, rx: &mut mpsc::UnboundedReceiver<Job>) {
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    shared.queued.store(0, Ordering::Release);
    if dropped > 0 {
        debug!(dropped, "dropped queued jobs on shutdown");
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        shared.idle.fetch_add(1, Ordering::AcqRel);
        let next = {
            let mut rx = shared.rx.lock().await;
            tokio::time::timeout(shared.idle_keepalive, rx.recv()).await
        };
        shared.idle.fetch_sub(1, Ordering::AcqRel);

        match next {
            Ok(Some(job)) => {
                shared.queued.fetch_sub(1, Ordering::AcqRel);
                let mut running = AbortOnDrop(tokio::spawn(job));
                if let Err(e) = (&mut running.0).await
                    && e.is_panic()
                {
                    warn!("worker job panicked");
                }
            }
            Ok(None) => break,
            Err(_) => {
                if retire(&shared) {
                    trace!("idle worker retired");
                    break;
                }
            }
        }
    }
}

fn retire(shared: &Shared) -> bool {
    let mut current = shared.workers.load(Ordering::Acquire);
    while current > shared.min_workers {
        match shared.workers.compare_exchange(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn submitted_jobs_run() {
        let pool = WorkerPool::new(2, 4, DEFAULT_IDLE_KEEPALIVE);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..10 {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
            .unwrap();
        }
        for _ in 0..10 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn pool_grows_up_to_maximum() {
        let pool = WorkerPool::new(1, 3, DEFAULT_IDLE_KEEPALIVE);
        let mut blockers = Vec::new();
        for _ in 0..6 {
            let (tx, rx) = oneshot::channel::<()>();
            blockers.push(tx);
            pool.submit(async move {
                let _ = rx.await;
            })
            .unwrap();
            tokio::task::yield_now().await;
        }
        assert!(pool.workers() <= 3);
        assert!(pool.workers() >= 1);
        drop(blockers);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 1, DEFAULT_IDLE_KEEPALIVE);
        pool.submit(async { panic!("boom") }).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(7u32);
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn shutdown_rejects_and_cancels() {
        let pool = WorkerPool::new(1, 1, DEFAULT_IDLE_KEEPALIVE);
        let (tx, rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _hold = tx;
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
        })
        .unwrap();
        started_rx.await.unwrap();

        pool.shutdown();
        assert!(pool.is_closed());
        assert_eq!(pool.submit(async {}), Err(PoolClosed));
        // The running job was cancelled, dropping its sender.
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn surplus_workers_retire_when_idle() {
        let pool = WorkerPool::new(1, 4, Duration::from_secs(5));
        let mut blockers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel::<()>();
            blockers.push(tx);
            pool.submit(async move {
                let _ = rx.await;
            })
            .unwrap();
            tokio::task::yield_now().await;
        }
        drop(blockers);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(pool.workers(), 1);
    }
}
