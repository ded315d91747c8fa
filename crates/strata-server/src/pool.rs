//! Dedicated cache worker threads.
//!
//! Each thread owns one [`CacheWorker`] for its whole life, so the local
//! handle tables are never shared. Async handlers submit closures over a
//! per-thread channel and await the result on a oneshot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use strata_core::{CacheError, CacheWorker, ResponseCache};
use tokio::sync::{mpsc, oneshot};

use crate::error::AppError;

type Job = Box<dyn FnOnce(&mut CacheWorker) + Send>;

pub struct WorkerPool {
    cache: ResponseCache,
    senders: RwLock<Vec<mpsc::UnboundedSender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(cache: ResponseCache, size: usize) -> Result<Self, CacheError> {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for index in 0..size {
            let mut worker = cache.worker()?;
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let handle = thread::Builder::new()
                .name(format!("strata-cache-{index}"))
                .spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        // A panicking job drops its reply; the thread keeps serving.
                        if panic::catch_unwind(AssertUnwindSafe(|| job(&mut worker))).is_err() {
                            tracing::error!(worker = index, "cache job panicked");
                        }
                    }
                    worker.shutdown();
                    tracing::debug!(worker = index, "cache worker stopped");
                })?;
            senders.push(tx);
            threads.push(handle);
        }

        tracing::info!(workers = size, "cache worker pool started");
        Ok(Self {
            cache,
            senders: RwLock::new(senders),
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn size(&self) -> usize {
        self.senders.read().len()
    }

    /// Run `job` on the next worker (round robin) and await its result.
    pub async fn run<R, F>(&self, job: F) -> Result<R, AppError>
    where
        R: Send + 'static,
        F: FnOnce(&mut CacheWorker) -> R + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        {
            let senders = self.senders.read();
            if senders.is_empty() {
                return Err(AppError::PoolClosed);
            }
            let index = self.next.fetch_add(1, Ordering::Relaxed) % senders.len();
            let task: Job = Box::new(move |worker| {
                let _ = reply.send(job(worker));
            });
            senders[index].send(task).map_err(|_| AppError::PoolClosed)?;
        }
        result.await.map_err(|_| {
            if self.senders.read().is_empty() {
                AppError::PoolClosed
            } else {
                AppError::JobPanicked
            }
        })
    }

    /// Close every channel and wait for the threads to drain their queue and
    /// release their local tables. Idempotent.
    pub fn shutdown(&self) {
        drop(std::mem::take(&mut *self.senders.write()));
        let threads = std::mem::take(&mut *self.threads.lock());
        let count = threads.len();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("cache worker thread panicked");
            }
        }
        if count > 0 {
            tracing::info!(workers = count, "cache worker pool stopped");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strata_core::CacheSettings;

    fn cache(dir: &std::path::Path) -> ResponseCache {
        ResponseCache::new(CacheSettings {
            directory: dir.to_path_buf(),
            local_capacity: 16,
            ..CacheSettings::default()
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_jobs_are_spread_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(cache(dir.path()), 3).unwrap();

        let mut names = HashSet::new();
        for _ in 0..6 {
            let name = pool
                .run(|_| thread::current().name().map(str::to_owned))
                .await
                .unwrap();
            names.insert(name.unwrap());
        }
        assert_eq!(names.len(), 3);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_survives_panicking_job() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(cache(dir.path()), 1).unwrap();

        let failed = pool.run(|_| -> () { panic!("job blew up") }).await;
        assert!(matches!(failed, Err(AppError::JobPanicked)));

        let answer = pool.run(|worker| worker.local_len()).await.unwrap();
        assert_eq!(answer, 0);
        assert_eq!(pool.size(), 1);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(cache(dir.path()), 1).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(matches!(pool.run(|_| ()).await, Err(AppError::PoolClosed)));
        assert_eq!(pool.size(), 0);
    }
}
