use std::sync::Arc;

use core_types::CoreError;
use tokio::sync::Semaphore;

/// Bounded pool for blocking core work (drains, file loads, macro runs).
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free worker, then runs `f` on the blocking thread pool.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, CoreError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| CoreError::WorkerUnavailable(err.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|err| CoreError::WorkerUnavailable(format!("worker task failed: {err}")))
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_exceeds_pool_size() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..6)
            .map(|_| {
                let pool = pool.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    pool.run_blocking(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect::<Vec<_>>();
        for job in jobs {
            job.await.expect("join").expect("run");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(matches!(
            pool.run_blocking(|| 1).await,
            Err(CoreError::WorkerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn panicking_job_is_an_error_not_a_crash() {
        let pool = WorkerPool::new(1);
        let res = pool.run_blocking(|| -> u32 { panic!("bad job") }).await;
        assert!(matches!(res, Err(CoreError::WorkerUnavailable(_))));
        assert_eq!(pool.run_blocking(|| 7).await, Ok(7));
    }
}
