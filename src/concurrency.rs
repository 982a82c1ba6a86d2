/// Bounded-parallelism substrate shared by the mutation executor and the
/// strategy manager: operation permits, named scoped lock regions, deadline
/// execution and a fixed worker pool.
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::errors::{ReplayError, Result};
use crate::r#const::{DEFAULT_OPERATION_PERMITS, POOL_CHANNEL_BOUND};

/// Cooperative cancellation signal passed into long-running operations.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The four lock regions callers can scope work to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRegion {
    Abi,
    Strategy,
    Execution,
    Cache,
}

#[derive(Debug)]
struct Regions {
    abi: RwLock<()>,
    strategy: RwLock<()>,
    execution: RwLock<()>,
    cache: RwLock<()>,
}

#[derive(Debug)]
pub struct ConcurrencyManager {
    permits: Mutex<usize>,
    permits_freed: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
    regions: Regions,
    pub total_operations: AtomicU64,
    pub scope_errors: AtomicU64,
}

/// Permit guard, returns the slot on drop.
#[derive(Debug)]
pub struct OperationPermit<'a> {
    manager: &'a ConcurrencyManager,
}

impl Drop for OperationPermit<'_> {
    fn drop(&mut self) {
        let mut available = self.manager.permits.lock().unwrap();
        *available += 1;
        self.manager.permits_freed.notify_one();
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_PERMITS)
    }
}

impl ConcurrencyManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Mutex::new(capacity),
            permits_freed: Condvar::new(),
            capacity,
            shutdown: AtomicBool::new(false),
            regions: Regions {
                abi: RwLock::new(()),
                strategy: RwLock::new(()),
                execution: RwLock::new(()),
                cache: RwLock::new(()),
            },
            total_operations: AtomicU64::new(0),
            scope_errors: AtomicU64::new(0),
        }
    }

    /// Wait for an operation slot. Unblocks early on caller cancellation or
    /// manager shutdown; a missed deadline is a recoverable timeout error.
    pub fn acquire_permit(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<OperationPermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut available = self.permits.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(ReplayError::execution("manager is shut down").recoverable(false));
            }
            if cancel.is_cancelled() {
                return Err(ReplayError::execution("operation cancelled").recoverable(false));
            }
            if *available > 0 {
                *available -= 1;
                self.total_operations.fetch_add(1, Ordering::Relaxed);
                return Ok(OperationPermit { manager: self });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReplayError::timeout("no operation permit within deadline"));
            }
            // wake periodically so cancellation is observed without a waker
            let wait = (deadline - now).min(Duration::from_millis(50));
            let (guard, _) = self.permits_freed.wait_timeout(available, wait).unwrap();
            available = guard;
        }
    }

    fn region(&self, region: LockRegion) -> &RwLock<()> {
        match region {
            LockRegion::Abi => &self.regions.abi,
            LockRegion::Strategy => &self.regions.strategy,
            LockRegion::Execution => &self.regions.execution,
            LockRegion::Cache => &self.regions.cache,
        }
    }

    /// Run `f` under the shared side of a region. The guard is a lexical
    /// scope, so the region unlocks on every exit path including panics.
    pub fn with_read<T>(&self, region: LockRegion, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.region(region).read().unwrap();
        let res = f();
        if res.is_err() {
            self.scope_errors.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    /// Run `f` under the exclusive side of a region.
    pub fn with_write<T>(&self, region: LockRegion, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.region(region).write().unwrap();
        let res = f();
        if res.is_err() {
            self.scope_errors.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    /// Acquire a permit, run `f` on a worker thread and join with a deadline.
    /// A panic inside `f` is reified as an `execution` error; a missed join
    /// deadline is a `timeout` error.
    pub fn execute_with_timeout<T, F>(&self, f: F, timeout: Duration) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let _permit = self.acquire_permit(timeout, &cancel)?;

        let (tx, rx) = bounded::<std::thread::Result<Result<T>>>(1);
        let handle = thread::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(res)) => {
                let _ = handle.join();
                res
            }
            Ok(Err(panic_payload)) => {
                let _ = handle.join();
                Err(ReplayError::execution(format!(
                    "worker panicked: {}",
                    panic_message(&panic_payload)
                ))
                .recoverable(false))
            }
            Err(_) => {
                // the worker keeps running; its result is discarded
                Err(ReplayError::timeout("operation exceeded deadline"))
            }
        }
    }

    /// Refuse new permits and wait for in-flight operations to drain.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.permits_freed.notify_all();
        let deadline = Instant::now() + timeout;
        let mut available = self.permits.lock().unwrap();
        while *available < self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(ReplayError::timeout(format!(
                    "{} operations still in flight at shutdown deadline",
                    self.capacity - *available
                )));
            }
            let (guard, _) = self
                .permits_freed
                .wait_timeout(available, deadline - now)
                .unwrap();
            available = guard;
        }
        debug!("concurrency manager drained");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

pub fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

type PoolTask<T> = (usize, Box<dyn FnOnce() -> T + Send + 'static>);

/// Fixed set of persistent workers over bounded channels. Tasks carry an
/// index so batch results can be written back into a pre-sized buffer.
pub struct WorkerPool<T: Send + 'static> {
    workers: usize,
    task_tx: Option<Sender<PoolTask<T>>>,
    result_rx: Option<Receiver<(usize, T)>>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            task_tx: None,
            result_rx: None,
            handles: vec![],
            cancel: CancelToken::new(),
        }
    }

    /// Spawn the workers. Calling start on a running pool is a no-op.
    pub fn start(&mut self) {
        if self.task_tx.is_some() {
            return;
        }
        let (task_tx, task_rx) = bounded::<PoolTask<T>>(POOL_CHANNEL_BOUND);
        let (result_tx, result_rx) = bounded::<(usize, T)>(POOL_CHANNEL_BOUND);
        self.cancel = CancelToken::new();
        for i in 0..self.workers {
            let rx = task_rx.clone();
            let tx = result_tx.clone();
            let cancel = self.cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("txshield-worker-{}", i))
                .spawn(move || {
                    while let Ok((idx, job)) = rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let result = job();
                        if tx.send((idx, result)).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn worker");
            self.handles.push(handle);
        }
        self.task_tx = Some(task_tx);
        self.result_rx = Some(result_rx);
    }

    pub fn submit(&self, idx: usize, job: impl FnOnce() -> T + Send + 'static) -> Result<()> {
        match &self.task_tx {
            Some(tx) => tx
                .send((idx, Box::new(job)))
                .map_err(|_| ReplayError::execution("worker pool stopped").recoverable(false)),
            None => Err(ReplayError::execution("worker pool not started").recoverable(false)),
        }
    }

    pub fn recv_result(&self, timeout: Duration) -> Result<(usize, T)> {
        match &self.result_rx {
            Some(rx) => rx
                .recv_timeout(timeout)
                .map_err(|_| ReplayError::timeout("no worker result within deadline")),
            None => Err(ReplayError::execution("worker pool not started").recoverable(false)),
        }
    }

    /// Cancel workers and close both channels. Safe to call twice.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.task_tx = None;
        self.result_rx = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker exited via panic");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_tx.is_some()
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_count_is_bounded() {
        let mgr = ConcurrencyManager::new(2);
        let cancel = CancelToken::new();
        let p1 = mgr.acquire_permit(Duration::from_millis(50), &cancel).unwrap();
        let _p2 = mgr.acquire_permit(Duration::from_millis(50), &cancel).unwrap();
        let denied = mgr.acquire_permit(Duration::from_millis(50), &cancel);
        assert!(denied.is_err());
        assert!(denied.unwrap_err().is_retryable());
        drop(p1);
        let _p3 = mgr.acquire_permit(Duration::from_millis(50), &cancel).unwrap();
    }

    #[test]
    fn cancelled_wait_unblocks() {
        let mgr = Arc::new(ConcurrencyManager::new(1));
        let cancel = CancelToken::new();
        let _held = mgr.acquire_permit(Duration::from_millis(10), &cancel).unwrap();
        let cancel2 = cancel.clone();
        cancel2.cancel();
        let res = mgr.acquire_permit(Duration::from_secs(5), &cancel);
        assert!(res.is_err());
    }

    #[test]
    fn panic_becomes_execution_error() {
        let mgr = ConcurrencyManager::new(4);
        let res: Result<u32> =
            mgr.execute_with_timeout(|| panic!("boom"), Duration::from_secs(1));
        let err = res.unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Execution);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn deadline_miss_is_timeout() {
        let mgr = ConcurrencyManager::new(4);
        let res: Result<u32> = mgr.execute_with_timeout(
            || {
                thread::sleep(Duration::from_millis(300));
                Ok(1)
            },
            Duration::from_millis(30),
        );
        assert_eq!(res.unwrap_err().kind, crate::errors::ErrorKind::Timeout);
    }

    #[test]
    fn shutdown_refuses_new_permits() {
        let mgr = ConcurrencyManager::new(2);
        mgr.shutdown(Duration::from_millis(100)).unwrap();
        let cancel = CancelToken::new();
        assert!(mgr.acquire_permit(Duration::from_millis(10), &cancel).is_err());
    }

    #[test]
    fn pool_keeps_result_indices() {
        let mut pool: WorkerPool<usize> = WorkerPool::new(4);
        pool.start();
        pool.start(); // idempotent
        for i in 0..16 {
            pool.submit(i, move || i * 2).unwrap();
        }
        let mut results = vec![0usize; 16];
        for _ in 0..16 {
            let (idx, val) = pool.recv_result(Duration::from_secs(2)).unwrap();
            results[idx] = val;
        }
        for (i, v) in results.iter().enumerate() {
            assert_eq!(*v, i * 2);
        }
        pool.stop();
        pool.stop(); // double stop is fine
        assert!(pool.submit(0, || 0).is_err());
    }

    #[test]
    fn scope_errors_are_counted() {
        let mgr = ConcurrencyManager::new(1);
        let _ = mgr.with_write::<()>(LockRegion::Strategy, || {
            Err(ReplayError::mutation("nothing to record"))
        });
        assert_eq!(mgr.scope_errors.load(Ordering::Relaxed), 1);
        // region must be reusable after the failure
        mgr.with_read(LockRegion::Strategy, || Ok(())).unwrap();
    }
}
