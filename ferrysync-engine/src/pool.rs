//! Adaptive worker pool.
//!
//! A fixed set of named OS threads pulls jobs from a bounded [`WorkQueue`].
//! On top of a plain thread pool it adds:
//!
//! - backpressure: [`WorkerPool::blocking_submit`] parks the caller while the
//!   queue is full instead of buffering without bound
//! - live resizing: growing spawns threads at once; shrinking hands out kill
//!   permits that workers honour between jobs, requeueing the job they just
//!   dequeued at the front
//! - pause/resume between jobs, never mid-job
//! - shutdown when idle, checked after every completion
//!
//! A job's error or panic is delivered through its [`TaskHandle`] only and
//! never takes down a worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::queue::{PushError, WorkQueue};

pub const DEFAULT_THREADS: usize = 8;
/// Queue slots per thread when no explicit queue size is configured.
pub const QUEUE_SLOTS_PER_THREAD: usize = 20;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("work queue is full")]
    QueueFull,
    #[error("pool is shut down")]
    Shutdown,
    #[error("invalid pool size: {0}")]
    InvalidCapacity(usize),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was cancelled before it ran")]
    Cancelled,
}

/// Receiving end of one task's private result channel.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run.
    pub fn wait(self) -> Result<T, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub threads: usize,
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(threads: usize) -> Self {
        Self { threads, queue_capacity: threads.saturating_mul(QUEUE_SLOTS_PER_THREAD) }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_THREADS)
    }
}

struct Control {
    live_workers: usize,
    kill_permits: usize,
    paused: bool,
    shutdown: bool,
    /// Set by `shutdown_now`: remaining jobs are discarded, not run.
    halted: bool,
    shutdown_when_idle: bool,
    workers: Vec<JoinHandle<()>>,
}

enum Admission {
    Run(Job),
    Retire,
    Discard(Job),
}

struct PoolInner {
    name: String,
    queue: WorkQueue<Job>,
    control: Mutex<Control>,
    resumed: Condvar,
    capacity: AtomicUsize,
    active: AtomicUsize,
    unfinished: AtomicUsize,
    thread_seq: AtomicUsize,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(self: &Arc<Self>, ctl: &mut Control) -> Result<(), PoolError> {
        let seq = self.thread_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-t-{}", self.name, seq))
            .spawn(move || inner.run_worker(seq))?;
        ctl.workers.retain(|h| !h.is_finished());
        ctl.workers.push(handle);
        ctl.live_workers += 1;
        Ok(())
    }

    fn run_worker(self: Arc<Self>, seq: usize) {
        debug!(pool = %self.name, worker = seq, "Worker started");
        while let Some(job) = self.queue.take() {
            match self.admit(job) {
                Admission::Run(job) => self.execute(job),
                Admission::Retire => {
                    debug!(pool = %self.name, worker = seq, "Worker retired to shrink pool");
                    return;
                }
                Admission::Discard(job) => {
                    drop(job);
                    self.unfinished.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        self.lock().live_workers -= 1;
        debug!(pool = %self.name, worker = seq, "Worker exiting, queue closed");
    }

    /// Gate between dequeuing a job and running it: honours kill permits,
    /// the pause flag and `shutdown_now`.
    fn admit(&self, job: Job) -> Admission {
        let mut ctl = self.lock();
        loop {
            if ctl.halted {
                return Admission::Discard(job);
            }
            if ctl.kill_permits > 0 && !ctl.shutdown {
                ctl.kill_permits -= 1;
                ctl.live_workers -= 1;
                // Requeue under the control lock so a concurrent shutdown
                // either sees this job in the queue or never sees the retire.
                self.queue.push_front(job);
                return Admission::Retire;
            }
            if !ctl.paused {
                self.active.fetch_add(1, Ordering::SeqCst);
                return Admission::Run(job);
            }
            debug!(pool = %self.name, "Worker paused");
            ctl = self.resumed.wait(ctl).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn execute(&self, job: Job) {
        job();
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.unfinished.fetch_sub(1, Ordering::SeqCst);
        self.check_idle();
    }

    /// All three conditions are read under the control lock; a job that has
    /// been dequeued but not yet admitted still counts as unfinished.
    fn check_idle(&self) {
        let mut ctl = self.lock();
        if ctl.shutdown_when_idle
            && !ctl.shutdown
            && self.active.load(Ordering::SeqCst) == 0
            && self.unfinished.load(Ordering::SeqCst) == 0
            && self.queue.is_empty()
        {
            info!(pool = %self.name, "Pool is idle and shutdown-when-idle is set; shutting down");
            self.begin_shutdown(&mut ctl);
        }
    }

    fn begin_shutdown(&self, ctl: &mut Control) {
        ctl.shutdown = true;
        ctl.paused = false;
        self.queue.close();
        self.resumed.notify_all();
    }
}

/// Handle to an adaptive worker pool. Clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self, PoolError> {
        if config.threads == 0 {
            return Err(PoolError::InvalidCapacity(config.threads));
        }
        if config.queue_capacity == 0 {
            return Err(PoolError::InvalidCapacity(config.queue_capacity));
        }
        let inner = Arc::new(PoolInner {
            name: name.into(),
            queue: WorkQueue::new(config.queue_capacity),
            control: Mutex::new(Control {
                live_workers: 0,
                kill_permits: 0,
                paused: false,
                shutdown: false,
                halted: false,
                shutdown_when_idle: false,
                workers: Vec::with_capacity(config.threads),
            }),
            resumed: Condvar::new(),
            capacity: AtomicUsize::new(config.threads),
            active: AtomicUsize::new(0),
            unfinished: AtomicUsize::new(0),
            thread_seq: AtomicUsize::new(0),
        });
        {
            let mut ctl = inner.lock();
            for _ in 0..config.threads {
                inner.spawn_worker(&mut ctl)?;
            }
        }
        debug!(
            pool = %inner.name,
            threads = config.threads,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue without waiting. Fails with [`PoolError::QueueFull`] when the
    /// queue is saturated.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = wrap_task(task);
        self.inner.unfinished.fetch_add(1, Ordering::SeqCst);
        match self.inner.queue.try_push_back(job) {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.inner.unfinished.fetch_sub(1, Ordering::SeqCst);
                Err(match e {
                    PushError::Full(_) => PoolError::QueueFull,
                    PushError::Closed(_) => PoolError::Shutdown,
                })
            }
        }
    }

    /// Enqueue, blocking the caller until space exists. Fails only with
    /// [`PoolError::Shutdown`].
    pub fn blocking_submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = wrap_task(task);
        self.inner.unfinished.fetch_add(1, Ordering::SeqCst);
        match self.inner.queue.push_back_blocking(job) {
            Ok(()) => Ok(handle),
            Err(_) => {
                self.inner.unfinished.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Shutdown)
            }
        }
    }

    /// Change the target thread count. Growth takes effect immediately;
    /// surplus workers retire before their next job.
    pub fn resize(&self, new_capacity: usize) -> Result<(), PoolError> {
        if new_capacity == 0 {
            return Err(PoolError::InvalidCapacity(new_capacity));
        }
        let mut ctl = self.inner.lock();
        if ctl.shutdown {
            return Err(PoolError::Shutdown);
        }
        let previous = self.inner.capacity.swap(new_capacity, Ordering::SeqCst);
        // A new resize negates whatever the last one left outstanding.
        ctl.kill_permits = 0;
        if ctl.live_workers > new_capacity {
            ctl.kill_permits = ctl.live_workers - new_capacity;
        } else {
            while ctl.live_workers < new_capacity {
                self.inner.spawn_worker(&mut ctl)?;
            }
        }
        info!(
            pool = %self.inner.name,
            from = previous,
            to = new_capacity,
            kill_permits = ctl.kill_permits,
            "Pool resized"
        );
        Ok(())
    }

    /// Stop starting new jobs. Returns `true` if the pool was running.
    pub fn pause(&self) -> Result<bool, PoolError> {
        let mut ctl = self.inner.lock();
        if ctl.shutdown {
            return Err(PoolError::Shutdown);
        }
        let changed = !ctl.paused;
        ctl.paused = true;
        if changed {
            info!(pool = %self.inner.name, "Pool paused");
        }
        Ok(changed)
    }

    /// Let paused workers continue. Returns `true` if the pool was paused.
    pub fn resume(&self) -> Result<bool, PoolError> {
        let mut ctl = self.inner.lock();
        if ctl.shutdown {
            return Err(PoolError::Shutdown);
        }
        let changed = ctl.paused;
        ctl.paused = false;
        self.inner.resumed.notify_all();
        if changed {
            info!(pool = %self.inner.name, "Pool resumed");
        }
        Ok(changed)
    }

    /// When set, the pool shuts itself down the next time it is idle: no
    /// active jobs, no unfinished jobs and an empty queue. Only arm this once
    /// every task has been submitted.
    pub fn set_shutdown_when_idle(&self, enabled: bool) {
        self.inner.lock().shutdown_when_idle = enabled;
        if enabled {
            self.inner.check_idle();
        }
    }

    /// Stop accepting work; queued jobs still run.
    pub fn shutdown(&self) {
        let mut ctl = self.inner.lock();
        if !ctl.shutdown {
            info!(pool = %self.inner.name, "Pool shutting down");
            self.inner.begin_shutdown(&mut ctl);
        }
    }

    /// Stop accepting work and discard queued jobs. Their handles report
    /// [`TaskError::Cancelled`]. Running jobs finish normally.
    pub fn shutdown_now(&self) -> usize {
        let mut ctl = self.inner.lock();
        ctl.halted = true;
        self.inner.begin_shutdown(&mut ctl);
        let discarded = self.inner.queue.drain();
        drop(ctl);
        let count = discarded.len();
        self.inner.unfinished.fetch_sub(count, Ordering::SeqCst);
        drop(discarded);
        if count > 0 {
            warn!(pool = %self.inner.name, discarded = count, "Pool halted; queued tasks discarded");
        }
        count
    }

    /// Join every worker thread. Returns once the pool has shut down and the
    /// queue has drained.
    pub fn await_termination(&self) {
        let workers = std::mem::take(&mut self.inner.lock().workers);
        for worker in workers {
            if worker.join().is_err() {
                warn!(pool = %self.inner.name, "Worker thread panicked");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    /// Jobs currently executing.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Jobs accepted but not yet finished (queued, held, or running).
    pub fn unfinished_count(&self) -> usize {
        self.inner.unfinished.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn live_workers(&self) -> usize {
        self.inner.lock().live_workers
    }
}

fn wrap_task<F, T>(task: F) -> (Job, TaskHandle<T>)
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let job: Job = Box::new(move || {
        let result = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TaskError::Failed(e)),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };
        // The submitter may have dropped its handle.
        let _ = tx.send(result);
    });
    (job, TaskHandle { rx })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Tracks how many tasks run at once and how often each id executed.
    #[derive(Default)]
    struct Tracker {
        running: AtomicUsize,
        peak: AtomicUsize,
        runs: Mutex<HashMap<usize, usize>>,
    }

    impl Tracker {
        fn run(&self, id: usize, hold: Duration) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(hold);
            *self.runs.lock().unwrap().entry(id).or_default() += 1;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        let pool = WorkerPool::new("once", PoolConfig::new(4).with_queue_capacity(8)).unwrap();
        let tracker = Arc::new(Tracker::default());

        let handles: Vec<_> = (0..200)
            .map(|id| {
                let tracker = tracker.clone();
                pool.blocking_submit(move || {
                    tracker.run(id, Duration::from_micros(200));
                    Ok(id)
                })
                .unwrap()
            })
            .collect();

        for (id, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), id);
        }
        let runs = tracker.runs.lock().unwrap();
        assert_eq!(runs.len(), 200);
        assert!(runs.values().all(|&n| n == 1));
        assert!(tracker.peak.load(Ordering::SeqCst) <= 4);

        pool.shutdown();
        pool.await_termination();
        assert_eq!(pool.unfinished_count(), 0);
    }

    #[test]
    fn test_submit_reports_queue_full() {
        let pool = WorkerPool::new("full", PoolConfig::new(1).with_queue_capacity(1)).unwrap();
        let gate = Arc::new(Barrier::new(2));

        let blocker = {
            let gate = gate.clone();
            pool.submit(move || {
                gate.wait();
                Ok(())
            })
            .unwrap()
        };
        assert!(wait_until(Duration::from_secs(5), || pool.active_count() == 1));

        let queued = pool.submit(|| Ok(())).unwrap();
        assert!(matches!(pool.submit(|| Ok(())), Err(PoolError::QueueFull)));
        assert_eq!(pool.unfinished_count(), 2);

        gate.wait();
        blocker.wait().unwrap();
        queued.wait().unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(|| Ok(())), Err(PoolError::Shutdown)));
        assert!(matches!(pool.blocking_submit(|| Ok(())), Err(PoolError::Shutdown)));
    }

    #[test]
    fn test_blocking_submit_waits_then_fails_on_shutdown() {
        let pool = WorkerPool::new("bp", PoolConfig::new(1).with_queue_capacity(1)).unwrap();
        let release = Arc::new(AtomicBool::new(false));

        let spin = |release: Arc<AtomicBool>| {
            move || -> anyhow::Result<()> {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
        };
        let _running = pool.submit(spin(release.clone())).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.active_count() == 1));
        let _queued = pool.submit(spin(release.clone())).unwrap();

        let submitter = {
            let pool = pool.clone();
            thread::spawn(move || pool.blocking_submit(|| Ok(())).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished());

        pool.shutdown();
        assert!(matches!(submitter.join().unwrap(), Err(PoolError::Shutdown)));
        release.store(true, Ordering::SeqCst);
        pool.await_termination();
    }

    #[test]
    fn test_failures_and_panics_stay_in_their_handles() {
        let pool = WorkerPool::new("fail", PoolConfig::new(1)).unwrap();
        let failed = pool.submit(|| -> anyhow::Result<()> { anyhow::bail!("boom") }).unwrap();
        let panicked = pool.submit(|| -> anyhow::Result<()> { panic!("kaboom") }).unwrap();
        let fine = pool.submit(|| Ok(7)).unwrap();

        match failed.wait() {
            Err(TaskError::Failed(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        match panicked.wait() {
            Err(TaskError::Panicked(msg)) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected: {other:?}"),
        }
        // the single worker survived both
        assert_eq!(fine.wait().unwrap(), 7);
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown();
        pool.await_termination();
    }

    #[test]
    fn test_shrink_retires_workers_and_requeues_at_front() {
        let pool = WorkerPool::new("shrink", PoolConfig::new(4).with_queue_capacity(100)).unwrap();
        let tracker = Arc::new(Tracker::default());

        let handles: Vec<_> = (0..40)
            .map(|id| {
                let tracker = tracker.clone();
                pool.submit(move || {
                    tracker.run(id, Duration::from_millis(20));
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        assert!(wait_until(Duration::from_secs(5), || pool.active_count() == 4));

        pool.resize(2).unwrap();
        assert_eq!(pool.capacity(), 2);
        assert!(wait_until(Duration::from_secs(10), || pool.live_workers() == 2));

        // once the retirements have happened no more than two jobs overlap
        tracker.peak.store(0, Ordering::SeqCst);
        for handle in handles {
            handle.wait().unwrap();
        }
        assert!(tracker.peak.load(Ordering::SeqCst) <= 2);

        let runs = tracker.runs.lock().unwrap();
        assert_eq!(runs.len(), 40);
        assert!(runs.values().all(|&n| n == 1));
        drop(runs);

        pool.shutdown();
        pool.await_termination();
    }

    #[test]
    fn test_grow_spawns_threads_immediately() {
        let pool = WorkerPool::new("grow", PoolConfig::new(1).with_queue_capacity(16)).unwrap();
        let barrier = Arc::new(Barrier::new(4));
        pool.resize(3).unwrap();
        assert_eq!(pool.live_workers(), 3);

        // three tasks can only pass the barrier together if three threads run them
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                pool.submit(move || {
                    barrier.wait();
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        barrier.wait();
        for h in handles {
            h.wait().unwrap();
        }
        assert!(matches!(pool.resize(0), Err(PoolError::InvalidCapacity(0))));
        pool.shutdown();
        assert!(matches!(pool.resize(2), Err(PoolError::Shutdown)));
        pool.await_termination();
    }

    #[test]
    fn test_pause_blocks_new_starts_until_resume() {
        let pool = WorkerPool::new("pause", PoolConfig::new(2).with_queue_capacity(32)).unwrap();
        let started = Arc::new(AtomicUsize::new(0));

        assert!(pool.pause().unwrap());
        assert!(!pool.pause().unwrap());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let started = started.clone();
                pool.submit(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.unfinished_count(), 10);

        assert!(pool.resume().unwrap());
        assert!(!pool.resume().unwrap());
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(started.load(Ordering::SeqCst), 10);

        pool.shutdown();
        assert!(matches!(pool.pause(), Err(PoolError::Shutdown)));
        assert!(matches!(pool.resume(), Err(PoolError::Shutdown)));
        pool.await_termination();
    }

    #[test]
    fn test_shutdown_when_idle() {
        let pool = WorkerPool::new("idle", PoolConfig::new(3)).unwrap();
        let handles: Vec<_> = (0..20)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(2));
                    Ok(i)
                })
                .unwrap()
            })
            .collect();
        pool.set_shutdown_when_idle(true);
        for h in handles {
            h.wait().unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || pool.is_shutdown()));
        pool.await_termination();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.unfinished_count(), 0);
    }

    #[test]
    fn test_arming_idle_shutdown_on_idle_pool() {
        let pool = WorkerPool::new("idle-now", PoolConfig::new(1)).unwrap();
        pool.submit(|| Ok(())).unwrap().wait().unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.unfinished_count() == 0));
        pool.set_shutdown_when_idle(true);
        assert!(pool.is_shutdown());
        pool.await_termination();
    }

    #[test]
    fn test_shutdown_now_cancels_queued() {
        let pool = WorkerPool::new("halt", PoolConfig::new(1).with_queue_capacity(8)).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let running = {
            let gate = gate.clone();
            pool.submit(move || {
                gate.wait();
                Ok(())
            })
            .unwrap()
        };
        assert!(wait_until(Duration::from_secs(5), || pool.active_count() == 1));
        let queued: Vec<_> = (0..3).map(|_| pool.submit(|| Ok(())).unwrap()).collect();

        assert_eq!(pool.shutdown_now(), 3);
        gate.wait();
        running.wait().unwrap();
        for h in queued {
            assert!(matches!(h.wait(), Err(TaskError::Cancelled)));
        }
        pool.await_termination();
        assert_eq!(pool.unfinished_count(), 0);
    }
}
