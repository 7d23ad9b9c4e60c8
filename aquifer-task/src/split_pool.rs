use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

/// A unit of work handed to the pool. Task bodies are responsible for their
/// own error handling; panics must not cross the scheduling boundary.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadPoolError {
    #[error("the pool requires at least one synchronous worker thread")]
    ZeroSyncThreads,
    #[error("the pool requires at least one asynchronous worker thread")]
    ZeroAsyncThreads,
    #[error("the pool has already been started")]
    AlreadyStarted,
    #[error("the pool has not been started")]
    NotStarted,
}

// One category of work: the channel carrying tasks plus instantaneous
// queued/processing counters for the wait/observability calls.
struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    queued: AtomicUsize,
    processing: AtomicUsize,
}

impl TaskQueue {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        TaskQueue {
            tx,
            rx,
            queued: AtomicUsize::new(0),
            processing: AtomicUsize::new(0),
        }
    }

    fn schedule(
        &self,
        task: Task,
    ) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the pool, so the send cannot fail
        self.tx.send(task).unwrap();
    }

    fn idle(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && self.processing.load(Ordering::SeqCst) == 0
    }
}

// Runs one task taken from `queue`. `processing` is raised before `queued`
// drops so the pair never transiently reads idle while work is outstanding.
fn run_task(
    queue: &TaskQueue,
    task: Task,
) {
    queue.processing.fetch_add(1, Ordering::SeqCst);
    queue.queued.fetch_sub(1, Ordering::SeqCst);
    task();
    queue.processing.fetch_sub(1, Ordering::SeqCst);
}

fn sync_worker(
    sync_tasks: Arc<TaskQueue>,
    finish_rx: Receiver<()>,
) {
    loop {
        crossbeam_channel::select! {
            recv(sync_tasks.rx) -> task => {
                if let Ok(task) = task {
                    profiling::scope!("sync task");
                    run_task(&sync_tasks, task);
                }
            },
            recv(finish_rx) -> _msg => {
                // Scheduled work always runs to completion; drain what is
                // still queued before shutting down
                while let Ok(task) = sync_tasks.rx.try_recv() {
                    run_task(&sync_tasks, task);
                }
                return;
            }
        }
    }
}

fn async_worker(
    sync_tasks: Arc<TaskQueue>,
    async_tasks: Arc<TaskQueue>,
    finish_rx: Receiver<()>,
) {
    loop {
        // Prefer asynchronous work; only when that queue is empty compete
        // for synchronous work instead of idling
        if let Ok(task) = async_tasks.rx.try_recv() {
            profiling::scope!("async task");
            run_task(&async_tasks, task);
            continue;
        }
        if let Ok(task) = sync_tasks.rx.try_recv() {
            profiling::scope!("sync task");
            run_task(&sync_tasks, task);
            continue;
        }

        crossbeam_channel::select! {
            recv(async_tasks.rx) -> task => {
                if let Ok(task) = task {
                    profiling::scope!("async task");
                    run_task(&async_tasks, task);
                }
            },
            recv(sync_tasks.rx) -> task => {
                if let Ok(task) = task {
                    profiling::scope!("sync task");
                    run_task(&sync_tasks, task);
                }
            },
            recv(finish_rx) -> _msg => {
                while let Ok(task) = async_tasks.rx.try_recv() {
                    run_task(&async_tasks, task);
                }
                while let Ok(task) = sync_tasks.rx.try_recv() {
                    run_task(&sync_tasks, task);
                }
                return;
            }
        }
    }
}

struct WorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

/// A fixed-size pool with two categories of worker: dedicated synchronous
/// workers that only service the sync queue, and asynchronous workers that
/// service the async queue but also take sync work when their own queue is
/// empty. Async workers are a superset consumer of sync work, never the
/// reverse.
///
/// No starvation bound is given for the dedicated sync workers while async
/// workers keep draining the sync queue; the scheduling order above is the
/// whole policy.
pub struct SplitThreadPool {
    sync_thread_count: u32,
    async_thread_count: u32,
    sync_tasks: Arc<TaskQueue>,
    async_tasks: Arc<TaskQueue>,
    started: AtomicBool,
    workers: Mutex<Vec<WorkerThread>>,
}

impl SplitThreadPool {
    /// Both thread counts must be non-zero; a failed creation constructs
    /// nothing.
    pub fn new(
        sync_threads: u32,
        async_threads: u32,
    ) -> Result<Self, ThreadPoolError> {
        if sync_threads == 0 {
            return Err(ThreadPoolError::ZeroSyncThreads);
        }
        if async_threads == 0 {
            return Err(ThreadPoolError::ZeroAsyncThreads);
        }

        Ok(SplitThreadPool {
            sync_thread_count: sync_threads,
            async_thread_count: async_threads,
            sync_tasks: Arc::new(TaskQueue::new()),
            async_tasks: Arc::new(TaskQueue::new()),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn num_sync_threads(&self) -> u32 {
        self.sync_thread_count
    }

    pub fn num_async_threads(&self) -> u32 {
        self.async_thread_count
    }

    /// Spawns the worker threads. Fails if the pool is already running.
    pub fn start(&self) -> Result<(), ThreadPoolError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ThreadPoolError::AlreadyStarted);
        }

        let mut workers = self.workers.lock().unwrap();

        for thread_index in 0..self.sync_thread_count {
            let sync_tasks = self.sync_tasks.clone();
            let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
            let join_handle = std::thread::Builder::new()
                .name(format!("sync worker {}", thread_index))
                .spawn(move || {
                    profiling::register_thread!(&format!("sync worker {}", thread_index));
                    sync_worker(sync_tasks, finish_rx);
                })
                .unwrap();
            workers.push(WorkerThread {
                finish_tx,
                join_handle,
            });
        }

        for thread_index in 0..self.async_thread_count {
            let sync_tasks = self.sync_tasks.clone();
            let async_tasks = self.async_tasks.clone();
            let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
            let join_handle = std::thread::Builder::new()
                .name(format!("async worker {}", thread_index))
                .spawn(move || {
                    profiling::register_thread!(&format!("async worker {}", thread_index));
                    async_worker(sync_tasks, async_tasks, finish_rx);
                })
                .unwrap();
            workers.push(WorkerThread {
                finish_tx,
                join_handle,
            });
        }

        log::debug!(
            "split thread pool started with {} sync / {} async workers",
            self.sync_thread_count,
            self.async_thread_count
        );

        Ok(())
    }

    /// Signals every worker to finish, lets them drain the queues, and joins
    /// them. A stopped pool can be started again.
    pub fn stop(&self) -> Result<(), ThreadPoolError> {
        if self
            .started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ThreadPoolError::NotStarted);
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());

        for worker in &workers {
            let _ = worker.finish_tx.send(());
        }
        for worker in workers {
            worker.join_handle.join().unwrap();
        }

        log::debug!("split thread pool stopped");

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn schedule_sync(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ThreadPoolError> {
        if !self.is_started() {
            return Err(ThreadPoolError::NotStarted);
        }

        self.sync_tasks.schedule(Box::new(task));
        Ok(())
    }

    pub fn schedule_async(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ThreadPoolError> {
        if !self.is_started() {
            return Err(ThreadPoolError::NotStarted);
        }

        self.async_tasks.schedule(Box::new(task));
        Ok(())
    }

    pub fn num_queued_sync(&self) -> usize {
        self.sync_tasks.queued.load(Ordering::SeqCst)
    }

    pub fn num_queued_async(&self) -> usize {
        self.async_tasks.queued.load(Ordering::SeqCst)
    }

    pub fn num_processing_sync(&self) -> usize {
        self.sync_tasks.processing.load(Ordering::SeqCst)
    }

    pub fn num_processing_async(&self) -> usize {
        self.async_tasks.processing.load(Ordering::SeqCst)
    }

    /// Blocks the caller until all queued and in-flight synchronous work has
    /// drained.
    pub fn wait_sync_complete(&self) -> Result<(), ThreadPoolError> {
        if !self.is_started() {
            return Err(ThreadPoolError::NotStarted);
        }

        while !self.sync_tasks.idle() {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Blocks the caller until all queued and in-flight asynchronous work has
    /// drained.
    pub fn wait_async_complete(&self) -> Result<(), ThreadPoolError> {
        if !self.is_started() {
            return Err(ThreadPoolError::NotStarted);
        }

        while !self.async_tasks.idle() {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Blocks the caller until both categories of work have drained.
    pub fn wait_all_complete(&self) -> Result<(), ThreadPoolError> {
        if !self.is_started() {
            return Err(ThreadPoolError::NotStarted);
        }

        while !self.sync_tasks.idle() || !self.async_tasks.idle() {
            std::thread::yield_now();
        }
        Ok(())
    }
}

impl Drop for SplitThreadPool {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const NUM_THREADS: u32 = 2;

    #[test]
    fn creating_with_zero_sync_threads_fails() {
        assert_eq!(
            SplitThreadPool::new(0, NUM_THREADS).err(),
            Some(ThreadPoolError::ZeroSyncThreads)
        );
    }

    #[test]
    fn creating_with_zero_async_threads_fails() {
        assert_eq!(
            SplitThreadPool::new(NUM_THREADS, 0).err(),
            Some(ThreadPoolError::ZeroAsyncThreads)
        );
    }

    #[test]
    fn creating_with_both_counts_nonzero_succeeds() {
        let pool = SplitThreadPool::new(1, 1).unwrap();
        assert_eq!(pool.num_sync_threads(), 1);
        assert_eq!(pool.num_async_threads(), 1);
        assert_eq!(pool.num_queued_sync(), 0);
        assert_eq!(pool.num_queued_async(), 0);
        assert_eq!(pool.num_processing_sync(), 0);
        assert_eq!(pool.num_processing_async(), 0);
    }

    #[test]
    fn start_stop_protocol() {
        let pool = SplitThreadPool::new(NUM_THREADS, NUM_THREADS).unwrap();

        pool.start().unwrap();
        assert_eq!(pool.start().err(), Some(ThreadPoolError::AlreadyStarted));

        pool.stop().unwrap();
        assert_eq!(pool.stop().err(), Some(ThreadPoolError::NotStarted));

        // A stopped pool can be restarted
        pool.start().unwrap();
        pool.stop().unwrap();
    }

    #[test]
    fn scheduling_when_not_started_fails() {
        let pool = SplitThreadPool::new(NUM_THREADS, NUM_THREADS).unwrap();

        assert_eq!(
            pool.schedule_sync(|| {}).err(),
            Some(ThreadPoolError::NotStarted)
        );
        assert_eq!(
            pool.schedule_async(|| {}).err(),
            Some(ThreadPoolError::NotStarted)
        );
    }

    #[test]
    fn waiting_when_not_started_fails() {
        let pool = SplitThreadPool::new(NUM_THREADS, NUM_THREADS).unwrap();

        assert_eq!(
            pool.wait_sync_complete().err(),
            Some(ThreadPoolError::NotStarted)
        );
        assert_eq!(
            pool.wait_async_complete().err(),
            Some(ThreadPoolError::NotStarted)
        );
        assert_eq!(
            pool.wait_all_complete().err(),
            Some(ThreadPoolError::NotStarted)
        );
    }

    #[test]
    fn waiting_with_no_work_returns_immediately() {
        let pool = SplitThreadPool::new(NUM_THREADS, NUM_THREADS).unwrap();
        pool.start().unwrap();

        pool.wait_sync_complete().unwrap();
        pool.wait_async_complete().unwrap();
        pool.wait_all_complete().unwrap();
    }

    #[test]
    fn all_scheduled_tasks_run_exactly_once() {
        let pool = SplitThreadPool::new(NUM_THREADS, NUM_THREADS).unwrap();
        pool.start().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let sync_ran = ran.clone();
            pool.schedule_sync(move || {
                sync_ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            let async_ran = ran.clone();
            pool.schedule_async(move || {
                async_ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_all_complete().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn async_workers_take_sync_work_when_idle() {
        let pool = SplitThreadPool::new(1, 1).unwrap();
        pool.start().unwrap();

        // Park the only sync worker on a rendezvous
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
        pool.schedule_sync(move || {
            block_rx.recv().unwrap();
        })
        .unwrap();
        while pool.num_processing_sync() == 0 {
            std::thread::yield_now();
        }

        // With the sync worker occupied, further sync work still completes
        // because the idle async worker competes for it
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        pool.schedule_sync(move || {
            done_tx.send(()).unwrap();
        })
        .unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("sync task was not taken by the async worker");

        block_tx.send(()).unwrap();
        pool.wait_all_complete().unwrap();
    }

    #[test]
    fn sync_workers_never_take_async_work() {
        let pool = SplitThreadPool::new(2, 1).unwrap();
        pool.start().unwrap();

        // Park the only async worker
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
        pool.schedule_async(move || {
            block_rx.recv().unwrap();
        })
        .unwrap();
        while pool.num_processing_async() == 0 {
            std::thread::yield_now();
        }

        // Async work queued behind it must stay queued; the idle sync
        // workers are not allowed to pick it up
        pool.schedule_async(|| {}).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.num_queued_async(), 1);

        block_tx.send(()).unwrap();
        pool.wait_all_complete().unwrap();
    }

    #[test]
    fn counters_observe_queued_and_processing_work() {
        let pool = SplitThreadPool::new(1, 1).unwrap();
        pool.start().unwrap();

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        // Three tasks through a single-consumer gate: one processing on each
        // worker (the async worker steals), one left queued
        for _ in 0..3 {
            let gate_rx = gate_rx.clone();
            pool.schedule_sync(move || {
                gate_rx.recv().unwrap();
            })
            .unwrap();
        }

        while pool.num_processing_sync() < 2 || pool.num_queued_sync() > 1 {
            std::thread::yield_now();
        }
        assert_eq!(pool.num_queued_sync(), 1);
        assert_eq!(pool.num_processing_sync(), 2);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        pool.wait_sync_complete().unwrap();

        assert_eq!(pool.num_queued_sync(), 0);
        assert_eq!(pool.num_processing_sync(), 0);
    }

    #[test]
    fn stopping_drains_queued_work() {
        let pool = SplitThreadPool::new(1, 1).unwrap();
        pool.start().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = ran.clone();
            pool.schedule_sync(move || {
                std::thread::sleep(Duration::from_millis(10));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn dropping_the_pool_stops_it() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let pool = SplitThreadPool::new(1, 1).unwrap();
            pool.start().unwrap();
            for _ in 0..4 {
                let ran = ran.clone();
                pool.schedule_async(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }
}
