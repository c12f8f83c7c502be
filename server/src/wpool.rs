//! factory of blocking worker threads.
//!
//! the event workers never block; filesystem calls and other blocking jobs are
//! handed to one of these workers instead. a worker parks on its condvar until
//! a job lands in its slot, runs it, signals completion back into the async
//! world and returns itself to the factory's idle ring. when the ring is full
//! the worker retires, which is how the pool shrinks after bursts.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};

use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

use crate::queue::RingQueue;

const DEFAULT_MAX_WORKERS: usize = 64;
const IDLE_QUEUE_CAPACITY: usize = 128;

type Job = Box<dyn FnOnce() + Send>;

/// handle to the worker pool. cheap to clone and sharable across tasks.
#[derive(Clone)]
pub struct WorkerFactory {
    shared: Arc<FactoryShared>,
}

struct FactoryShared {
    state: Mutex<FactoryState>,
    // woken whenever a worker returns to the idle ring.
    idle_notify: Notify,
    max_workers: usize,
}

struct FactoryState {
    idle: RingQueue<Arc<Worker>>,
    total: usize,
    shutdown: bool,
}

struct Worker {
    slot: Mutex<WorkerSlot>,
    start: Condvar,
}

#[derive(Default)]
struct WorkerSlot {
    job: Option<StartedJob>,
    shutdown: bool,
}

struct StartedJob {
    func: Job,
    done: Arc<AtomicBool>,
    complete: oneshot::Sender<()>,
}

impl Default for WorkerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl WorkerFactory {
    pub fn new(max_workers: usize) -> Self {
        assert!(max_workers > 0, "worker pool needs at least one worker");
        Self {
            shared: Arc::new(FactoryShared {
                state: Mutex::new(FactoryState {
                    idle: RingQueue::with_capacity(IDLE_QUEUE_CAPACITY),
                    total: 0,
                    shutdown: false,
                }),
                idle_notify: Notify::new(),
                max_workers,
            }),
        }
    }

    /// run `func` on a worker thread and await its result.
    pub async fn execute<F, R>(&self, func: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let worker = self.get_worker().await;

        let (complete_tx, complete_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));

        let job_done = done.clone();
        let job: Job = Box::new(move || {
            let result = func();
            let _ = result_tx.send(result);
        });

        worker.start_job(StartedJob {
            func: job,
            done: job_done,
            complete: complete_tx,
        });

        // completion fires after the job ran and the worker re-idled.
        let _ = complete_rx.await;
        debug_assert!(done.load(Ordering::SeqCst));

        result_rx.await.expect("worker job dropped its result")
    }

    // pop an idle worker, spawn a fresh one under the cap, or wait for the
    // next one to come home.
    async fn get_worker(&self) -> Arc<Worker> {
        loop {
            let spawn = {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(worker) = state.idle.pop() {
                    return worker;
                }
                if state.total < self.shared.max_workers {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if spawn {
                return self.spawn_worker();
            }

            self.shared.idle_notify.notified().await;
        }
    }

    fn spawn_worker(&self) -> Arc<Worker> {
        let worker = Arc::new(Worker {
            slot: Mutex::new(WorkerSlot::default()),
            start: Condvar::new(),
        });

        let thread_worker = worker.clone();
        let shared = self.shared.clone();

        std::thread::Builder::new()
            .name("strand-worker".into())
            .spawn(move || worker_loop(thread_worker, shared))
            .expect("failed to spawn worker thread");

        trace!(target: "wpool", "spawned blocking worker");

        worker
    }

    /// retire surplus idle workers. wired to the gc tick.
    pub fn gc(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let excess = state.idle.len() / 2;
        for _ in 0..excess {
            if let Some(worker) = state.idle.pop() {
                state.total -= 1;
                worker.request_shutdown();
            }
        }
        if excess > 0 {
            debug!(target: "wpool", retired = excess, "gc retired idle workers");
        }
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().unwrap().idle.len()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().unwrap().total
    }

    /// wind the pool down. running jobs finish; idle workers exit.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        while let Some(worker) = state.idle.pop() {
            state.total -= 1;
            worker.request_shutdown();
        }
    }
}

impl Worker {
    fn start_job(&self, job: StartedJob) {
        let mut slot = self.slot.lock().unwrap();
        debug_assert!(slot.job.is_none(), "worker already has a job");
        slot.job = Some(job);
        self.start.notify_one();
    }

    fn request_shutdown(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.shutdown = true;
        self.start.notify_one();
    }
}

fn worker_loop(worker: Arc<Worker>, shared: Arc<FactoryShared>) {
    loop {
        let job = {
            let mut slot = worker.slot.lock().unwrap();
            loop {
                if let Some(job) = slot.job.take() {
                    break job;
                }
                if slot.shutdown {
                    return;
                }
                slot = worker.start.wait(slot).unwrap();
            }
        };

        (job.func)();

        // publish completion before the waiter can observe the wakeup.
        job.done.store(true, Ordering::SeqCst);

        // rejoin the idle ring, then let the submitter resume. a full ring
        // retires this worker instead.
        let retired = {
            let mut state = shared.state.lock().unwrap();
            if state.shutdown || state.idle.push(worker.clone()).is_err() {
                state.total -= 1;
                true
            } else {
                false
            }
        };

        shared.idle_notify.notify_one();
        let _ = job.complete.send(());

        if retired {
            return;
        }
    }
}
