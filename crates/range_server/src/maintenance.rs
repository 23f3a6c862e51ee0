//! Bounded worker pool for background maintenance.
//!
//! Compaction, split, and log-cleanup tasks queue FIFO and run to completion
//! on a fixed set of OS worker threads. `stop` pauses dispatch (in-flight
//! tasks finish) until `start`; a panicking task is logged and the workers
//! keep draining the queue.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// One unit of background work.
pub trait MaintenanceTask: Send + 'static {
    fn name(&self) -> &'static str;
    fn run(&self);
}

struct QueueState {
    queue: VecDeque<Box<dyn MaintenanceTask>>,
    running: bool,
    shutdown: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Fixed-size maintenance worker pool.
pub struct MaintenanceQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceQueue {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                running: true,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("maintenance-{index}"))
                .spawn(move || worker_loop(shared))
                .expect("spawn maintenance worker");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a task; it runs as soon as a worker is free and dispatch is
    /// not paused.
    pub fn add(&self, task: Box<dyn MaintenanceTask>) {
        let mut state = self.shared.state.lock().expect("maintenance queue lock");
        if state.shutdown {
            tracing::warn!(task = task.name(), "dropping task queued after shutdown");
            return;
        }
        state.queue.push_back(task);
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Resume dispatch after `stop`.
    pub fn start(&self) {
        let mut state = self.shared.state.lock().expect("maintenance queue lock");
        state.running = true;
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Pause dispatch. Queued tasks stay queued; the current task finishes.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().expect("maintenance queue lock");
        state.running = false;
    }

    /// Stop the workers for good, discarding any queued tasks.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("maintenance queue lock");
            state.shutdown = true;
            state.queue.clear();
        }
        self.shared.cond.notify_all();
        let mut workers = self.workers.lock().expect("maintenance workers lock");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn pending(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("maintenance queue lock")
            .queue
            .len()
    }
}

fn worker_loop(shared: Arc<QueueShared>) {
    let mut state = shared.state.lock().expect("maintenance queue lock");
    loop {
        if state.shutdown {
            return;
        }
        if state.running {
            if let Some(task) = state.queue.pop_front() {
                drop(state);
                let name = task.name();
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| task.run()));
                if result.is_err() {
                    tracing::error!(task = name, "maintenance task panicked");
                }
                state = shared.state.lock().expect("maintenance queue lock");
                continue;
            }
        }
        state = shared.cond.wait(state).expect("maintenance queue wait");
    }
}
