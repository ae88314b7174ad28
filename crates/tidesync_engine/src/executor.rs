//! Task lanes: serialized executors, the callback pool, and cancel tokens.
//!
//! The writer domain and the push/pull lane are both [`SerialExecutor`]s: a
//! dedicated worker thread draining an mpsc channel of boxed jobs, so
//! serialization is enforced by construction rather than by convention.
//! User completions run on a [`CallbackPool`] with bounded parallelism.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded serial executor.
///
/// Jobs run in submission order on one named worker thread. Dropping the
/// executor closes the channel; already-queued jobs still run before the
/// worker exits.
pub struct SerialExecutor {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl SerialExecutor {
    /// Spawns the worker thread.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let (id_tx, id_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = id_tx.send(thread::current().id());
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("failed to spawn executor thread");
        let worker_id = id_rx.recv().expect("executor thread did not start");

        Self {
            sender: Some(sender),
            worker: Some(worker),
            worker_id,
        }
    }

    /// True when the caller is already on this executor's worker thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Enqueues a job without waiting for it.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Runs a job on the worker thread and blocks until it completes.
    ///
    /// Calls from the worker thread itself execute inline, so a job may
    /// safely nest `run` on its own executor.
    pub fn run<T, F>(&self, job: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return job();
        }
        let (tx, rx) = mpsc::channel();
        self.dispatch(move || {
            let _ = tx.send(job());
        });
        rx.recv().expect("executor thread terminated")
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            // A job holding the last reference to the owner may drop us from
            // the worker thread itself; joining would then deadlock.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// A bounded-parallelism executor for user completion callbacks.
///
/// Workers share one receiver; each callback runs on exactly one worker.
pub struct CallbackPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CallbackPool {
    /// Spawns `workers` callback threads (at least one).
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("tidesync-callback-{i}"))
                    .spawn(move || loop {
                        let job = receiver.lock().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn callback thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Posts a callback to the pool.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // A completion may hold the last reference to the owner and drop
            // the pool from one of its own workers.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for CallbackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

/// Cooperative cancellation flag shared between a caller and a push/pull
/// task. Tasks observe it between suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
