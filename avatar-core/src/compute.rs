//! Compute context: where spring-bone frames are submitted and how per-bone work fans out.
//!
//! Two pieces:
//! - a `Scheduler` that accepts whole-frame jobs. `Immediate` runs them on the caller's
//!   thread, `SubmitQueue` hands them to one worker thread so frames run in submission order.
//! - a rayon pool used inside a frame for data-parallel stages. Each parallel `for_each`
//!   returns only once every element is done, which is the barrier between stages.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A unit of work. Implemented as a boxed `FnOnce()` for ergonomics.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Accepts jobs. Implementations may run them immediately or defer them to a worker.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, job: Job);
}

/// Runs jobs immediately on the calling thread.
#[derive(Default, Clone, Copy)]
pub struct Immediate;
impl Scheduler for Immediate {
    fn schedule(&self, job: Job) { (job)(); }
}

enum Message {
    Run(Job),
    Shutdown,
}

/// Single worker thread draining a FIFO of jobs.
pub struct SubmitQueue {
    tx: Mutex<mpsc::Sender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl SubmitQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    Message::Run(job) => {
                        // A panicking frame must not take the queue down with it.
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            log::error!("submitted job panicked; its results will never complete");
                        }
                    }
                    Message::Shutdown => break,
                }
            }
        })?;
        Ok(Self { tx: Mutex::new(tx), worker: Some(worker) })
    }

    fn send(&self, msg: Message) {
        let tx = match self.tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = tx.send(msg);
    }
}

impl Scheduler for SubmitQueue {
    fn schedule(&self, job: Job) { self.send(Message::Run(job)); }
}

impl Drop for SubmitQueue {
    fn drop(&mut self) {
        self.send(Message::Shutdown);
        if let Some(h) = self.worker.take() {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
    }
}

/// Cloneable handle to the fan-out pool. Submitted jobs carry this rather than the context.
#[derive(Clone)]
pub struct FanOut {
    pool: Arc<rayon::ThreadPool>,
}

impl FanOut {
    /// Run `f` inside the pool so rayon iterators in it use this pool's workers.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    pub fn workers(&self) -> usize { self.pool.current_num_threads() }
}

/// Opaque parallel-dispatch resource shared by every simulator that runs on it.
pub struct ComputeContext {
    scheduler: Box<dyn Scheduler>,
    fanout: FanOut,
    label: &'static str,
}

impl ComputeContext {
    /// Run submissions inline on a single-threaded pool. Deterministic; `update` returns finished work.
    pub fn immediate() -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("spring-fanout-{i}"))
            .build()?;
        Ok(Self { scheduler: Box::new(Immediate), fanout: FanOut { pool: Arc::new(pool) }, label: "immediate" })
    }

    /// Queue submissions on a background thread and fan stages out over `workers` threads.
    /// `workers == 0` lets rayon pick from the available parallelism.
    pub fn threaded(workers: usize) -> Result<Self, ComputeInitError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("spring-fanout-{i}"))
            .build()?;
        let queue = SubmitQueue::new("spring-submit")?;
        log::debug!("compute context: queue + {} fan-out workers", pool.current_num_threads());
        Ok(Self { scheduler: Box::new(queue), fanout: FanOut { pool: Arc::new(pool) }, label: "threaded" })
    }

    pub fn submit(&self, job: Job) { self.scheduler.schedule(job); }

    pub fn fanout(&self) -> FanOut { self.fanout.clone() }

    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.fanout.install(f)
    }

    pub fn workers(&self) -> usize { self.fanout.workers() }
    pub fn label(&self) -> &'static str { self.label }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("label", &self.label)
            .field("workers", &self.workers())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComputeInitError {
    #[error("failed to build fan-out pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn submission thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn immediate_runs_inline() {
        let s = Immediate;
        let flag = Arc::new(AtomicUsize::new(0));
        let f2 = flag.clone();
        s.schedule(Box::new(move || { f2.fetch_add(1, Ordering::AcqRel); }));
        assert_eq!(flag.load(Ordering::Acquire), 1);
    }

    #[test]
    fn queue_preserves_submission_order() {
        let ctx = ComputeContext::threaded(2).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = seen.clone();
            ctx.submit(Box::new(move || seen.lock().unwrap().push(i)));
        }
        drop(ctx); // joins the queue after draining it
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn queue_survives_a_panicking_job() {
        let ctx = ComputeContext::threaded(1).unwrap();
        let n = Arc::new(AtomicUsize::new(0));
        ctx.submit(Box::new(|| panic!("boom")));
        let n2 = n.clone();
        ctx.submit(Box::new(move || { n2.fetch_add(1, Ordering::AcqRel); }));
        drop(ctx);
        assert_eq!(n.load(Ordering::Acquire), 1);
    }

    #[test]
    fn install_fans_out_over_pool() {
        let ctx = ComputeContext::threaded(3).unwrap();
        assert_eq!(ctx.workers(), 3);
        let sum: usize = ctx.install(|| (0..1000usize).into_par_iter().sum());
        assert_eq!(sum, 499_500);
    }
}
