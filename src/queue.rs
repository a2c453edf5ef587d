use crossbeam_channel::{bounded, unbounded, Sender};
use std::{
    sync::{Condvar, Mutex},
    thread::{self, JoinHandle},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling discipline for a transport's work queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    /// One worker thread; jobs run in submission order. The default, and
    /// required whenever per-transport ordering matters.
    Serial,
    /// One thread per job; no ordering guarantee. Acceptable for stateless
    /// dispatchers.
    Concurrent,
}

/// A single-consumer work queue owned by a pipeline component. Serial
/// queues preserve submission order; `execute_sync` additionally blocks the
/// caller until the job (and everything queued before it) has completed,
/// which is how the pipeline's synchronous mode is built.
pub struct WorkQueue {
    inner: Inner,
}

enum Inner {
    Serial(SerialQueue),
    Concurrent(ConcurrentQueue),
}

impl WorkQueue {
    pub fn new(kind: QueueKind, name: &str) -> WorkQueue {
        let inner = match kind {
            QueueKind::Serial => Inner::Serial(SerialQueue::spawn(name)),
            QueueKind::Concurrent => Inner::Concurrent(ConcurrentQueue::new()),
        };
        WorkQueue { inner }
    }

    pub fn serial(name: &str) -> WorkQueue {
        WorkQueue::new(QueueKind::Serial, name)
    }

    pub fn kind(&self) -> QueueKind {
        match &self.inner {
            Inner::Serial(_) => QueueKind::Serial,
            Inner::Concurrent(_) => QueueKind::Concurrent,
        }
    }

    /// Schedules a job and returns immediately. Jobs submitted after a
    /// queue has shut down are silently dropped, matching the write path's
    /// promise to never fail observably.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        match &self.inner {
            Inner::Serial(serial) => serial.execute(Box::new(job)),
            Inner::Concurrent(concurrent) => concurrent.execute(Box::new(job)),
        }
    }

    /// Runs a job to completion before returning. On a serial queue the job
    /// is appended after all previously queued work, so ordering with
    /// asynchronous submissions is preserved.
    pub fn execute_sync<F: FnOnce() + Send + 'static>(&self, job: F) {
        match &self.inner {
            Inner::Serial(serial) => {
                let (done_tx, done_rx) = bounded(1);
                serial.execute(Box::new(move || {
                    job();
                    let _ = done_tx.send(());
                }));
                let _ = done_rx.recv();
            }
            Inner::Concurrent(_) => job(),
        }
    }

    /// Blocks until every job queued before this call has completed.
    pub fn barrier(&self) {
        match &self.inner {
            Inner::Serial(_) => self.execute_sync(|| {}),
            Inner::Concurrent(concurrent) => concurrent.wait_idle(),
        }
    }
}

struct SerialQueue {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialQueue {
    fn spawn(name: &str) -> SerialQueue {
        let (tx, rx) = unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(format!("lantern-queue-{}", name))
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn queue worker thread");
        SerialQueue {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Disconnect the channel so the worker drains remaining jobs and
        // exits, then join it.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct ConcurrentQueue {
    state: std::sync::Arc<(Mutex<usize>, Condvar)>,
}

impl ConcurrentQueue {
    fn new() -> ConcurrentQueue {
        ConcurrentQueue {
            state: std::sync::Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    fn execute(&self, job: Job) {
        let state = std::sync::Arc::clone(&self.state);
        *state.0.lock().unwrap() += 1;
        let spawned = thread::Builder::new()
            .name("lantern-queue-job".to_owned())
            .spawn(move || {
                job();
                let (lock, condvar) = &*state;
                *lock.lock().unwrap() -= 1;
                condvar.notify_all();
            });
        if spawned.is_err() {
            let (lock, condvar) = &*self.state;
            *lock.lock().unwrap() -= 1;
            condvar.notify_all();
        }
    }

    fn wait_idle(&self) {
        let (lock, condvar) = &*self.state;
        let mut active = lock.lock().unwrap();
        while *active > 0 {
            active = condvar.wait(active).unwrap();
        }
    }
}
