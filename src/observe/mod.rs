//! Serialized observability emitters.
//!
//! All emitters share one discipline: a per-instance write queue — a
//! dedicated writer thread draining a channel of I/O jobs. Emission from any
//! worker appends a job; jobs run strictly in order, so output never
//! interleaves. Emitters are non-critical: every I/O failure inside a job is
//! swallowed.

pub mod progress;
pub mod tracker;
pub mod trace;

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

/// A single-consumer write queue. Jobs pushed from any thread execute
/// sequentially on one writer thread. Closing flushes the backlog and joins.
pub struct WriteQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name(format!("emit-{}", name))
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .ok();
        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(handle),
        }
    }

    /// Enqueue a job. Silently dropped after `close`.
    pub fn push<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Drain the backlog and stop the writer thread. Idempotent.
    pub fn close(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.close();
    }
}
