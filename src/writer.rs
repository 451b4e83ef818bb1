//! Background persistence worker.
//!
//! Storage I/O triggered by store mutations runs on a single detached
//! thread. Callers enqueue a job and return immediately; failures are
//! logged by the job handler and never reach the caller.
//!
//! Jobs run in FIFO order. Write jobs carry only a profile id: the handler
//! serializes whatever the in-memory map holds when the job runs, so a
//! later job always writes state at least as new as an earlier one.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work the persistence thread knows how to perform.
pub(crate) trait JobHandler: Send + Sync + 'static {
    /// Write the full current map of a profile to storage.
    fn persist(&self, profile_id: &str);

    /// Load a profile's persisted map into memory.
    fn hydrate(&self, profile_id: &str);
}

enum Job {
    Persist(String),
    Hydrate(String),
    Flush(Sender<()>),
}

/// Handle to the persistence thread.
///
/// Dropping the handle closes the queue, lets the thread drain what is
/// already queued, and joins it.
pub(crate) struct PersistWorker {
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PersistWorker {
    /// Spawn the worker thread.
    pub fn spawn(handler: Arc<dyn JobHandler>, coalesce: bool) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("unread-persist".into())
            .spawn(move || run(handler, receiver, coalesce))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue a write of the profile's current map.
    pub fn schedule_persist(&self, profile_id: &str) {
        self.send(Job::Persist(profile_id.to_string()));
    }

    /// Queue a hydration of the profile's map.
    pub fn schedule_hydrate(&self, profile_id: &str) {
        self.send(Job::Hydrate(profile_id.to_string()));
    }

    /// Block until every job queued before this call has run.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.send(Job::Flush(ack_tx)) {
            // Err means the worker is gone, so nothing is left to wait for.
            let _ = ack_rx.recv();
        }
    }

    fn send(&self, job: Job) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        if sender.send(job).is_err() {
            tracing::warn!("persistence worker has stopped; job dropped");
            return false;
        }
        true
    }
}

impl Drop for PersistWorker {
    fn drop(&mut self) {
        // Closing the channel ends the loop once the queue is drained.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped by a job on the worker itself; the loop exits once
                // the queue is drained.
                tracing::debug!("persistence worker released from its own thread");
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("persistence worker panicked");
            }
        }
    }
}

fn run(handler: Arc<dyn JobHandler>, receiver: Receiver<Job>, coalesce: bool) {
    tracing::debug!("persistence worker started");

    while let Ok(first) = receiver.recv() {
        let batch: Vec<Job> = if coalesce {
            std::iter::once(first).chain(receiver.try_iter()).collect()
        } else {
            vec![first]
        };
        execute(handler.as_ref(), batch);
    }

    tracing::debug!("persistence worker stopped");
}

/// Run a batch. Consecutive writes are collapsed to one per profile;
/// hydrations and flushes act as barriers so they still observe every
/// write queued before them.
fn execute(handler: &dyn JobHandler, batch: Vec<Job>) {
    let mut writes: Vec<String> = Vec::new();

    for job in batch {
        match job {
            Job::Persist(profile_id) => {
                if !writes.contains(&profile_id) {
                    writes.push(profile_id);
                }
            }
            Job::Hydrate(profile_id) => {
                drain_writes(handler, &mut writes);
                handler.hydrate(&profile_id);
            }
            Job::Flush(ack) => {
                drain_writes(handler, &mut writes);
                let _ = ack.send(());
            }
        }
    }

    drain_writes(handler, &mut writes);
}

fn drain_writes(handler: &dyn JobHandler, writes: &mut Vec<String>) {
    for profile_id in writes.drain(..) {
        handler.persist(&profile_id);
    }
}
