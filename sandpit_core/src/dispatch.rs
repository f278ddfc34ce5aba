//! Bounded FIFO queue feeding a fixed pool of worker slots.
//!
//! The dispatch task only pairs a free slot permit with the next queued
//! submission; all sandbox work happens on the blocking pool. Lock order is
//! always queue, then table.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore},
    task::{self, JoinHandle},
};

use crate::{
    config::{PoolConfig, SandpitConfig},
    error::{Error, Result},
    governor::CancelToken,
    runner::RunnerRegistry,
    sandbox,
    state::SubmissionState,
    submission::Submission,
    worker::Worker,
    ExecutionResult, SandboxFailure,
};

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cancellation {
    /// Removed from the queue; no result will be produced.
    Revoked,
    /// Already dispatched; its process group is being killed.
    Signalled,
    NotFound,
}

/// Handle on the eventual result of one submission. Resolves to `None`
/// when the submission was revoked while queued.
#[derive(Debug)]
pub struct Ticket {
    id: String,
    rx: oneshot::Receiver<Option<ExecutionResult>>,
}

impl Ticket {
    fn resolved(id: &str, result: ExecutionResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Some(result));
        Self { id: id.to_string(), rx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Option<ExecutionResult> {
        self.rx.await.ok().flatten()
    }

    /// For callers outside the runtime.
    pub fn blocking_wait(self) -> Option<ExecutionResult> {
        self.rx.blocking_recv().ok().flatten()
    }

    /// The result if it is already there.
    pub fn try_result(&mut self) -> Option<ExecutionResult> {
        self.rx.try_recv().ok().flatten()
    }
}

struct Queued {
    submission: Submission,
    reply: oneshot::Sender<Option<ExecutionResult>>,
}

struct Entry {
    state: SubmissionState,
    cancel: CancelToken,
}

struct Shared {
    worker: Worker,
    slots: Arc<Semaphore>,
    queue_depth: usize,
    queue: Mutex<VecDeque<Queued>>,
    table: Mutex<HashMap<String, Entry>>,
    wakeup: Notify,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn transition(&self, id: &str, next: SubmissionState) {
        if let Some(entry) = lock(&self.table).get_mut(id) {
            match entry.state.advance(next) {
                Ok(state) => entry.state = state,
                Err(e) => debug!("submission {}: {}", id, e),
            }
        }
    }

    /// Next queued submission, already marked dispatched.
    fn pop(&self) -> Option<(Queued, CancelToken)> {
        let mut queue = lock(&self.queue);
        let mut table = lock(&self.table);
        while let Some(queued) = queue.pop_front() {
            if let Some(entry) = table.get_mut(&queued.submission.id) {
                entry.state = SubmissionState::Dispatched;
                return Some((queued, entry.cancel.clone()));
            }
        }
        None
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Starts the dispatch task; must be called inside a tokio runtime.
    pub fn new(worker: Worker, pool: &PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            worker,
            slots: Arc::new(Semaphore::new(pool.slots.max(1))),
            queue_depth: pool.queue_depth.max(1),
            queue: Mutex::new(VecDeque::new()),
            table: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
        });
        info!(
            "dispatcher started with {} slots, queue depth {}",
            pool.slots, pool.queue_depth
        );
        let task = tokio::spawn(dispatch_loop(shared.clone()));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn from_config(config: SandpitConfig) -> Self {
        let sandbox = sandbox::from_config(&config);
        let pool = config.pool.clone();
        Self::new(Worker::new(RunnerRegistry::with_defaults(), sandbox, config), &pool)
    }

    /// Queues `submission`. Malformed submissions and ids already in flight
    /// are rejected; a full queue, an unknown language or a closed
    /// dispatcher resolve the ticket at once with a SandboxError.
    pub fn submit(&self, submission: Submission) -> Result<Ticket> {
        submission.validate()?;
        let id = submission.id.clone();

        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(Ticket::resolved(
                &id,
                ExecutionResult::sandbox_error(&id, SandboxFailure::ShuttingDown),
            ));
        }
        let runner = match self.shared.worker.registry().get(&submission.language) {
            Some(runner) => runner,
            None => {
                return Ok(Ticket::resolved(
                    &id,
                    ExecutionResult::sandbox_error(
                        &id,
                        SandboxFailure::UnsupportedLanguage(submission.language.clone()),
                    ),
                ))
            }
        };
        runner.stage(&submission.sources)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = lock(&self.shared.queue);
            let mut table = lock(&self.shared.table);
            if table.contains_key(&id) {
                return Err(Error::Argument(format!("submission `{}` is already in flight", id)));
            }
            if queue.len() >= self.shared.queue_depth {
                info!("queue full, rejecting {}", id);
                return Ok(Ticket::resolved(
                    &id,
                    ExecutionResult::sandbox_error(&id, SandboxFailure::QueueFull),
                ));
            }
            table.insert(
                id.clone(),
                Entry {
                    state: SubmissionState::Queued,
                    cancel: CancelToken::new(),
                },
            );
            queue.push_back(Queued {
                submission,
                reply: tx,
            });
        }
        debug!("queued {}", id);
        self.shared.wakeup.notify_one();
        Ok(Ticket { id, rx })
    }

    pub fn cancel(&self, id: &str) -> Cancellation {
        let mut queue = lock(&self.shared.queue);
        let mut table = lock(&self.shared.table);
        if let Some(pos) = queue.iter().position(|q| q.submission.id == id) {
            if let Some(queued) = queue.remove(pos) {
                table.remove(id);
                let _ = queued.reply.send(None);
                info!("revoked queued submission {}", id);
                return Cancellation::Revoked;
            }
        }
        match table.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!("cancelling dispatched submission {}", id);
                Cancellation::Signalled
            }
            None => Cancellation::NotFound,
        }
    }

    /// Live state of a queued or in-flight submission.
    pub fn status(&self, id: &str) -> Option<SubmissionState> {
        lock(&self.shared.table).get(id).map(|entry| entry.state)
    }

    /// Stops dispatching. Queued tickets resolve with ShuttingDown and
    /// in-flight work is cancelled.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Queued> = {
            let mut queue = lock(&self.shared.queue);
            let mut table = lock(&self.shared.table);
            let drained: Vec<Queued> = queue.drain(..).collect();
            for queued in &drained {
                table.remove(&queued.submission.id);
            }
            for entry in table.values() {
                entry.cancel.cancel();
            }
            drained
        };
        info!("shutting down, {} queued submissions dropped", drained.len());
        for queued in drained {
            let id = queued.submission.id;
            let _ = queued
                .reply
                .send(Some(ExecutionResult::sandbox_error(&id, SandboxFailure::ShuttingDown)));
        }
        self.shared.slots.close();
        self.shared.wakeup.notify_one();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let permit = match shared.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let (queued, cancel) = loop {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(next) = shared.pop() {
                break next;
            }
            shared.wakeup.notified().await;
        };
        run(shared.clone(), permit, queued, cancel);
    }
    debug!("dispatch loop finished");
}

fn run(shared: Arc<Shared>, permit: OwnedSemaphorePermit, queued: Queued, cancel: CancelToken) {
    let Queued { submission, reply } = queued;
    let id = submission.id.clone();
    debug!("dispatching {}", id);

    tokio::spawn(async move {
        let job_shared = shared.clone();
        let job = task::spawn_blocking(move || {
            let _permit = permit;
            let report = |state: SubmissionState| job_shared.transition(&submission.id, state);
            job_shared.worker.execute(&submission, &cancel, &report)
        });
        let result = match job.await {
            Ok(result) => result,
            Err(e) => {
                error!("worker for {} died: {}", id, e);
                let failure = SandboxFailure::Launch("worker panicked".into());
                ExecutionResult::sandbox_error(&id, failure)
            }
        };
        lock(&shared.table).remove(&id);
        info!("{} finished: {:?}", id, result.verdict);
        let _ = reply.send(Some(result));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Verdict;

    #[test]
    fn resolved_ticket() {
        let full = ExecutionResult::sandbox_error("q", SandboxFailure::QueueFull);
        let mut ticket = Ticket::resolved("q", full);
        assert_eq!(ticket.id(), "q");
        let result = ticket.try_result().unwrap();
        assert_eq!(result.verdict, Verdict::SandboxError);
        assert_eq!(result.sandbox_failure, Some(SandboxFailure::QueueFull));
    }

    #[tokio::test]
    async fn cancel_unknown_id() {
        let dispatcher = Dispatcher::from_config(SandpitConfig::default());
        assert_eq!(dispatcher.cancel("nope"), Cancellation::NotFound);
        assert_eq!(dispatcher.status("nope"), None);
        dispatcher.shutdown();
        let ticket = dispatcher.submit(Submission::new("late", "sh", "true")).unwrap();
        assert_eq!(
            ticket.wait().await.unwrap().sandbox_failure,
            Some(SandboxFailure::ShuttingDown)
        );
    }
}
