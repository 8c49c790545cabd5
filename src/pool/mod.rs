//! Fixed-size pool of OCR worker processes.
//!
//! The pool owns every worker, decides which worker serves which job, holds
//! the admission queue, and respawns workers whose child process died. All
//! pool-level bookkeeping (queue, restart set) lives behind one mutex that is
//! never held across I/O; each worker guards its own flags, and worker-to-pool
//! notifications travel over a single event channel so reactions to free and
//! crash signals are serialized.

pub(crate) mod protocol;
mod queue;
mod worker;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use futures::{StreamExt as _, stream::FuturesUnordered};
use tokio::{sync::mpsc, time};

use crate::{error::PoolError, prelude::*};

pub use self::protocol::random_request_id;
use self::{
    queue::{AdmissionQueue, QueueEntry},
    worker::{ExecuteError, PoolEvent, Worker},
};

/// Delay between noticing a dead worker and respawning it, so a crash-looping
/// engine cannot pin a CPU with back-to-back model loads.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(2);

/// Pool tuning knobs.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub worker_count: usize,

    /// Maximum number of jobs waiting for a free worker.
    pub queue_capacity: usize,

    /// Budget for a single OCR job, also used as the queue-wait budget.
    pub ocr_timeout: Duration,

    /// How long a freshly spawned child may take to load its models.
    pub ready_timeout: Duration,

    /// Child command line: program followed by its arguments.
    pub worker_command: Vec<String>,
}

/// A successful OCR outcome.
#[derive(Clone, Debug, Serialize)]
pub struct OcrResult {
    /// Extracted text, empty when the engine returned none.
    pub text: String,

    /// Number of pages in the document, when the engine reports it.
    pub page_count: Option<u32>,
}

/// One worker's flags, as reported by the health endpoint.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub ready: bool,
    pub busy: bool,
}

/// Snapshot of the pool for health reporting.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub workers: Vec<WorkerStatus>,
    pub queue_depth: usize,
}

impl PoolStats {
    /// At least one worker can accept work.
    pub fn any_ready(&self) -> bool {
        self.workers.iter().any(|worker| worker.ready)
    }
}

/// The seam between the HTTP surface and the pool, so handlers can be tested
/// against a scripted backend.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// OCR the PDF at `pdf_path`, waiting for a worker if necessary.
    async fn submit(&self, pdf_path: &Path, request_id: &str)
    -> std::result::Result<OcrResult, PoolError>;

    /// Current pool snapshot.
    fn stats(&self) -> PoolStats;
}

/// Bookkeeping shared by every pool task.
struct PoolShared {
    config: Arc<PoolConfig>,
    workers: Vec<Arc<Worker>>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

struct PoolState {
    queue: AdmissionQueue,
    /// Worker ids with a respawn scheduled or in flight. Doubles as the
    /// idempotence guard: at most one restart per worker at a time.
    restarting: HashSet<usize>,
}

/// Supervisor for a fixed set of OCR worker processes.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create the workers and start them all concurrently.
    ///
    /// Returns as soon as one worker is ready; the rest keep starting in the
    /// background, and any that fail are retried on the crash path. Fails
    /// with [`PoolError::NoWorkerStarted`] only if every start attempt
    /// failed, which the host should treat as fatal.
    #[instrument(level = "debug", skip_all, fields(worker_count = config.worker_count))]
    pub async fn init(config: PoolConfig) -> std::result::Result<Self, PoolError> {
        let config = Arc::new(config);
        let (events, events_rx) = mpsc::unbounded_channel();
        let workers = (0..config.worker_count)
            .map(|id| Arc::new(Worker::new(id, Arc::clone(&config), events.clone())))
            .collect();
        let shared = Arc::new(PoolShared {
            config: Arc::clone(&config),
            workers,
            state: Mutex::new(PoolState {
                queue: AdmissionQueue::new(config.queue_capacity),
                restarting: HashSet::new(),
            }),
            events,
        });

        tokio::spawn(run_events(Arc::downgrade(&shared), events_rx));

        // Start every worker on its own task so that returning early (or an
        // individual failure) never cancels the others.
        let mut starts: FuturesUnordered<_> = shared
            .workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                let events = shared.events.clone();
                tokio::spawn(async move {
                    match Arc::clone(&worker).start().await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(worker = worker.id(), error = ?err, "OCR worker failed to start");
                            let _ = events.send(PoolEvent::Crash {
                                id: worker.id(),
                                exit_code: None,
                            });
                            false
                        }
                    }
                })
            })
            .collect();

        let mut any_ready = false;
        while let Some(joined) = starts.next().await {
            if matches!(joined, Ok(true)) {
                any_ready = true;
                break;
            }
        }
        if !any_ready {
            error!("no OCR worker reached readiness");
            return Err(PoolError::NoWorkerStarted);
        }

        info!("OCR worker pool is up");
        Ok(Self { shared })
    }

    /// OCR one PDF, dispatching to the first free worker or queueing when all
    /// are occupied.
    #[instrument(level = "debug", skip_all, fields(request = request_id))]
    pub async fn run(
        &self,
        pdf_path: &Path,
        request_id: &str,
    ) -> std::result::Result<OcrResult, PoolError> {
        // First fit by worker id, so low-numbered workers stay hot.
        loop {
            let reserved = {
                let st = self.shared.state.lock().expect("lock poisoned");
                self.shared
                    .workers
                    .iter()
                    .find(|w| !st.restarting.contains(&w.id()) && w.try_reserve())
                    .cloned()
            };
            let Some(worker) = reserved else { break };
            debug!(worker = worker.id(), "dispatching job");
            match worker.execute(pdf_path).await {
                Ok(result) => return Ok(result),
                Err(ExecuteError::Failed(err)) => return Err(err),
                // The worker died before the request reached it; scan again.
                Err(ExecuteError::NotSubmitted) => continue,
            }
        }

        // Nobody is free: queue the job, bounded, with its own expiry.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let seq = {
            let mut st = self.shared.state.lock().expect("lock poisoned");
            if st.queue.is_full() {
                warn!(depth = st.queue.depth(), "admission queue is full; rejecting job");
                return Err(PoolError::Overloaded);
            }
            st.queue
                .push_back(pdf_path.to_owned(), request_id.to_owned(), tx)
        };
        debug!("queued job while all workers are occupied");
        arm_queue_timer(&self.shared, seq);

        match rx.await {
            Ok(outcome) => outcome,
            // The pool was torn down with this job still waiting.
            Err(_closed) => Err(PoolError::PoolNotReady),
        }
    }

    /// Snapshot for the health endpoint.
    pub fn stats(&self) -> PoolStats {
        let workers = self
            .shared
            .workers
            .iter()
            .map(|worker| worker.status())
            .collect();
        let queue_depth = self
            .shared
            .state
            .lock()
            .expect("lock poisoned")
            .queue
            .depth();
        PoolStats {
            workers,
            queue_depth,
        }
    }

    /// Kill every child process. Called on graceful shutdown; jobs still in
    /// flight fail through the usual crash path.
    pub fn shutdown(&self) {
        info!("shutting down OCR worker pool");
        for worker in &self.shared.workers {
            worker.kill();
        }
    }
}

#[async_trait]
impl OcrBackend for Pool {
    async fn submit(
        &self,
        pdf_path: &Path,
        request_id: &str,
    ) -> std::result::Result<OcrResult, PoolError> {
        self.run(pdf_path, request_id).await
    }

    fn stats(&self) -> PoolStats {
        Pool::stats(self)
    }
}

/// Serialize reactions to worker notifications.
///
/// Holding only a weak reference lets the task end once the pool (and with it
/// every event sender) is gone.
async fn run_events(
    shared: Weak<PoolShared>,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        match event {
            PoolEvent::Free(id) => dispatch_queued(&shared, Some(id)),
            PoolEvent::Crash { id, exit_code } => {
                schedule_restart(&shared, id, exit_code)
            }
            PoolEvent::RestartFinished { id, ok } => {
                {
                    let mut st = shared.state.lock().expect("lock poisoned");
                    st.restarting.remove(&id);
                }
                if ok {
                    // The worker is back; hand out as much queued work as the
                    // pool can take.
                    dispatch_queued(&shared, None);
                } else {
                    // The respawned child never became ready. Keep the worker
                    // in the respawn cycle rather than leaving a permanently
                    // dead slot in the pool.
                    schedule_restart(&shared, id, None);
                }
            }
        }
    }
}

/// Move queued jobs onto free workers.
///
/// With `only` set, at most one job is handed to that specific worker (the
/// free-signal path); otherwise workers are filled in id order until the
/// queue empties or nobody is free (the post-restart drain).
fn dispatch_queued(shared: &Arc<PoolShared>, only: Option<usize>) {
    loop {
        let (entry, worker) = {
            let mut st = shared.state.lock().expect("lock poisoned");
            if st.queue.is_empty() {
                return;
            }
            let reserved = match only {
                Some(id) => {
                    let worker = &shared.workers[id];
                    // The worker may have crashed between sending the free
                    // signal and this dispatch; leaving the entry at the head
                    // preserves FIFO for whoever frees next.
                    if st.restarting.contains(&id) || !worker.try_reserve() {
                        return;
                    }
                    Arc::clone(worker)
                }
                None => {
                    let Some(worker) = shared
                        .workers
                        .iter()
                        .find(|w| !st.restarting.contains(&w.id()) && w.try_reserve())
                    else {
                        return;
                    };
                    Arc::clone(worker)
                }
            };
            let entry = st.queue.pop_front().expect("queue checked non-empty");
            (entry, reserved)
        };

        let shared_for_retry = Arc::clone(shared);
        tokio::spawn(async move {
            debug!(request = %entry.request_id, worker = worker.id(), "dispatching queued job");
            match worker.execute(&entry.pdf_path).await {
                Ok(result) => {
                    let _ = entry.tx.send(Ok(result));
                }
                Err(ExecuteError::Failed(err)) => {
                    let _ = entry.tx.send(Err(err));
                }
                Err(ExecuteError::NotSubmitted) => {
                    // The worker died before the request reached it; the job
                    // goes back to the head of the queue with a fresh timer.
                    requeue_front(&shared_for_retry, entry);
                }
            }
        });

        if only.is_some() {
            return;
        }
    }
}

/// Put an undelivered entry back at the queue head and retry dispatch.
fn requeue_front(shared: &Arc<PoolShared>, entry: QueueEntry) {
    debug!(request = %entry.request_id, "returning undelivered job to the queue head");
    let seq = entry.seq;
    {
        let mut st = shared.state.lock().expect("lock poisoned");
        st.queue.push_front(entry);
    }
    arm_queue_timer(shared, seq);
    dispatch_queued(shared, None);
}

/// Arm the expiry timer for a queued entry.
///
/// The timer removes the entry by identity, so firing after dispatch is a
/// no-op; dequeue additionally aborts it.
fn arm_queue_timer(shared: &Arc<PoolShared>, seq: u64) {
    let weak = Arc::downgrade(shared);
    let wait = shared.config.ocr_timeout;
    let timer = tokio::spawn(async move {
        time::sleep(wait).await;
        let Some(shared) = weak.upgrade() else { return };
        let expired = {
            let mut st = shared.state.lock().expect("lock poisoned");
            st.queue.remove(seq)
        };
        if let Some(entry) = expired {
            warn!(request = %entry.request_id, waited = ?wait, "job expired while queued");
            let _ = entry.tx.send(Err(PoolError::QueuedTooLong));
        }
    });
    shared
        .state
        .lock()
        .expect("lock poisoned")
        .queue
        .set_timer(seq, timer.abort_handle());
}

/// Respawn a dead worker after the cooldown, at most once at a time per id.
fn schedule_restart(shared: &Arc<PoolShared>, id: usize, exit_code: Option<i32>) {
    {
        let mut st = shared.state.lock().expect("lock poisoned");
        if !st.restarting.insert(id) {
            debug!(worker = id, "restart already scheduled");
            return;
        }
    }
    info!(worker = id, ?exit_code, cooldown = ?RESTART_COOLDOWN, "scheduling worker respawn");

    let worker = Arc::clone(&shared.workers[id]);
    let events = shared.events.clone();
    tokio::spawn(async move {
        time::sleep(RESTART_COOLDOWN).await;
        let ok = match worker.start().await {
            Ok(()) => true,
            Err(err) => {
                warn!(worker = id, error = ?err, "failed to respawn OCR worker");
                false
            }
        };
        let _ = events.send(PoolEvent::RestartFinished { id, ok });
    });
}
