//! One supervised OCR child process.
//!
//! A `Worker` owns the full lifecycle of a single engine process: spawning it
//! with piped stdio, waiting for its readiness handshake, writing request
//! lines to its stdin, matching response lines by request id, and tearing
//! everything down when the process exits. The engine loads its models once
//! per spawn, so processes are long-lived and serve one job at a time.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
    time,
};

use crate::{
    error::PoolError,
    pool::{
        OcrResult, PoolConfig,
        protocol::{ChildMessage, OcrRequest, random_request_id},
    },
    prelude::*,
};

/// Length of the per-job correlation id written to the child.
const REQUEST_ID_LEN: usize = 16;

/// Notifications a worker sends to its supervisor.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// The worker finished (or timed out) a job and can take another.
    Free(usize),

    /// The worker's child exited after having been ready.
    Crash {
        id: usize,
        exit_code: Option<i32>,
    },

    /// A scheduled respawn attempt completed.
    RestartFinished {
        id: usize,
        ok: bool,
    },
}

/// How a job submission to one worker went wrong.
pub(crate) enum ExecuteError {
    /// The child was gone before the request line reached it; the job was
    /// never submitted and is safe to hand to another worker.
    NotSubmitted,

    /// The job was submitted and failed.
    Failed(PoolError),
}

/// Mutable per-spawn state, guarded by the worker's mutex.
#[derive(Default)]
struct WorkerState {
    /// Bumped on every spawn; tasks belonging to a superseded child check it
    /// before touching anything here.
    generation: u64,

    ready: bool,
    busy: bool,

    child: Option<Child>,
    stdin: Option<ChildStdin>,

    /// Outstanding jobs keyed by request id. At most one entry while the
    /// engine serves one job at a time, but matching stays id-based so a
    /// reply arriving after its job timed out falls on the floor.
    pending: HashMap<String, oneshot::Sender<Result<OcrResult, PoolError>>>,

    /// Readiness signal for the current spawn, consumed exactly once.
    ready_tx: Option<oneshot::Sender<Result<()>>>,
}

/// Supervisor-side handle for one OCR child process.
pub(crate) struct Worker {
    id: usize,
    config: Arc<PoolConfig>,
    events: mpsc::UnboundedSender<PoolEvent>,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<PoolConfig>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            id,
            config,
            events,
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Snapshot of the worker's flags for the health endpoint.
    pub fn status(&self) -> super::WorkerStatus {
        let st = self.state.lock().expect("lock poisoned");
        super::WorkerStatus {
            id: self.id,
            ready: st.ready,
            busy: st.busy,
        }
    }

    /// Atomically claim the worker for one job.
    ///
    /// Succeeds only when the worker is ready, idle, and its child has not
    /// already exited. The exit probe covers the window between a child dying
    /// and its reader task noticing: a free signal racing the exit must not
    /// win a job for a dead process.
    pub fn try_reserve(&self) -> bool {
        let mut st = self.state.lock().expect("lock poisoned");
        if !st.ready || st.busy {
            return false;
        }
        match st.child.as_mut() {
            Some(child) => {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return false;
                }
            }
            None => return false,
        }
        st.busy = true;
        true
    }

    /// Spawn the child process and wait for its readiness handshake.
    ///
    /// Resolves once the child prints `{"ready": true}`. Fails on spawn
    /// errors, on `{"ready": false}`, on the child exiting early, or on the
    /// ready timeout elapsing, in which case the child is killed.
    #[instrument(level = "debug", skip_all, fields(worker = self.id))]
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let (program, args) = self
            .config
            .worker_command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            // The engine must not buffer its stdout, or the readiness line and
            // responses would sit in a pipe buffer past their deadlines.
            .env("PYTHONUNBUFFERED", "1")
            .env("FLAGS_call_stack_level", "2")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("cannot spawn OCR worker {:?}", program))?;
        info!(pid = ?child.id(), "spawned OCR worker process");

        let stdout = child.stdout.take().context("worker stdout is not piped")?;
        let stderr = child.stderr.take().context("worker stderr is not piped")?;
        let stdin = child.stdin.take().context("worker stdin is not piped")?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let generation = {
            let mut st = self.state.lock().expect("lock poisoned");
            st.generation += 1;
            st.ready = false;
            st.busy = false;
            st.child = Some(child);
            st.stdin = Some(stdin);
            st.pending.clear();
            st.ready_tx = Some(ready_tx);
            st.generation
        };

        tokio::spawn(drain_stderr(self.id, stderr));
        let reader = Arc::clone(&self);
        tokio::spawn(async move { reader.read_stdout(stdout, generation).await });

        match time::timeout(self.config.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("OCR worker ready");
                Ok(())
            }
            Ok(Ok(Err(err))) => Err(err.context(format!(
                "OCR worker {} failed to become ready",
                self.id
            ))),
            Ok(Err(_closed)) => {
                Err(anyhow!("OCR worker {} exited before becoming ready", self.id))
            }
            Err(_elapsed) => {
                warn!(timeout = ?self.config.ready_timeout, "OCR worker did not become ready in time; killing it");
                self.kill();
                Err(anyhow!(
                    "OCR worker {} did not become ready within {:?}",
                    self.id,
                    self.config.ready_timeout
                ))
            }
        }
    }

    /// Submit one job to the child and wait for the matching response.
    ///
    /// The caller has claimed the worker via [`Self::try_reserve`], so `busy`
    /// is already set and no other job can be in flight.
    #[instrument(level = "debug", skip_all, fields(worker = self.id))]
    pub async fn execute(&self, pdf_path: &Path) -> Result<OcrResult, ExecuteError> {
        let request_id = random_request_id(REQUEST_ID_LEN);
        let line = serde_json::to_string(&OcrRequest {
            id: &request_id,
            pdf_path,
        })
        .map_err(|err| {
            ExecuteError::Failed(PoolError::Engine(format!(
                "cannot encode OCR request: {err}"
            )))
        })?;

        let (tx, rx) = oneshot::channel();
        let (mut stdin, generation) = {
            let mut st = self.state.lock().expect("lock poisoned");
            let Some(stdin) = st.stdin.take() else {
                // The child died between the reservation and this point.
                st.busy = false;
                return Err(ExecuteError::NotSubmitted);
            };
            st.pending.insert(request_id.clone(), tx);
            (stdin, st.generation)
        };

        debug!(request = %request_id, path = %pdf_path.display(), "submitting job to OCR worker");
        let write_result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        {
            let mut st = self.state.lock().expect("lock poisoned");
            if st.generation == generation && st.stdin.is_none() {
                st.stdin = Some(stdin);
            }
        }

        if let Err(err) = write_result {
            debug!(request = %request_id, error = %err, "request never reached the OCR worker");
            let mut st = self.state.lock().expect("lock poisoned");
            if st.generation == generation {
                st.pending.remove(&request_id);
                st.busy = false;
            }
            return Err(ExecuteError::NotSubmitted);
        }

        match time::timeout(self.config.ocr_timeout, rx).await {
            Ok(Ok(outcome)) => outcome.map_err(ExecuteError::Failed),
            // The sender vanished without a verdict; only teardown does that.
            Ok(Err(_closed)) => Err(ExecuteError::Failed(PoolError::WorkerCrashed {
                exit_code: None,
            })),
            Err(_elapsed) => {
                // The engine is presumed slow rather than wedged: leave the
                // child alive, forget the request id, and free the worker. If
                // the reply shows up later it no longer matches anything.
                warn!(request = %request_id, timeout = ?self.config.ocr_timeout, "job timed out; abandoning request id");
                {
                    let mut st = self.state.lock().expect("lock poisoned");
                    if st.generation == generation {
                        st.pending.remove(&request_id);
                        st.busy = false;
                    }
                }
                let _ = self.events.send(PoolEvent::Free(self.id));
                Err(ExecuteError::Failed(PoolError::OcrTimeout))
            }
        }
    }

    /// Terminate the child process, ignoring failures.
    pub fn kill(&self) {
        let mut st = self.state.lock().expect("lock poisoned");
        if let Some(child) = st.child.as_mut() {
            if let Err(err) = child.start_kill() {
                debug!(worker = self.id, error = %err, "failed to kill OCR worker");
            }
        }
    }

    /// Consume the child's stdout until it closes, then run the exit path.
    async fn read_stdout(
        self: Arc<Self>,
        stdout: ChildStdout,
        generation: u64,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(generation, &line),
                Ok(None) => break,
                Err(err) => {
                    warn!(worker = self.id, error = %err, "failed to read OCR worker stdout");
                    break;
                }
            }
        }
        self.handle_exit(generation).await;
    }

    /// Interpret one stdout line from the child.
    fn handle_line(&self, generation: u64, line: &str) {
        let message = match serde_json::from_str::<ChildMessage>(line) {
            Ok(message) => message,
            Err(_) => {
                // Diagnostic noise on stdout; must not stall the stream or
                // touch any pending job.
                info!(worker = self.id, line, "ignoring non-protocol worker output");
                return;
            }
        };

        match message {
            ChildMessage::Ready { ready, error } => {
                let ready_tx = {
                    let mut st = self.state.lock().expect("lock poisoned");
                    if st.generation != generation {
                        return;
                    }
                    let Some(tx) = st.ready_tx.take() else {
                        debug!(worker = self.id, "ignoring duplicate readiness message");
                        return;
                    };
                    if ready {
                        st.ready = true;
                    }
                    tx
                };
                let signal = if ready {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "engine reported unready: {}",
                        error.unwrap_or_else(|| "no reason given".to_owned())
                    ))
                };
                let _ = ready_tx.send(signal);
            }
            ChildMessage::Response {
                id,
                text,
                page_count,
                error,
            } => {
                let completion = {
                    let mut st = self.state.lock().expect("lock poisoned");
                    if st.generation != generation {
                        return;
                    }
                    match st.pending.remove(&id) {
                        Some(tx) => {
                            st.busy = false;
                            Some(tx)
                        }
                        None => None,
                    }
                };
                let Some(tx) = completion else {
                    // Stale reply, most likely for a job that already timed
                    // out. Dropping it keeps the stream aligned.
                    debug!(worker = self.id, request = %id, "dropping response for unknown request id");
                    return;
                };
                let outcome = match error {
                    Some(message) => Err(PoolError::Engine(message)),
                    None => Ok(OcrResult {
                        text: text.unwrap_or_default(),
                        page_count,
                    }),
                };
                let _ = tx.send(outcome);
                let _ = self.events.send(PoolEvent::Free(self.id));
            }
        }
    }

    /// Tear down after the child's stdout closed: reap the exit status, fail
    /// everything outstanding, and tell the supervisor if this was a crash of
    /// a ready worker.
    async fn handle_exit(&self, generation: u64) {
        let child = {
            let mut st = self.state.lock().expect("lock poisoned");
            if st.generation != generation {
                return;
            }
            st.child.take()
        };
        let exit_code = match child {
            Some(mut child) => match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(worker = self.id, error = %err, "failed to reap OCR worker");
                    None
                }
            },
            None => None,
        };

        let (was_ready, pending, ready_tx) = {
            let mut st = self.state.lock().expect("lock poisoned");
            if st.generation != generation {
                return;
            }
            let was_ready = st.ready;
            st.ready = false;
            st.busy = false;
            st.stdin = None;
            (was_ready, std::mem::take(&mut st.pending), st.ready_tx.take())
        };

        if let Some(tx) = ready_tx {
            let _ = tx.send(Err(anyhow!(
                "OCR worker exited with code {exit_code:?} before becoming ready"
            )));
        }
        for (request_id, tx) in pending {
            warn!(worker = self.id, request = %request_id, ?exit_code, "failing job after worker exit");
            let _ = tx.send(Err(PoolError::WorkerCrashed { exit_code }));
        }

        // Exits during the handshake are reported through the readiness
        // signal; the supervisor only needs a crash event once the worker had
        // been serving.
        if was_ready {
            warn!(worker = self.id, ?exit_code, "OCR worker exited");
            let _ = self.events.send(PoolEvent::Crash {
                id: self.id,
                exit_code,
            });
        }
    }
}

/// Forward the child's stderr to our structured log, line by line.
async fn drain_stderr(id: usize, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(worker = id, "{line}");
    }
}
