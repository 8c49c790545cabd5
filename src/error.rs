//! The failure modes a job can hit between upload and OCR result.
//!
//! Everything here is scoped to a single request except
//! [`PoolError::NoWorkerStarted`], which is fatal to the whole process: if no
//! engine ever loads its models, there is nothing to serve.

use thiserror::Error;

/// Errors surfaced by the worker pool and the OCR pipeline.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker was busy or down and the admission queue was full.
    #[error("worker pool is at capacity")]
    Overloaded,

    /// The job expired while waiting in the admission queue.
    #[error("no worker became free within the job budget")]
    QueuedTooLong,

    /// The engine did not answer within the job budget. The child process is
    /// left running; its eventual reply is dropped as an unknown id.
    #[error("OCR engine did not respond in time")]
    OcrTimeout,

    /// The child process exited while the job was in flight.
    #[error("OCR worker exited unexpectedly (exit code {exit_code:?})")]
    WorkerCrashed { exit_code: Option<i32> },

    /// The engine processed the job and reported a failure of its own.
    #[error("OCR engine failed: {0}")]
    Engine(String),

    /// The pool was torn down while the job was waiting.
    #[error("no OCR worker is available")]
    PoolNotReady,

    /// No worker reached readiness during startup.
    #[error("no OCR worker reached readiness during startup")]
    NoWorkerStarted,

    /// The PDF could not be staged on disk for the engine.
    #[error("failed to stage PDF for OCR")]
    Io(#[from] std::io::Error),
}
