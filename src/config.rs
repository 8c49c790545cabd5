//! Environment-driven configuration.
//!
//! Everything is read from the process environment (optionally seeded from a
//! `.env` file by `main`), so the same container image can be tuned without a
//! rebuild.

use std::{env, fmt::Display, str::FromStr, time::Duration};

use crate::{pool::PoolConfig, prelude::*};

/// Default number of OCR workers: one per CPU, capped because each child
/// loads a full copy of the recognition models.
const DEFAULT_WORKER_CAP: usize = 4;

/// Full service configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// TCP port for the HTTP server.
    pub port: u16,

    /// Upper bound on uploaded PDF size, in mebibytes.
    pub max_file_size_mb: usize,

    /// Worker pool configuration.
    pub pool: PoolConfig,
}

impl Config {
    /// Build a configuration from the process environment, applying defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let worker_count_default = num_cpus::get().clamp(1, DEFAULT_WORKER_CAP);
        let worker_count: usize = var_or("WORKER_COUNT", worker_count_default)?;
        if worker_count == 0 {
            return Err(anyhow!("WORKER_COUNT must be at least 1"));
        }

        let worker_command = worker_command_from_env()?;

        Ok(Self {
            port: var_or("PORT", 8000)?,
            max_file_size_mb: var_or("MAX_FILE_SIZE_MB", 25)?,
            pool: PoolConfig {
                worker_count,
                queue_capacity: var_or("QUEUE_MAX_SIZE", 50)?,
                ocr_timeout: Duration::from_millis(var_or("OCR_TIMEOUT_MS", 60_000)?),
                ready_timeout: Duration::from_millis(var_or(
                    "WORKER_READY_TIMEOUT",
                    120_000,
                )?),
                worker_command,
            },
        })
    }

    /// The request body limit, in bytes.
    pub fn max_body_bytes(&self) -> usize {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Read the child command line from `OCR_WORKER_CMD`, split on whitespace.
fn worker_command_from_env() -> Result<Vec<String>> {
    let raw = env::var("OCR_WORKER_CMD")
        .unwrap_or_else(|_| "python3 ocr_worker.py".to_owned());
    let command: Vec<String> = raw.split_whitespace().map(str::to_owned).collect();
    if command.is_empty() {
        return Err(anyhow!("OCR_WORKER_CMD must name a program"));
    }
    Ok(command)
}

/// Read an environment variable, falling back to `default` when unset.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid {}={:?}: {}", name, raw, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow!("cannot read {}: {}", name, err)),
    }
}
