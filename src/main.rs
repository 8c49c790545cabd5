use std::{str::FromStr, sync::Arc};

use clap::Parser;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt::format::FmtSpan};

use ocr_pool::{config::Config, pool::Pool, prelude::*, server};

/// Serve OCR for uploaded PDFs from a pool of engine processes.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - PORT: TCP port to listen on (default 8000).
  - MAX_FILE_SIZE_MB: Upload size limit (default 25).
  - OCR_TIMEOUT_MS: Per-job and queue-wait budget (default 60000).
  - WORKER_READY_TIMEOUT: Engine model-load budget in ms (default 120000).
  - QUEUE_MAX_SIZE: Admission queue capacity (default 50).
  - WORKER_COUNT: Engine processes to run (default min(CPUs, 4)).
  - OCR_WORKER_CMD: Engine command line (default "python3 ocr_worker.py").

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Port to listen on, overriding $PORT.
    #[clap(short = 'p', long)]
    port: Option<u16>,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main")]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let mut config = Config::from_env()?;
    if let Some(port) = opts.port {
        config.port = port;
    }

    // Refuse to serve unless at least one engine loaded its models.
    let pool = Arc::new(
        Pool::init(config.pool.clone())
            .await
            .context("failed to start the OCR worker pool")?,
    );

    let result = server::run_server(&config, pool.clone()).await;
    pool.shutdown();
    result
}
