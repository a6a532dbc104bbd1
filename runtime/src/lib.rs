//! varasto runtime - zero-boilerplate startup for a buffer stage
//!
//! Provides [`run()`] for the common case and [`RuntimeBuilder`] when the
//! buffer strategy or shutdown behaviour needs overriding in code.
//!
//! # Quick start
//!
//! ```ignore
//! use varasto_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     varasto_runtime::run(|stage| async move {
//!         let (tx, rx) = tokio::sync::mpsc::channel(1);
//!         stage.start_receiving(rx)?;
//!         // hand `tx`, `stage.message_chan()` and `stage.response_chan()`
//!         // to your connectors
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use varasto_buffer::{BufferStage, BufferStrategy, Config, LogFormat, Metrics};

/// Run a buffer stage with settings from the environment.
///
/// Loads configuration from `VARASTO_*` variables, initialises tracing and
/// metrics, builds the configured buffer, calls your closure to wire the
/// stage, then waits for SIGINT/SIGTERM (or for the stage to close on its
/// own) and shuts down gracefully.
pub async fn run<F, Fut>(configure: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<BufferStage>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    RuntimeBuilder::new().configure(configure).await
}

/// Power-user builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .buffer(BufferStrategy::mmap("/var/lib/varasto", 64 * 1024 * 1024))
///     .shutdown_timeout(Duration::from_secs(30))
///     .configure(|stage| async move { Ok(()) })
///     .await
/// ```
pub struct RuntimeBuilder {
    strategy: Option<BufferStrategy>,
    shutdown_timeout: Option<Duration>,
    tracing: bool,
}

impl RuntimeBuilder {
    /// Create a new builder; everything not overridden comes from the environment.
    pub fn new() -> Self {
        Self {
            strategy: None,
            shutdown_timeout: None,
            tracing: true,
        }
    }

    /// Override the buffer strategy.
    ///
    /// Default: selected by `VARASTO_BUFFER_TYPE` and friends.
    pub fn buffer(mut self, strategy: BufferStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Override how long shutdown waits for the stage to close.
    ///
    /// Default: `VARASTO_SHUTDOWN_TIMEOUT_MS`, or 5 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Skip installing the global tracing subscriber.
    ///
    /// For hosts that already set up their own.
    pub fn without_tracing(mut self) -> Self {
        self.tracing = false;
        self
    }

    /// Build the stage, hand it to `configure`, and run until shutdown.
    ///
    /// This is the terminal method.
    pub async fn configure<F, Fut>(self, configure: F) -> anyhow::Result<()>
    where
        F: FnOnce(Arc<BufferStage>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        // ── 1. Load config from env ──────────────────────────────
        let config = Config::from_env()?;

        // ── 2. Init tracing ──────────────────────────────────────
        if self.tracing {
            init_tracing(&config);
        }

        let strategy = self.strategy.unwrap_or_else(|| config.buffer.strategy());
        let shutdown_timeout = self
            .shutdown_timeout
            .unwrap_or_else(|| config.shutdown_timeout());
        info!(
            strategy = strategy.name(),
            channel_capacity = config.channel_capacity,
            shutdown_timeout_ms = shutdown_timeout.as_millis() as u64,
            "Starting varasto"
        );

        // ── 3. Init metrics ──────────────────────────────────────
        Metrics::init()?;

        // ── 4. Build the buffer (runs recovery for mmap) ─────────
        let buffer = strategy.build()?;
        let stage = Arc::new(BufferStage::with_capacity(buffer, config.channel_capacity));

        // ── 5. User wires the stage ──────────────────────────────
        configure(Arc::clone(&stage)).await?;

        // ── 6. Wait for a signal or for the stage to end ─────────
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = stage.closed() => info!("Buffer stage closed, shutting down"),
        }

        // ── 7. Shutdown ──────────────────────────────────────────
        stage.close_async();
        if let Err(e) = stage.wait_for_close(shutdown_timeout).await {
            warn!(error = %e, "Buffer stage did not close in time");
        }

        if let Some(fatal) = stage.fatal_error() {
            anyhow::bail!("buffer stage failed: {fatal}");
        }

        info!(backlog = stage.backlog(), "varasto shutdown complete");
        Ok(())
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
///
/// `RUST_LOG` wins over `log_level`. Does nothing if a global subscriber is
/// already installed.
pub fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if installed.is_err() {
        warn!("Tracing subscriber already installed, keeping it");
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
