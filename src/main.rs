mod cli;

use crate::cli::Args;
use clap::Parser;
use derive_more::{Display, Error};
use exn::ResultExt;
use memserve_cache::{FileCache, Reconciler, RefreshLoop};
use memserve_config::Config;
use memserve_server::{Handler, RateLimiter, Server};
use memserve_storage::BackendHandle;
use memserve_storage::backend::{FilteredBackend, LocalBackend};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Reasons the process refuses to start (or stops serving).
#[derive(Debug, Display, Error)]
enum StartupError {
    #[display("could not load configuration")]
    Config,
    #[display("cannot serve {}", _0.display())]
    Root(#[error(not(source))] PathBuf),
    #[display("initial load of the served directory failed")]
    InitialLoad,
    #[display("HTTP server failed")]
    Server,
}

type Result<T> = std::result::Result<T, exn::Exn<StartupError>>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Fatal error");
            ExitCode::FAILURE
        },
    }
}

/// `RUST_LOG` wins when set; otherwise `-v` flags pick the level.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "memserve=debug,memserve_cache=debug,memserve_server=debug,memserve_storage=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref(), &args.overrides()).or_raise(|| StartupError::Config)?;

    let root = std::fs::canonicalize(&config.root).or_raise(|| StartupError::Root(config.root.clone()))?;
    let local = LocalBackend::new("local", &root).or_raise(|| StartupError::Root(root.clone()))?;
    let ignore = config.ignore_pattern().or_raise(|| StartupError::Config)?;
    let backend: BackendHandle = match ignore {
        Some(pattern) => {
            tracing::info!(pattern = pattern.as_str(), "Ignoring matching paths");
            Arc::new(FilteredBackend::new(Arc::new(local), pattern))
        },
        None => Arc::new(local),
    };

    let cache = Arc::new(FileCache::new());
    let reconciler = Arc::new(Reconciler::new(backend, cache.clone()).with_strategy(config.strategy));
    tracing::info!(root = %root.display(), "Loading served directory");
    // Never serve from an empty or half-built cache.
    reconciler.reconcile().await.or_raise(|| StartupError::InitialLoad)?;

    let shutdown = CancellationToken::new();
    let refresh = match RefreshLoop::new(reconciler, config.refresh) {
        Some(refresh) => Some(refresh.spawn(shutdown.clone())),
        None => {
            tracing::info!("Periodic refresh disabled; serving the initial load until restart");
            None
        },
    };

    let mut handler = Handler::new(cache);
    if let Some(interval) = config.rate_limit_interval() {
        tracing::info!(?interval, "Rate limiting clients");
        handler = handler.with_rate_limiter(RateLimiter::new(interval));
    }
    let server = Server::bind(config.listen)
        .await
        .or_raise(|| StartupError::Server)?
        .with_request_timeout(config.request_timeout());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Interrupted; shutting down");
                    shutdown.cancel();
                },
                Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl-C; stop the process by other means"),
            }
        }
    });

    let served = server.serve(Arc::new(handler), shutdown.clone()).await;
    shutdown.cancel();
    if let Some(refresh) = refresh
        && let Err(e) = refresh.await
    {
        tracing::warn!(error = %e, "Refresh task ended abnormally");
    }
    served.or_raise(|| StartupError::Server)
}
