use std::process::ExitCode;

use clap::Parser;
use futures::stream::StreamExt;
use signal_hook_tokio::Signals;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use storage_sage::audit::AuditStore;
use storage_sage::cli::Cli;
use storage_sage::config::Config;
use storage_sage::control::{self, AppState};
use storage_sage::scanner::ProtectedPaths;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };
    if cli.dry_run {
        config.dry_run = true;
    }

    let protected = ProtectedPaths {
        audit_db: config.audit_db_path.clone(),
        config_file: config.config_path.clone(),
        executable: std::env::current_exe().unwrap_or_default(),
        pid_file: None,
    };

    let audit = match AuditStore::open(&config.audit_db_path, cli.reinitialize_audit_store) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("audit store unavailable: {e}");
            return ExitCode::from(2);
        }
    };

    let state = AppState::new(config, audit, protected);

    if cli.once {
        let cancel = CancellationToken::new();
        let result = control::run_cycle(state, cancel).await;
        tracing::info!(
            mode = result.mode,
            deleted = result.files_deleted,
            bytes_freed = result.bytes_freed,
            errors = result.error_count,
            "single cycle completed"
        );
        return ExitCode::SUCCESS;
    }

    let metrics_addr = state.config.metrics_addr.clone();
    let cancel = CancellationToken::new();

    let ticker_state = state.clone();
    let ticker_cancel = cancel.clone();
    let ticker = tokio::spawn(async move {
        control::run_ticker(ticker_state, ticker_cancel).await;
    });

    let app = control::router(state).layer(TraceLayer::new_for_http());

    let addr: std::net::SocketAddr = match metrics_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("invalid metrics_addr {metrics_addr}: {e}");
            return ExitCode::from(1);
        }
    };
    tracing::info!("storage-sage control surface listening on {}", addr);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let _ = axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await;
    });

    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!(error = %e, "signal handling failed");
        return ExitCode::from(3);
    }

    cancel.cancel();
    let _ = ticker.await;
    let _ = server.await;

    ExitCode::SUCCESS
}

/// Wait for SIGINT or SIGTERM. SIGHUP is left to its default disposition
/// (terminate) rather than intercepted with no reload behavior to back it.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut signals = Signals::new([signal_hook::consts::SIGTERM])?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        Some(_signal) = signals.next() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}


