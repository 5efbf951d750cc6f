//! PTY session broker binary. Binds a WebSocket server exposing the event
//! vocabulary; no SPA, no static assets.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use termhub_core::config;
use termhub_core::session::SessionRegistry;
use termhub_core::workspace::Workspace;
use termhub_server::{build_router, AppState};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "termhub-server", about = "PTY session broker")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 5182)]
    port: u16,

    /// Disables TLS termination expectations and promotes Anonymous write checks to
    /// User (open_mode), matching the first rule of the permission table. Intended
    /// for local/dev use only.
    #[arg(long)]
    unsecure: bool,

    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cfg = config::ensure_loaded_with_open_mode(Some(cli.unsecure));

    // Fail fast on a broken environment: spawn the configured shell once before
    // binding the listener (exit code 2 on failure).
    let self_check_rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build tokio runtime");
            return ExitCode::from(1);
        }
    };
    let self_check = self_check_rt.block_on(async {
        match termhub_core::pty::spawn_pty(None, 80, 24) {
            Ok((handle, _rx)) => {
                handle.close(std::time::Duration::from_millis(50)).await;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "pty self-check failed");
                false
            }
        }
    });
    if !self_check {
        return ExitCode::from(2);
    }

    let addr: SocketAddr = match format!("{}:{}", cli.host, cli.port).parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "invalid host/port");
            return ExitCode::from(1);
        }
    };

    let rt = self_check_rt;
    let result = rt.block_on(run_server(addr, cfg));
    match result {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "server exited with error");
            ExitCode::from(1)
        }
    }
}

async fn run_server(addr: SocketAddr, cfg: &'static termhub_core::config::BrokerConfig) -> std::io::Result<()> {
    let registry = SessionRegistry::new();
    registry.spawn_eviction_sweep(cfg.retention_window, cfg.eviction_sweep_interval);
    let workspace = std::sync::Arc::new(Workspace::new());
    let connections = termhub_server::connection::ConnectionRegistry::new();

    let state = AppState {
        registry: registry.clone(),
        workspace,
        connections,
        cfg,
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => return Err(e),
    };
    tracing::info!(%addr, "listening");
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let result = tokio::select! {
        result = axum::serve(listener, app) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            Ok(())
        }
    };
    shutdown_sessions(&registry, cfg).await;
    result
}

/// Bounded-drain shutdown: close every live session gracefully, with the same
/// SIGHUP/grace-period/SIGKILL path a client-initiated `close_terminal` takes, then
/// return once every session has transitioned to a Closed* state or the drain
/// deadline elapses, whichever comes first.
async fn shutdown_sessions(registry: &SessionRegistry, cfg: &termhub_core::config::BrokerConfig) {
    let ids = registry.list_all();
    if ids.is_empty() {
        return;
    }
    tracing::info!(count = ids.len(), "draining sessions before shutdown");
    let drain = async {
        for id in ids {
            if let Some(session) = registry.get(id) {
                let _ = session.close(None, cfg).await;
            }
        }
    };
    if tokio::time::timeout(cfg.close_grace_period * 2, drain)
        .await
        .is_err()
    {
        tracing::warn!("shutdown drain deadline exceeded, forcing exit");
    }
}
