use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gatehouse::{
    AppState, Config, Logger, Server, ServerError, build_middlewares, build_router, logging,
    metrics, utils,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration before logging so LOG_FORMAT / RUST_LOG apply.
    let config = Config::from_env().map_err(|e| {
        eprintln!("Configuration error: {e}");
        exitcode::CONFIG
    })?;

    logging::init_subscriber(&config);
    info!("Starting gatehouse v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.host,
        port = %config.port,
        rate_limit_rps = config.rate_limit_rps,
        rate_limit_burst = config.rate_limit_burst,
        admin_enabled = config.admin_enabled(),
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    let addr = config.server_addr();
    let state = AppState::new(config, Logger::tracing()).map_err(exit_code)?;

    let chain = build_middlewares(&state);
    let router = build_router(state.clone()).map_err(exit_code)?;
    let server = Server::new(router, chain.as_slice(), state.config.server_options());

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health         - Health check");
    info!("  POST /echo           - Echo a JSON message");
    if state.config.admin_enabled() {
        info!("  GET  /admin/limiter  - Rate limiter status (X-Api-Key)");
    }

    let shutdown = CancellationToken::new();
    utils::cancel_on_signal(shutdown.clone());

    let result = server.run(&addr, shutdown).await;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    result.map_err(exit_code)?;
    info!("Server shutdown complete");
    Ok(())
}

fn exit_code(err: ServerError) -> exitcode::ExitCode {
    error!("{err}");
    match err {
        ServerError::Config(_) => exitcode::CONFIG,
        ServerError::Bind { .. } | ServerError::ShutdownTimeout(_) => exitcode::UNAVAILABLE,
        ServerError::Serve(_) | ServerError::AlreadyStarted => exitcode::SOFTWARE,
    }
}
