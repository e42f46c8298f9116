use clap::Parser;
use kiro_gateway::config::{default_config_dir, GatewayConfig};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "kiro-gateway",
    about = "Claude-compatible HTTP gateway proxying to the Kiro/CodeWhisperer backend",
    version
)]
struct Args {
    /// Directory holding config.toml, credential files, and the JSON
    /// account pool (when not overridden).
    #[arg(long, env = "CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,

    /// HTTP server port.
    #[arg(long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Shared secret required on every /v1/* request.
    #[arg(long, env = "REQUIRED_API_KEY")]
    api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log: String,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = kiro_gateway::logging::setup_logging(&args.log, args.log_file.as_deref());

    let config_dir = args.config_dir.unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir).ok();

    let config = match GatewayConfig::new(config_dir, args.port, args.api_key) {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let host = config.host.clone();
    let port = config.server_port;

    let state = kiro_gateway::build_app_state(config).await?;
    let app = kiro_gateway::router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "kiro-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
