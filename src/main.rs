//! Signal gateway for Zentinel
//!
//! Enforces identification signals on protected API routes in front of an
//! origin application.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request as AxumRequest, State};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router;
use clap::Parser;
use http::{Request, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zentinel_agent_signal_gateway::{ClientAddr, EdgeGateway, GatewayConfig, HttpUpstream};

#[derive(Parser, Debug)]
#[command(name = "zentinel-agent-signal-gateway")]
#[command(author, version, about = "Signal-enforcing edge gateway for Zentinel")]
struct Args {
    /// Address to listen on (overrides `server.listen`)
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    let Some(path) = path else {
        return Ok(GatewayConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(config)
}

struct AppState {
    gateway: EdgeGateway,
    max_body_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let mut config = load_config(args.config.as_ref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    config.validate()?;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(30))
        .build()?;
    let origin_url = config.server.origin_url.clone().unwrap_or_default();
    let origin = Arc::new(HttpUpstream::with_base("origin", client.clone(), &origin_url)?);
    let backend = Arc::new(HttpUpstream::new("identification", client));

    let gateway = EdgeGateway::new(&config, origin, backend)?;
    let state = Arc::new(AppState {
        gateway,
        max_body_bytes: config.server.max_body_bytes,
    });

    let app = Router::new().fallback(handle).with_state(state);

    let addr: SocketAddr = config.server.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, origin = %origin_url, "Signal gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Signal gateway stopped");
    Ok(())
}

async fn handle(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: AxumRequest,
) -> AxumResponse {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, client = %peer, "Rejecting request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let mut request = Request::from_parts(parts, body);
    request.extensions_mut().insert(ClientAddr(peer.ip()));

    state.gateway.handle(request).await.map(Body::from)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
