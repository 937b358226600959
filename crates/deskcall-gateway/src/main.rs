use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use deskcall_gateway::ws::ws_handler;
use deskcall_gateway::{RegistryConfig, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "deskcall-gateway", about = "Support chat and call signaling gateway")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DESKCALL_BIND", default_value = "127.0.0.1:8787")]
    bind: SocketAddr,

    /// Seconds a disconnected user keeps their session before it is destroyed.
    #[arg(long, env = "DESKCALL_GRACE_SECS", default_value_t = 30)]
    grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deskcall_common::init_tracing_with_default("deskcall_gateway=info,tower_http=warn");
    let args = Args::parse();

    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        grace: Duration::from_secs(args.grace_secs),
    }));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!("gateway listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("serving")?;
    Ok(())
}
