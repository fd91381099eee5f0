//! # parleyd
//!
//! Parley server binary — wires the registry, router, and WebSocket
//! endpoint together and serves until interrupted.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_server::auth::StaticTokenVerifier;
use parley_server::config::ServerConfig;
use parley_server::routing::handlers::{ChannelDomainSink, DomainForwardHandler, register_defaults};
use parley_server::routing::rate_limit::{FixedWindowLimiter, RateLimitMiddleware};
use parley_server::routing::router::MessageRouter;
use parley_server::server::ParleyServer;

/// Parley real-time messaging server.
#[derive(Parser, Debug)]
#[command(name = "parleyd", about = "Parley real-time messaging server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "9600")]
    port: u16,

    /// Heartbeat interval in seconds.
    #[arg(long)]
    heartbeat_interval_secs: Option<u64>,

    /// Inactivity threshold before eviction, in seconds.
    #[arg(long)]
    stale_threshold_secs: Option<u64>,

    /// Close an identity's older connection when a new one arrives.
    #[arg(long)]
    single_session: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ServerConfig {
        host: cli.host,
        port: cli.port,
        ..ServerConfig::default()
    };
    if let Some(v) = cli.heartbeat_interval_secs {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = cli.stale_threshold_secs {
        config.stale_threshold_secs = v;
    }
    if cli.single_session {
        config.single_session_per_identity = true;
    }
    config.apply_env_overrides();
    config.validate()?;

    let metrics_handle = parley_server::metrics::install_recorder();

    let mut router = MessageRouter::new();
    router.layer(RateLimitMiddleware::new(
        FixedWindowLimiter::new(
            std::time::Duration::from_secs(config.rate_limit_window_secs),
            config.rate_limit_max,
        ),
        [],
    ));
    register_defaults(&mut router);
    // Domain traffic hands off through a bounded channel; the consumer
    // below stands in for the real domain dispatcher.
    router.register("chat.message.send", DomainForwardHandler);
    let (domain_sink, mut domain_rx) = ChannelDomainSink::new(1024);
    let domain_worker = tokio::spawn(async move {
        while let Some(submission) = domain_rx.recv().await {
            info!(
                identity = %submission.identity,
                kind = submission.envelope.kind(),
                "domain submission received"
            );
        }
    });

    let server = ParleyServer::new(
        config,
        router,
        Arc::new(StaticTokenVerifier::accept_any()),
        Arc::new(domain_sink),
    )
    .with_metrics(metrics_handle);

    let addr = server.listen().await?;
    info!(%addr, "parleyd ready");

    let coordinator = server.shutdown_coordinator().clone();
    let _signal = coordinator.trigger_on_ctrl_c();
    let token = coordinator.token();
    token.cancelled().await;

    server.stop().await;
    domain_worker.abort();
    Ok(())
}
