//! swindlr
//!
//! HTTP/HTTPS reverse-proxy load balancer.
//!
//! This binary:
//! - Loads layered configuration and validates TLS material
//! - Builds the server pool with the configured selection strategy
//! - Runs periodic TCP health sweeps and a health-event sink
//! - Optionally exposes the dynamic pool-management API
//! - Serves the load-balancing pipeline, with optional TLS termination

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use swindlr::cache::{self, ResponseCache};
use swindlr::config::Config;
use swindlr::proxy::{Algorithm, AppState, ServerPool};
use swindlr::server::{self, Server};
use swindlr::{api, health};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        port = config.port,
        strategy = ?config.load_balancer.strategy,
        sticky_sessions = config.use_sticky_sessions,
        cache = config.use_cache,
        dynamic = config.use_dynamic,
        "Configuration loaded"
    );

    let pool = Arc::new(ServerPool::new(
        Algorithm::from(config.load_balancer.strategy),
        config.rate_limiting,
        config.use_sticky_sessions,
    ));
    for url in &config.backends {
        pool.add_url(url)
            .with_context(|| format!("Invalid backend url {url}"))?;
    }

    let response_cache = Arc::new(ResponseCache::new(cache::DEFAULT_TTL));
    if config.use_cache {
        tokio::spawn(cache::run_janitor(
            Arc::clone(&response_cache),
            cache::JANITOR_INTERVAL,
        ));
    }

    let (events_tx, events_rx) = health::channel();
    tokio::spawn(health::run(Arc::clone(&pool), events_tx));
    tokio::spawn(health::run_sink(events_rx));

    if config.use_dynamic {
        let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
        let api_pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(err) = api::serve(api_addr, api_pool).await {
                error!(error = %err, "Admin API terminated");
            }
        });
        info!("Dynamic server pool management is enabled");
    } else {
        info!("Dynamic server pool management is disabled");
    }

    let tls = if config.use_ssl {
        Some(server::tls_acceptor(
            config.ssl_cert_file.as_ref(),
            config.ssl_key_file.as_ref(),
        )?)
    } else {
        None
    };

    let state = Arc::new(AppState {
        pool,
        cache: response_cache,
        use_cache: config.use_cache,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let proxy = Server::bind(addr, tls, state).await?;

    info!(port = config.port, https = config.use_ssl, "Load balancer started");
    proxy.run().await
}
