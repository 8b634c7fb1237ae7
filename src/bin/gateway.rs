//! Gateway process entry point: loads config, wires the data-plane
//! components via `AppState`, starts the background tasks (event
//! publisher dispatch is started inside `AppState::new`; the health
//! monitor tick loop and rate-limiter sweeper are started here), and
//! serves the ingress handler behind the shared middleware stack.

use std::net::SocketAddr;

use gateway_core::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    tracing::info!(
        gateway = %config.gateway.id,
        bind = %config.gateway.bind_address,
        routes = config.routes.len(),
        filters = config.filters.len(),
        rate_limits = config.rate_limits.len(),
        "starting gateway"
    );

    let state = AppState::new(config.clone()).await?;

    // Background tasks with their own lifetime, independent of any one
    // request (§5): the health monitor's periodic liveness loop and the
    // rate limiter's idle-state sweeper.
    tokio::spawn(state.health_monitor().clone().run());
    state.rate_limiter().clone().start_sweeper().await;

    let app = Router::new()
        .fallback(gateway_handle)
        .with_state(state);

    let server = Server::new(config);
    let addr: SocketAddr = format!("0.0.0.0:{}", server.config().service.port).parse()?;
    tracing::info!(%addr, "gateway listening");

    server.serve(app).await?;

    Ok(())
}
