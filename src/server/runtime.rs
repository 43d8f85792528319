//! Server runtime: bind, background sweepers, and coordinated shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use axum_server::Handle;

use crate::server::routes;
use crate::server::state::AppState;

/// Run the HTTP server until the lifecycle controller signals shutdown or
/// the process receives ctrl-c. `on_bound` fires once with the actual
/// listen address, which matters when the configured port is 0.
pub async fn serve(state: AppState, on_bound: impl FnOnce(SocketAddr)) -> anyhow::Result<()> {
    let ip = if state.config.public_mode {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    let addr = SocketAddr::new(ip, state.config.port);

    let handle = Handle::new();
    tokio::spawn(await_shutdown(state.clone(), handle.clone()));
    tokio::spawn(run_sweepers(state.clone()));

    let server = tokio::spawn(
        axum_server::bind(addr)
            .handle(handle.clone())
            .serve(routes::router(state).into_make_service()),
    );

    match handle.listening().await {
        Some(bound) => {
            tracing::info!(%bound, "listening");
            on_bound(bound);
        }
        None => anyhow::bail!("failed to bind {addr}"),
    }

    server
        .await
        .context("server task failed")?
        .context("server error")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn await_shutdown(state: AppState, handle: Handle) {
    let token = state.lifecycle.shutdown_token();
    tokio::select! {
        _ = token.cancelled() => {
            tracing::info!("shutdown requested");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            } else {
                tracing::info!("interrupt received");
            }
            state.lifecycle.request_shutdown();
        }
    }
    handle.graceful_shutdown(Some(Duration::from_secs(
        state.config.limits.shutdown_grace_secs,
    )));
}

/// Periodic maintenance: reap idle transfers and revoke poll clients that
/// stopped fetching, leaving their rooms on the way out.
async fn run_sweepers(state: AppState) {
    let interval = Duration::from_secs(state.config.limits.poll_interval_secs);
    let idle_timeout = Duration::from_secs(state.config.limits.idle_timeout_secs);
    let max_poll_idle = state.poll_max_idle();
    let token = state.lifecycle.shutdown_token();

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }

        state.engine.sweep(idle_timeout).await;

        for (topic, id, name) in state.bus.sweep_stale_pollers(max_poll_idle) {
            tracing::debug!(%topic, %id, "revoked stale poll client");
            if let Some(name) = name {
                state.rooms.leave(&topic, &name);
            }
        }
    }
}
