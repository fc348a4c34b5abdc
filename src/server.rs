use crate::app_state::RelayState;
use crate::handler;
use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub fn build_router(state: Arc<RelayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handler::handle_root))
        .route("/.well-known/nostr.json", get(handler::handle_nostr_json))
        .route("/health", get(handler::handle_health))
        .route("/metrics", get(handler::handle_metrics))
        .route("/api/check-whitelist", get(handler::handle_check_whitelist))
        .route(
            "/api/whitelist",
            get(handler::handle_list_whitelist).post(handler::handle_add_member),
        )
        .route(
            "/api/whitelist/{pubkey}",
            axum::routing::put(handler::handle_set_member).delete(handler::handle_remove_member),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves the relay until Ctrl-C or until the state's cancellation token
/// fires, then drains connections for a few seconds.
pub async fn run_server(state: Arc<RelayState>) -> Result<()> {
    let addr = state
        .settings
        .local_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid local_addr {}", state.settings.local_addr))?;

    info!("Listening for websocket connections at: {}", addr);
    info!("Relay URL: {}", state.settings.relay_url);
    info!(
        "Auth requests must name relay {}",
        state.authorizer.relay_url()
    );

    let sweeper = state.spawn_rate_limit_sweeper();
    let handle = axum_server::Handle::new();

    let token = state.cancellation_token.clone();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
            }
            _ = token.cancelled() => {}
        }
        token.cancel();
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let router = build_router(state.clone());
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("Server error")?;

    sweeper.abort();
    info!("Server stopped");
    Ok(())
}
