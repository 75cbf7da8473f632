//! HTTP surface of the relay: REST ingestion and queries, SSE, WebSocket
//! and poll delivery.

pub mod error;
pub mod handlers;
pub mod live;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use relaycore::Relay;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use url::Url;

pub use error::ApiError;

/// Links handed to the bot for opening the Mini App.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MiniAppLinks {
    /// `<static>/index.html?api=<api>&bot=<username>`
    pub url: String,
    pub api: String,
    pub static_url: String,
}

impl MiniAppLinks {
    pub fn new(static_url: &str, api: &str, bot_username: Option<&str>) -> anyhow::Result<Self> {
        let static_url = static_url.trim_end_matches('/').to_string();
        let mut url = Url::parse(&format!("{}/index.html", static_url))
            .with_context(|| format!("Invalid public static URL: {}", static_url))?;
        url.query_pairs_mut()
            .append_pair("api", api)
            .append_pair("bot", bot_username.unwrap_or_default());

        Ok(Self {
            url: url.into(),
            api: api.to_string(),
            static_url,
        })
    }
}

/// Shared state for every endpoint
pub struct AppState {
    pub relay: Arc<Relay>,
    pub links: MiniAppLinks,
    /// Reported by `/health`: "live" with a bot token, "offline" without
    pub mode: &'static str,
    /// Cancelled on shutdown; ends long-lived SSE and WebSocket streams
    pub shutdown: CancellationToken,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/miniapp-url", get(handlers::miniapp_url))
        .route("/webapp-data", post(handlers::webapp_data))
        .route("/api/data", get(handlers::dump).delete(handlers::clear_all))
        .route(
            "/api/data/{category}",
            get(handlers::get_category)
                .post(handlers::ingest_category)
                .delete(handlers::clear_category),
        )
        .route("/api/stats", get(handlers::stats))
        .route("/api/users/active", get(handlers::active_users))
        .route("/api/users/{user_id}/register", post(handlers::register))
        .route("/api/users/{user_id}/heartbeat", post(handlers::heartbeat))
        .route(
            "/api/users/{user_id}/snapshot",
            get(handlers::get_snapshot).post(handlers::post_snapshot),
        )
        .route("/events", get(live::sse))
        .route("/ws", get(live::ws))
        .route("/poll", get(handlers::poll))
        .layer(cors)
        .with_state(state)
}

/// Serves until `state.shutdown` is cancelled.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Relay listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miniapp_url_is_encoded() {
        let links = MiniAppLinks::new("https://cdn.example.org/app/", "https://abc.trycloudflare.com", Some("relay_bot")).unwrap();
        assert_eq!(
            links.url,
            "https://cdn.example.org/app/index.html?api=https%3A%2F%2Fabc.trycloudflare.com&bot=relay_bot"
        );
        assert_eq!(links.static_url, "https://cdn.example.org/app");
    }

    #[test]
    fn test_invalid_static_url_is_rejected() {
        assert!(MiniAppLinks::new("not a url", "http://localhost:8080", None).is_err());
    }
}
