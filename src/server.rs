//! HTTP server wiring: builds the axum [`Router`] and drives it to
//! completion. Grounded on `proxy/server.rs`'s `Router::new()
//! .route(...).with_state(state)` / `TcpListener::bind` / `axum::serve(...)
//! .with_graceful_shutdown(...)` shape, stripped down to the three routes
//! this gateway actually exposes — no dashboard, no cortex, no embeddings.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::ingress;
use crate::state::GatewayState;

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/messages", post(ingress::handle_messages))
        .route("/healthz", get(healthz))
        .route("/routes", get(list_routes))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Read-only routing table introspection: virtual route -> bindings, with
/// live per-credential health counts. Never serializes a raw credential.
async fn list_routes(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.routes.describe())
}

pub async fn serve(bind_addr: SocketAddr, state: GatewayState) -> Result<()> {
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind to address")?;

    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::providers::{
        ApiKeySpec, AuthMethod, AuthenticationConfig, CredentialsConfig, DialectTag,
        KeyRotationConfig, ProviderConfig,
    };
    use crate::config::routing::{RouteBindingSpec, RouteConfig};
    use crate::routing::build_routing_table;
    use crate::session::SessionCoordinator;
    use std::collections::HashMap;
    use std::time::Duration;

    fn single_route_state() -> GatewayState {
        let mut providers = HashMap::new();
        providers.insert(
            "p".to_string(),
            ProviderConfig {
                provider_type: DialectTag::Openai,
                endpoint: "http://localhost".to_string(),
                authentication: AuthenticationConfig {
                    method: AuthMethod::Bearer,
                    credentials: CredentialsConfig { api_key: ApiKeySpec::Single("k".to_string()) },
                    header_name: None,
                },
                key_rotation: KeyRotationConfig::default(),
                compatibility_adapter: None,
                settings: HashMap::new(),
            },
        );
        let mut routes = HashMap::new();
        routes.insert(
            "default".to_string(),
            RouteConfig::Single(RouteBindingSpec { provider: "p".to_string(), model: "m".to_string(), priority: None }),
        );
        let table = build_routing_table(&providers, &routes).unwrap();
        GatewayState::new(table, SessionCoordinator::new(false, Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn list_routes_reports_configured_bindings() {
        let state = single_route_state();
        let response = list_routes(State(state.clone())).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        assert_eq!(state.routes.describe().len(), 1);
    }

    #[test]
    fn build_router_does_not_panic() {
        let _ = build_router(single_route_state());
    }
}
