//! Library surface for the gateway binary and its integration tests.
//! `main.rs` is a thin wrapper around [`run`]; `tests/` exercises the real
//! pipeline end to end against mocked upstream providers.

pub mod cli;
pub mod compat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod errorlog;
pub mod ingress;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod session;
pub mod state;
pub mod transform;

use std::time::Duration;

use cli::Dispatch;
use routing::build_routing_table;
use session::SessionCoordinator;
use state::GatewayState;

pub async fn run() -> anyhow::Result<()> {
    let config = match cli::dispatch() {
        Dispatch::Exit(code) => std::process::exit(code),
        Dispatch::Serve(config) => config,
    };

    let _logging_guard = logging::init(&config);

    let routing_table = build_routing_table(&config.providers, &config.routing.routes)
        .map_err(|e| anyhow::anyhow!("failed to build routing table: {e}"))?;
    tracing::info!(routes = routing_table.route_names().len(), "routing table materialized");

    let sessions = SessionCoordinator::new(config.routing.loose_ordering, Duration::from_secs(600));
    let error_log = errorlog::spawn(config.debug.enabled, config.debug.log_dir.clone());
    let state = GatewayState::new(routing_table, sessions.clone()).with_error_log(error_log);

    let gc_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            gc_sessions.gc_idle();
        }
    });

    server::serve(config.server.bind_addr, state).await
}
