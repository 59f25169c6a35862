//! Shared process state (replaces the old dashboard-era `ProxyState`): just
//! the handful of `Arc`s every Ingress task needs, no TUI/stats/session-log
//! plumbing. Cheap to `Clone` — every field is already an `Arc`.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::errorlog::ErrorSample;
use crate::routing::RoutingTable;
use crate::session::SessionCoordinator;

#[derive(Clone)]
pub struct GatewayState {
    pub routes: Arc<RoutingTable>,
    pub sessions: Arc<SessionCoordinator>,
    pub dispatcher: Arc<Dispatcher>,
    /// `None` unless `debug.enabled` and `debug.logDir` are both set.
    pub error_log: Option<mpsc::Sender<ErrorSample>>,
}

impl GatewayState {
    pub fn new(routes: RoutingTable, sessions: Arc<SessionCoordinator>) -> Self {
        Self {
            routes: Arc::new(routes),
            sessions,
            dispatcher: Arc::new(Dispatcher::new()),
            error_log: None,
        }
    }

    pub fn with_error_log(mut self, sender: Option<mpsc::Sender<ErrorSample>>) -> Self {
        self.error_log = sender;
        self
    }
}
