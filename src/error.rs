//! Gateway error taxonomy and HTTP status mapping

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;

/// Distinct error classes produced by the pipeline. Never collapsed into a single
/// catch-all: callers match on variant to decide retry/propagation behavior.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request malformed: {0}")]
    Validation(String),

    #[error("no route binding for virtual route '{0}'")]
    Routing(String),

    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("protocol leak detected at {boundary}: {detail}")]
    ProtocolLeak { boundary: String, detail: String },

    #[error("no available provider for route '{0}'")]
    NoAvailableProvider(String),

    #[error("no available credential for provider '{0}'")]
    NoAvailableCredential(String),

    #[error("upstream transient error after {attempts} attempt(s): {detail}")]
    UpstreamTransient { attempts: u32, detail: String },

    #[error("upstream client error {status}: {detail}")]
    UpstreamClient { status: u16, detail: String },

    #[error("upstream server error {status} past retry budget: {detail}")]
    UpstreamServer { status: u16, detail: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl GatewayError {
    /// Short machine-readable tag used in structured log lines and the
    /// diagnostic body of error responses.
    pub fn classification(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::Routing(_) => "routing",
            GatewayError::Config(_) => "config",
            GatewayError::ProtocolLeak { .. } => "protocol_leak",
            GatewayError::NoAvailableProvider(_) => "no_available_provider",
            GatewayError::NoAvailableCredential(_) => "no_available_credential",
            GatewayError::UpstreamTransient { .. } => "upstream_transient",
            GatewayError::UpstreamClient { .. } => "upstream_client",
            GatewayError::UpstreamServer { .. } => "upstream_server",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Timeout(_) => "timeout",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Routing(_) => StatusCode::NOT_FOUND,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ProtocolLeak { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NoAvailableProvider(_) | GatewayError::NoAvailableCredential(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTransient { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamClient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::UpstreamServer { .. } => StatusCode::BAD_GATEWAY,
            // 499 is nginx's non-standard "client closed request" convention; there is
            // no StatusCode constant for it in the http crate.
            GatewayError::Cancelled => StatusCode::from_u16(499).unwrap(),
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let classification = self.classification();
        let message = self.to_string();

        if status.is_server_error() || status.as_u16() == 499 {
            tracing::error!(classification, %status, "{}", message);
        } else {
            tracing::warn!(classification, %status, "{}", message);
        }

        let body = serde_json::json!({
            "error": {
                "type": classification,
                "message": message,
            }
        });

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}
