//! Dispatch stage (section 4.8): opens the upstream connection using one
//! credential from the binding's pool, classifies the terminal outcome, and
//! retries per the policy table. The `reqwest::Client` here is the single
//! process-wide instance built once at startup, mirroring the reference
//! proxy's one-client-in-state pattern (`proxy/server.rs::start_proxy`).

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::routing::credential::CredentialHandle;
use crate::routing::PipelineBinding;

const BASE_BACKOFF_MS: u64 = 200;
const TRANSPORT_BACKOFF_MULTIPLIER: u32 = 3;
const OTHER_BACKOFF_MULTIPLIER: u32 = 2;
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Success,
    Auth,
    RateLimited,
    Server,
    ClientOther,
}

fn classify_status(status: StatusCode) -> Classification {
    if status.is_success() {
        Classification::Success
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Classification::Auth
    } else if status.as_u16() == 429 {
        Classification::RateLimited
    } else if status.is_server_error() {
        Classification::Server
    } else {
        Classification::ClientOther
    }
}

/// One attempt's result, already folded through the classification table and
/// any credential-state mutation (`mark_exhausted`/`mark_cooling_down`) that
/// classification implies.
enum AttemptOutcome<T> {
    Success(T),
    Retryable { is_transport: bool, error: GatewayError },
    Fatal(GatewayError),
}

/// Pseudo-random jitter without a `rand` dependency: hash the attempt counter
/// together with the current instant, same trick as
/// `transform::gemini::uuid_like` uses for a request id suffix.
fn jitter_ms(attempt: u32, max_ms: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    (attempt, std::time::Instant::now()).hash(&mut hasher);
    if max_ms == 0 {
        0
    } else {
        hasher.finish() % max_ms
    }
}

fn backoff_duration(attempt: u32, is_transport: bool) -> Duration {
    let multiplier = if is_transport { TRANSPORT_BACKOFF_MULTIPLIER } else { OTHER_BACKOFF_MULTIPLIER };
    let base = BASE_BACKOFF_MS.saturating_mul(u64::from(multiplier.saturating_pow(attempt.min(6))));
    let jitter = jitter_ms(attempt, base / 2 + 1);
    Duration::from_millis(base + jitter)
}

pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .expect("reqwest client with default TLS backend");
        Self { client }
    }

    /// Buffered (non-streaming) dispatch: retries across credentials per the
    /// classification table, returns the raw upstream response body once a
    /// successful 2xx is observed.
    pub async fn dispatch_buffered(
        &self,
        binding: &PipelineBinding,
        body: &Value,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>, GatewayError> {
        tokio::time::timeout(OVERALL_TIMEOUT, self.buffered_attempt_loop(binding, body, cancellation))
            .await
            .map_err(|_| GatewayError::Timeout(OVERALL_TIMEOUT))?
    }

    async fn buffered_attempt_loop(
        &self,
        binding: &PipelineBinding,
        body: &Value,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>, GatewayError> {
        let mut total_attempts = 0u32;
        let mut per_key_attempts: HashMap<usize, u32> = HashMap::new();
        let mut last_error: Option<GatewayError> = None;

        while total_attempts < binding.max_retries + 1 {
            let Some(handle) = self.next_usable_credential(binding, &mut per_key_attempts) else {
                break;
            };
            total_attempts += 1;

            let outcome = tokio::select! {
                o = self.send_buffered(binding, &handle, body) => o,
                _ = cancellation.cancelled() => return Err(GatewayError::Cancelled),
            };

            match outcome {
                AttemptOutcome::Success(bytes) => return Ok(bytes),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retryable { is_transport, error } => {
                    last_error = Some(error);
                    if total_attempts >= binding.max_retries + 1 {
                        break;
                    }
                    let backoff = backoff_duration(total_attempts, is_transport);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancellation.cancelled() => return Err(GatewayError::Cancelled),
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::NoAvailableCredential(binding.provider_name.clone())))
    }

    /// Streaming dispatch: the same retry policy applies only up to and
    /// including the response headers/status line. Once a 2xx response is in
    /// hand, a later mid-stream failure is "partial" (section 4.8) — surfaced
    /// to the caller as a stream error, never silently retried, since retrying
    /// would risk delivering duplicated output to the client.
    pub async fn dispatch_streaming(
        &self,
        binding: &PipelineBinding,
        body: &Value,
        cancellation: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut total_attempts = 0u32;
        let mut per_key_attempts: HashMap<usize, u32> = HashMap::new();
        let mut last_error: Option<GatewayError> = None;

        while total_attempts < binding.max_retries + 1 {
            let Some(handle) = self.next_usable_credential(binding, &mut per_key_attempts) else {
                break;
            };
            total_attempts += 1;

            let outcome = tokio::select! {
                o = self.send_for_streaming(binding, &handle, body) => o,
                _ = cancellation.cancelled() => return Err(GatewayError::Cancelled),
            };

            match outcome {
                AttemptOutcome::Success(response) => return Ok(response),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retryable { is_transport, error } => {
                    last_error = Some(error);
                    if total_attempts >= binding.max_retries + 1 {
                        break;
                    }
                    let backoff = backoff_duration(total_attempts, is_transport);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancellation.cancelled() => return Err(GatewayError::Cancelled),
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::NoAvailableCredential(binding.provider_name.clone())))
    }

    /// Draws the next credential this request attempt should use, skipping
    /// any that have already hit this binding's `maxRetriesPerKey` within
    /// this one request (a separate counter from the pool's own health
    /// state, which only changes on an actual classified failure).
    fn next_usable_credential(
        &self,
        binding: &PipelineBinding,
        per_key_attempts: &mut HashMap<usize, u32>,
    ) -> Option<CredentialHandle> {
        for _ in 0..binding.credentials.len().max(1) {
            let handle = binding.credentials.select()?;
            let attempts = per_key_attempts.entry(handle.index).or_insert(0);
            if *attempts < binding.max_retries_per_key {
                *attempts += 1;
                return Some(handle);
            }
        }
        None
    }

    fn build_request(
        &self,
        binding: &PipelineBinding,
        handle: &CredentialHandle,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let (header_name, header_value) = binding.auth_method.build_header(&handle.key, binding.header_name.as_deref());
        self.client.post(&binding.endpoint).header(header_name, header_value).json(body)
    }

    async fn send_buffered(
        &self,
        binding: &PipelineBinding,
        handle: &CredentialHandle,
        body: &Value,
    ) -> AttemptOutcome<Vec<u8>> {
        let sent = tokio::time::timeout(PER_ATTEMPT_TIMEOUT, self.build_request(binding, handle, body).send()).await;
        let response = match sent {
            Err(_) => return AttemptOutcome::Retryable {
                is_transport: true,
                error: GatewayError::UpstreamTransient { attempts: 1, detail: "attempt timed out".to_string() },
            },
            Ok(Err(e)) => return AttemptOutcome::Retryable {
                is_transport: true,
                error: GatewayError::UpstreamTransient { attempts: 1, detail: format!("transport error: {e}") },
            },
            Ok(Ok(r)) => r,
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => return AttemptOutcome::Retryable {
                is_transport: true,
                error: GatewayError::UpstreamTransient { attempts: 1, detail: format!("failed reading response body: {e}") },
            },
        };

        self.classify_response(binding, handle, status, bytes)
    }

    async fn send_for_streaming(
        &self,
        binding: &PipelineBinding,
        handle: &CredentialHandle,
        body: &Value,
    ) -> AttemptOutcome<reqwest::Response> {
        let sent = tokio::time::timeout(PER_ATTEMPT_TIMEOUT, self.build_request(binding, handle, body).send()).await;
        let response = match sent {
            Err(_) => return AttemptOutcome::Retryable {
                is_transport: true,
                error: GatewayError::UpstreamTransient { attempts: 1, detail: "attempt timed out".to_string() },
            },
            Ok(Err(e)) => return AttemptOutcome::Retryable {
                is_transport: true,
                error: GatewayError::UpstreamTransient { attempts: 1, detail: format!("transport error: {e}") },
            },
            Ok(Ok(r)) => r,
        };

        let status = response.status();
        match classify_status(status) {
            Classification::Success => AttemptOutcome::Success(response),
            Classification::Auth => {
                binding.credentials.mark_exhausted(handle.index);
                AttemptOutcome::Retryable {
                    is_transport: false,
                    error: GatewayError::UpstreamClient { status: status.as_u16(), detail: "credential rejected (401/403)".to_string() },
                }
            }
            Classification::RateLimited => {
                binding.credentials.mark_cooling_down(handle.index);
                AttemptOutcome::Retryable {
                    is_transport: false,
                    error: GatewayError::UpstreamTransient { attempts: 1, detail: "rate limited (429)".to_string() },
                }
            }
            Classification::Server => AttemptOutcome::Retryable {
                is_transport: false,
                error: GatewayError::UpstreamServer { status: status.as_u16(), detail: "upstream server error".to_string() },
            },
            Classification::ClientOther => AttemptOutcome::Fatal(GatewayError::UpstreamClient {
                status: status.as_u16(),
                detail: "upstream rejected the request".to_string(),
            }),
        }
    }

    fn classify_response(
        &self,
        binding: &PipelineBinding,
        handle: &CredentialHandle,
        status: StatusCode,
        bytes: Vec<u8>,
    ) -> AttemptOutcome<Vec<u8>> {
        match classify_status(status) {
            Classification::Success => AttemptOutcome::Success(bytes),
            Classification::Auth => {
                binding.credentials.mark_exhausted(handle.index);
                AttemptOutcome::Retryable {
                    is_transport: false,
                    error: GatewayError::UpstreamClient { status: status.as_u16(), detail: "credential rejected (401/403)".to_string() },
                }
            }
            Classification::RateLimited => {
                binding.credentials.mark_cooling_down(handle.index);
                AttemptOutcome::Retryable {
                    is_transport: false,
                    error: GatewayError::UpstreamTransient { attempts: 1, detail: "rate limited (429)".to_string() },
                }
            }
            Classification::Server => AttemptOutcome::Retryable {
                is_transport: false,
                error: GatewayError::UpstreamServer { status: status.as_u16(), detail: String::from_utf8_lossy(&bytes).to_string() },
            },
            Classification::ClientOther => AttemptOutcome::Fatal(GatewayError::UpstreamClient {
                status: status.as_u16(),
                detail: String::from_utf8_lossy(&bytes).to_string(),
            }),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_success_status() {
        assert_eq!(classify_status(StatusCode::OK), Classification::Success);
    }

    #[test]
    fn classify_auth_statuses() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), Classification::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), Classification::Auth);
    }

    #[test]
    fn classify_rate_limited() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Classification::RateLimited);
    }

    #[test]
    fn classify_server_error() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Classification::Server);
    }

    #[test]
    fn classify_other_client_error() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), Classification::ClientOther);
    }

    #[test]
    fn backoff_grows_with_attempt_number() {
        let first = backoff_duration(1, false);
        let third = backoff_duration(3, false);
        assert!(third >= first);
    }

    #[test]
    fn transport_backoff_uses_a_larger_multiplier() {
        // Compare the deterministic floor (ignoring jitter) rather than the
        // jittered duration itself.
        let transport_floor = BASE_BACKOFF_MS * u64::from(TRANSPORT_BACKOFF_MULTIPLIER.pow(2));
        let other_floor = BASE_BACKOFF_MS * u64::from(OTHER_BACKOFF_MULTIPLIER.pow(2));
        assert!(transport_floor > other_floor);
    }
}
