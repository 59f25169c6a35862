//! Ingress stage (section 4.2): the `POST /v1/messages` handler. Validates
//! the incoming Anthropic-shaped body, resolves conversation identity and a
//! virtual route, then drives the request all the way down through
//! Transformer -> Protocol -> Server-Compatibility -> Dispatch and back.
//!
//! There's no teacher handler to adapt directly — the proxy this crate
//! descends from forwards one dialect verbatim and never builds a routing
//! table — so this wiring follows the six-stage contract in section 4
//! directly. See `DESIGN.md`.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use futures::stream::unfold;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::compat;
use crate::error::GatewayError;
use crate::model::{AnthropicRequest, AnthropicStreamEvent, StreamErrorShape};
use crate::protocol;
use crate::session::{ConversationId, ConversationKey, SessionId, SessionSlot};
use crate::state::GatewayState;
use crate::transform::{self, DialectTranslator};

pub async fn handle_messages(State(state): State<GatewayState>, headers: HeaderMap, Json(raw): Json<Value>) -> Response<Body> {
    let error_log = state.error_log.clone();
    match process(state, headers, raw).await {
        Ok(response) => response,
        Err(err) => {
            if let Some(tx) = error_log {
                let sample = crate::errorlog::ErrorSample {
                    request_id: None,
                    classification: err.classification().to_string(),
                    message: err.to_string(),
                    timestamp_ms: wall_clock_ms(),
                };
                let _ = tx.try_send(sample);
            }
            err.into_response()
        }
    }
}

async fn process(state: GatewayState, headers: HeaderMap, raw: Value) -> Result<Response<Body>, GatewayError> {
    let request: AnthropicRequest =
        serde_json::from_value(raw).map_err(|e| GatewayError::Validation(format!("malformed request body: {e}")))?;
    validate_structure(&request)?;

    let (session_id, conversation_id) = resolve_conversation_identity(&headers);
    let explicit_route = request.metadata.as_ref().and_then(|m| m.virtual_route.as_deref());
    let route_name = state.routes.resolve_route(&request.model, explicit_route)?;
    let binding = state.routes.select_binding(&route_name)?;

    let key = ConversationKey { session_id: session_id.clone(), conversation_id: conversation_id.clone() };
    let slot = state.sessions.acquire(key).await;
    let cancellation = CancellationToken::new();
    let cancel_guard = CancelOnDrop(cancellation.clone());

    let request_id = format!(
        "{}:{}:seq{:04}:{}",
        session_id.0,
        conversation_id.0,
        slot.sequence_number(),
        wall_clock_ms(),
    );
    tracing::info!(
        request_id = %request_id,
        route = %route_name,
        provider = %binding.provider_name,
        streaming = request.stream,
        "dispatching request"
    );

    let mut translator = transform::translator_for(binding.dialect);
    let upstream_request = translator.to_upstream_request(&request)?;
    protocol::validate_outgoing(binding.dialect, &upstream_request)?;

    let adapter = compat::adapter_for(binding.compat_adapter, &binding.settings);
    let mut outgoing_body = upstream_request;
    adapter.adapt_request(&mut outgoing_body)?;

    if request.stream {
        // The slot and the cancellation guard move into the stream state:
        // per section 4.7 a streaming request isn't "complete" (and must not
        // release its conversation slot) until its final SSE frame has been
        // emitted, which happens well after this function returns its
        // headers-only response.
        let upstream_response = state.dispatcher.dispatch_streaming(&binding, &outgoing_body, &cancellation).await?;
        let body = Body::from_stream(stream_events(upstream_response, translator, cancellation, slot, cancel_guard));
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("x-request-id", request_id)
            .body(body)
            .unwrap_or_else(|_| Response::new(Body::empty())))
    } else {
        let raw_body = state.dispatcher.dispatch_buffered(&binding, &outgoing_body, &cancellation).await?;
        let adapted = adapter.adapt_response(raw_body)?;
        let value: Value = serde_json::from_slice(&adapted)
            .map_err(|e| GatewayError::UpstreamClient { status: 502, detail: format!("upstream body is not valid json: {e}") })?;
        protocol::validate_incoming(&value)?;
        let response = translator.from_upstream_response(&adapted)?;

        let payload = serde_json::to_vec(&response)
            .map_err(|e| GatewayError::Validation(format!("failed to serialize response: {e}")))?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("x-request-id", request_id)
            .body(Body::from(payload))
            .unwrap_or_else(|_| Response::new(Body::empty())))
    }
}

fn validate_structure(request: &AnthropicRequest) -> Result<(), GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::Validation("messages must not be empty".to_string()));
    }
    if request.max_tokens == 0 {
        return Err(GatewayError::Validation("max_tokens must be greater than zero".to_string()));
    }
    Ok(())
}

/// Resolves the header that identifies this exchange. The wire contract
/// (section 4.2/6) names three interchangeable headers without distinguishing
/// a separate session token from a conversation token, so the first value
/// found stands in for both halves of the coordinator's key; absent any of
/// them, a fresh synthesized id is used for both.
fn resolve_conversation_identity(headers: &HeaderMap) -> (SessionId, ConversationId) {
    let found = ["x-conversation-id", "x-session-id", "claude-conversation-id"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()).map(str::to_string));

    let id = found.unwrap_or_else(|| format!("synth-{}", pseudo_random_suffix()));
    (SessionId(id.clone()), ConversationId(id))
}

fn pseudo_random_suffix() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let v = RandomState::new().build_hasher().finish();
    format!("{:016x}", v)
}

fn wall_clock_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

/// Cancels the token when the handler future is dropped (client disconnect),
/// per section 5's cancellation contract.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct StreamState {
    response: reqwest::Response,
    translator: Box<dyn DialectTranslator>,
    pending: std::collections::VecDeque<AnthropicStreamEvent>,
    done: bool,
    // Set once a `message_stop` or `error` frame has actually been queued for
    // the client. Lets the upstream-closed arm tell a clean finish from a
    // mid-response abort.
    terminal_emitted: bool,
    cancellation: CancellationToken,
    // Held only for their `Drop` side effects: releasing the conversation
    // slot and cancelling the token if this stream is abandoned mid-flight.
    _slot: SessionSlot,
    _cancel_guard: CancelOnDrop,
}

/// Lazily decodes upstream chunks into canonical Anthropic SSE frames
/// (section 4.4.5). A translation error or a cancellation both terminate the
/// stream with a synthetic `error` frame rather than silently truncating it.
fn stream_events(
    response: reqwest::Response,
    translator: Box<dyn DialectTranslator>,
    cancellation: CancellationToken,
    slot: SessionSlot,
    cancel_guard: CancelOnDrop,
) -> impl futures::Stream<Item = Result<Bytes, std::convert::Infallible>> {
    let state = StreamState {
        response,
        translator,
        pending: std::collections::VecDeque::new(),
        done: false,
        terminal_emitted: false,
        cancellation,
        _slot: slot,
        _cancel_guard: cancel_guard,
    };

    unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                if matches!(event, AnthropicStreamEvent::MessageStop | AnthropicStreamEvent::Error { .. }) {
                    st.terminal_emitted = true;
                }
                return Some((Ok(Bytes::from(event.to_sse())), st));
            }
            if st.done {
                return None;
            }

            let chunk = tokio::select! {
                c = st.response.chunk() => c,
                _ = st.cancellation.cancelled() => {
                    st.done = true;
                    st.terminal_emitted = true;
                    let event = AnthropicStreamEvent::Error {
                        error: StreamErrorShape { error_type: "cancelled".to_string(), message: "request cancelled".to_string() },
                    };
                    return Some((Ok(Bytes::from(event.to_sse())), st));
                }
            };

            match chunk {
                Ok(Some(bytes)) => match st.translator.stream_chunk(&bytes) {
                    Ok(events) => {
                        st.pending.extend(events);
                        if st.pending.is_empty() {
                            continue;
                        }
                    }
                    Err(e) => {
                        st.done = true;
                        st.terminal_emitted = true;
                        let event = AnthropicStreamEvent::Error {
                            error: StreamErrorShape { error_type: e.classification().to_string(), message: e.to_string() },
                        };
                        return Some((Ok(Bytes::from(event.to_sse())), st));
                    }
                },
                Ok(None) => {
                    st.done = true;
                    // The upstream closed the connection without us ever
                    // queuing a `message_stop`/`error` frame — a mid-response
                    // abort that must not read to the client as a clean end.
                    if !st.terminal_emitted {
                        st.terminal_emitted = true;
                        let event = AnthropicStreamEvent::Error {
                            error: StreamErrorShape {
                                error_type: "upstream_transient".to_string(),
                                message: "upstream closed the connection before the response completed".to_string(),
                            },
                        };
                        return Some((Ok(Bytes::from(event.to_sse())), st));
                    }
                }
                Err(e) => {
                    st.done = true;
                    st.terminal_emitted = true;
                    let event = AnthropicStreamEvent::Error {
                        error: StreamErrorShape { error_type: "upstream_transient".to_string(), message: format!("stream read failed: {e}") },
                    };
                    return Some((Ok(Bytes::from(event.to_sse())), st));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnthropicMessage, MessageContent, Role};

    fn sample_request() -> AnthropicRequest {
        AnthropicRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![AnthropicMessage { role: Role::User, content: MessageContent::Text("hi".to_string()) }],
            system: None,
            tools: None,
            tool_choice: None,
            max_tokens: 256,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: false,
            metadata: None,
        }
    }

    #[test]
    fn rejects_empty_messages() {
        let mut request = sample_request();
        request.messages.clear();
        assert!(validate_structure(&request).is_err());
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let mut request = sample_request();
        request.max_tokens = 0;
        assert!(validate_structure(&request).is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate_structure(&sample_request()).is_ok());
    }

    #[test]
    fn conversation_identity_prefers_explicit_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-conversation-id", "conv-42".parse().unwrap());
        let (session, conversation) = resolve_conversation_identity(&headers);
        assert_eq!(session.0, "conv-42");
        assert_eq!(conversation.0, "conv-42");
    }

    #[test]
    fn conversation_identity_synthesizes_when_absent() {
        let headers = HeaderMap::new();
        let (session, conversation) = resolve_conversation_identity(&headers);
        assert!(session.0.starts_with("synth-"));
        assert_eq!(session.0, conversation.0);
    }
}
