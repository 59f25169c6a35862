//! End-to-end scenarios against a real gateway instance bound to an ephemeral
//! port, with `wiremock` standing in for every upstream provider. Exercises
//! the six-stage pipeline over actual HTTP rather than calling handlers
//! directly, the way `gobenpark-talk`'s `tests/provider_contracts.rs` drives
//! its provider trait through the crate's own public surface instead of unit
//! calls into private modules.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use llm_gateway::config::providers::{
    ApiKeySpec, AuthMethod, AuthenticationConfig, CredentialsConfig, DialectTag,
    KeyRotationConfig, ProviderConfig,
};
use llm_gateway::config::routing::{RouteBindingSpec, RouteConfig};
use llm_gateway::routing::build_routing_table;
use llm_gateway::server::build_router;
use llm_gateway::session::SessionCoordinator;
use llm_gateway::state::GatewayState;

use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Matches an exact `Authorization` header value; used to pin which
/// configured credential a given mock responds to.
struct AuthHeaderIs(&'static str);

impl wiremock::Match for AuthHeaderIs {
    fn matches(&self, request: &Request) -> bool {
        request.headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(self.0)
    }
}

fn provider(dialect: DialectTag, endpoint: &str, keys: Vec<&str>) -> ProviderConfig {
    ProviderConfig {
        provider_type: dialect,
        endpoint: endpoint.to_string(),
        authentication: AuthenticationConfig {
            method: AuthMethod::Bearer,
            credentials: CredentialsConfig {
                api_key: if keys.len() == 1 {
                    ApiKeySpec::Single(keys[0].to_string())
                } else {
                    ApiKeySpec::Many(keys.into_iter().map(String::from).collect())
                },
            },
            header_name: None,
        },
        key_rotation: KeyRotationConfig { cooldown_ms: 50, ..KeyRotationConfig::default() },
        compatibility_adapter: None,
        settings: HashMap::new(),
    }
}

/// Builds a one-route gateway (route "default" -> the given provider/model)
/// and spawns it on an ephemeral localhost port. Returns the base URL.
async fn spawn_gateway(provider_config: ProviderConfig, model: &str) -> String {
    let mut providers = HashMap::new();
    providers.insert("upstream".to_string(), provider_config);

    let mut routes = HashMap::new();
    routes.insert(
        "default".to_string(),
        RouteConfig::Single(RouteBindingSpec {
            provider: "upstream".to_string(),
            model: model.to_string(),
            priority: None,
        }),
    );

    let table = build_routing_table(&providers, &routes).expect("routing table builds");
    let sessions = SessionCoordinator::new(false, Duration::from_secs(300));
    let state = GatewayState::new(table, sessions);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{addr}")
}

fn anthropic_request(model: &str, text: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": text}],
        "max_tokens": 8,
    })
}

#[tokio::test]
async fn basic_openai_translation_round_trips_through_http() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1},
        })))
        .mount(&upstream)
        .await;

    let endpoint = format!("{}/chat/completions", upstream.uri());
    let base = spawn_gateway(provider(DialectTag::Openai, &endpoint, vec!["sk-test"]), "gpt-4o-mini").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&anthropic_request("default", "hi"))
        .send()
        .await
        .expect("request succeeds");

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 2);
    assert_eq!(body["usage"]["output_tokens"], 1);
}

#[tokio::test]
async fn gemini_tool_call_surfaces_as_tool_use_block_with_end_turn_stop_reason() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "calculator", "args": {"a": 8, "b": 9}}}],
                },
                "finishReason": "STOP",
            }],
        })))
        .mount(&upstream)
        .await;

    let endpoint = format!("{}/models/gemini-1.5-pro:generateContent", upstream.uri());
    let base = spawn_gateway(provider(DialectTag::Gemini, &endpoint, vec!["sk-test"]), "gemini-1.5-pro").await;

    let mut request = anthropic_request("default", "what is 8 plus 9?");
    request["tools"] = json!([{
        "name": "calculator",
        "description": "adds two numbers",
        "input_schema": {"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}, "required": ["a", "b"]},
    }]);
    request["tool_choice"] = json!("any");

    let client = reqwest::Client::new();
    let resp = client.post(format!("{base}/v1/messages")).json(&request).send().await.unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"].as_array().unwrap().len(), 1);
    assert_eq!(body["content"][0]["type"], "tool_use");
    assert_eq!(body["content"][0]["name"], "calculator");
    assert_eq!(body["content"][0]["input"], json!({"a": 8, "b": 9}));
    // Tool use is signaled by the block, not the stop reason: Gemini's own
    // finishReason for this turn was plain "STOP".
    assert_eq!(body["stop_reason"], "end_turn");

    let outgoing = &upstream.received_requests().await.unwrap()[0];
    let sent: Value = serde_json::from_slice(&outgoing.body).unwrap();
    assert_eq!(sent["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
    assert_eq!(sent["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0], "calculator");
}

#[tokio::test]
async fn same_conversation_requests_are_serialized_in_arrival_order() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("slow-first"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "first"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 1, "completion_tokens": 1},
                }))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("fast-second"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "second"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1},
        })))
        .mount(&upstream)
        .await;

    let endpoint = format!("{}/chat/completions", upstream.uri());
    let base = spawn_gateway(provider(DialectTag::Openai, &endpoint, vec!["sk-test"]), "gpt-4o-mini").await;

    let client = reqwest::Client::new();
    let started = std::time::Instant::now();

    let first = client
        .post(format!("{base}/v1/messages"))
        .header("x-conversation-id", "conv-ordering")
        .json(&anthropic_request("default", "slow-first"))
        .send();
    let second = client
        .post(format!("{base}/v1/messages"))
        .header("x-conversation-id", "conv-ordering")
        .json(&anthropic_request("default", "fast-second"))
        .send();

    // The coordinator's strict FIFO gate is keyed on arrival order within the
    // lock, not send order here, so give the first request a head start
    // before firing the second.
    let first_response = tokio::spawn(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second_response = second.await.expect("second request completes");
    let second_elapsed = started.elapsed();

    assert_eq!(second_response.status(), reqwest::StatusCode::OK);
    let second_body: Value = second_response.json().await.unwrap();
    assert_eq!(second_body["content"][0]["text"], "second");

    // The second request's upstream call has zero delay of its own; if it
    // completed quickly despite the first still sleeping inside its own
    // 200ms delay, the conversation-level FIFO gate did not hold it back.
    assert!(
        second_elapsed >= Duration::from_millis(180),
        "second request completed in {:?}, expected it to wait for the first to release its slot",
        second_elapsed
    );

    let first_response = first_response.await.unwrap().expect("first request completes");
    assert_eq!(first_response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn rate_limited_credential_cools_down_and_a_healthy_sibling_serves_the_retry() {
    let upstream = MockServer::start().await;
    // First key always gets 429; second key always succeeds. Dispatch must
    // rotate off the rate-limited key within this one request's retry loop.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(AuthHeaderIs("Bearer key-a"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(AuthHeaderIs("Bearer key-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "served by key-b"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1},
        })))
        .mount(&upstream)
        .await;

    let endpoint = format!("{}/chat/completions", upstream.uri());
    let base = spawn_gateway(provider(DialectTag::Openai, &endpoint, vec!["key-a", "key-b"]), "gpt-4o-mini").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&anthropic_request("default", "hi"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"][0]["text"], "served by key-b");
}

#[tokio::test]
async fn internal_annotation_key_leaking_into_upstream_body_is_rejected() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1},
            "__internal": {"debug": true},
        })))
        .mount(&upstream)
        .await;

    let endpoint = format!("{}/chat/completions", upstream.uri());
    let base = spawn_gateway(provider(DialectTag::Openai, &endpoint, vec!["sk-test"]), "gpt-4o-mini").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&anthropic_request("default", "hi"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "protocol_leak");
}

#[tokio::test]
async fn stream_closed_mid_response_ends_with_an_error_frame_not_silent_truncation() {
    let upstream = MockServer::start().await;
    // One SSE chunk with no trailing `[DONE]`: the connection just closes,
    // the way a dropped upstream or a dialect that omits a final sentinel
    // would behave.
    let raw_sse = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(raw_sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let endpoint = format!("{}/chat/completions", upstream.uri());
    let base = spawn_gateway(provider(DialectTag::Openai, &endpoint, vec!["sk-test"]), "gpt-4o-mini").await;

    let mut request = anthropic_request("default", "hi");
    request["stream"] = json!(true);

    let client = reqwest::Client::new();
    let resp = client.post(format!("{base}/v1/messages")).json(&request).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let body = resp.text().await.unwrap();
    assert!(body.contains("event: error") || body.contains("\"type\":\"error\""));
    assert!(
        body.contains("upstream closed the connection"),
        "expected a synthesized abort frame, got: {body}"
    );
}

#[tokio::test]
async fn healthz_and_routes_endpoints_are_reachable() {
    let base = spawn_gateway(provider(DialectTag::Openai, "http://unused.invalid", vec!["sk-test"]), "gpt-4o-mini").await;

    let client = reqwest::Client::new();
    let health = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let routes = client.get(format!("{base}/routes")).send().await.unwrap();
    assert_eq!(routes.status(), reqwest::StatusCode::OK);
    let body: Value = routes.json().await.unwrap();
    assert_eq!(body[0]["route"], "default");
    assert_eq!(body[0]["bindings"][0]["credentials_total"], 1);
}
