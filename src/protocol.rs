//! Protocol Validator (section 4.5): enforces that a payload crossing the
//! Transformer<->Dispatch boundary contains only fields from its declared
//! dialect's whitelist. No teacher file performs this exact check — the
//! proxy this crate descends from trusts its own translation output — but
//! the check is a small enough invariant guard that it earns its own module
//! rather than living inline in dispatch, the way `GatewayError`'s variant
//! set already separates "bug" (`ProtocolLeak`) from "expected" failures.

use serde_json::Value;

use crate::config::providers::DialectTag;
use crate::error::GatewayError;

const OPENAI_WHITELIST: &[&str] = &[
    "model", "messages", "tools", "tool_choice", "temperature", "max_tokens",
    "top_p", "stop", "stream",
];

const GEMINI_WHITELIST: &[&str] = &[
    "contents", "systemInstruction", "tools", "toolConfig", "generationConfig",
];

const CODEWHISPERER_WHITELIST: &[&str] = &["conversationState"];

/// Anthropic-specific keys that must never appear in an outgoing dialect
/// payload — a sure sign the Transformer leaked its own canonical shape
/// through instead of converting it.
const FORBIDDEN_ANTHROPIC_KEYS: &[&str] = &["input_schema", "max_tokens_to_sample", "tool_use_id"];

fn whitelist_for(dialect: DialectTag) -> &'static [&'static str] {
    match dialect {
        DialectTag::Openai | DialectTag::Lmstudio => OPENAI_WHITELIST,
        DialectTag::Gemini => GEMINI_WHITELIST,
        DialectTag::Codewhisperer => CODEWHISPERER_WHITELIST,
    }
}

/// Checks one outgoing (Transformer -> Dispatch) payload against its
/// dialect's whitelist. A `system` key is permitted only as a plain string
/// (the Anthropic block-array form leaking through is the bug this guards
/// against — the OpenAI translator always flattens it into a message).
pub fn validate_outgoing(dialect: DialectTag, payload: &Value) -> Result<(), GatewayError> {
    let Value::Object(map) = payload else {
        return Err(GatewayError::ProtocolLeak {
            boundary: "transformer->dispatch".to_string(),
            detail: "payload is not a JSON object".to_string(),
        });
    };

    let whitelist = whitelist_for(dialect);
    for key in map.keys() {
        if key.starts_with("__") {
            return Err(GatewayError::ProtocolLeak {
                boundary: "transformer->dispatch".to_string(),
                detail: format!("internal-annotation key '{}' leaked into outgoing payload", key),
            });
        }
        if FORBIDDEN_ANTHROPIC_KEYS.contains(&key.as_str()) {
            return Err(GatewayError::ProtocolLeak {
                boundary: "transformer->dispatch".to_string(),
                detail: format!("anthropic-only key '{}' leaked into {:?} payload", key, dialect),
            });
        }
        if key == "system" && matches!(map.get(key), Some(Value::Array(_))) {
            return Err(GatewayError::ProtocolLeak {
                boundary: "transformer->dispatch".to_string(),
                detail: "anthropic block-array 'system' leaked unconverted into outgoing payload".to_string(),
            });
        }
        if !whitelist.contains(&key.as_str()) {
            return Err(GatewayError::ProtocolLeak {
                boundary: "transformer->dispatch".to_string(),
                detail: format!("field '{}' is not in the {:?} whitelist", key, dialect),
            });
        }
    }

    Ok(())
}

/// Checks one incoming (Dispatch -> Transformer) upstream body for leaked
/// internal annotations before the response-direction translator touches
/// it. Upstream dialect shapes are otherwise permissive here — we don't
/// whitelist upstream response fields since providers routinely add fields
/// we don't otherwise model; only the `__`-prefix invariant is enforced in
/// both directions.
pub fn validate_incoming(body: &Value) -> Result<(), GatewayError> {
    fn scan(value: &Value) -> Option<String> {
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    if key.starts_with("__") {
                        return Some(key.clone());
                    }
                    if let Some(found) = scan(v) {
                        return Some(found);
                    }
                }
                None
            }
            Value::Array(items) => items.iter().find_map(scan),
            _ => None,
        }
    }

    if let Some(key) = scan(body) {
        return Err(GatewayError::ProtocolLeak {
            boundary: "dispatch->transformer".to_string(),
            detail: format!("internal-annotation key '{}' present in upstream body", key),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_openai_payload() {
        let payload = json!({"model": "gpt-4o-mini", "messages": [], "stream": false});
        assert!(validate_outgoing(DialectTag::Openai, &payload).is_ok());
    }

    #[test]
    fn rejects_double_underscore_prefixed_key() {
        let payload = json!({"model": "gpt-4o-mini", "messages": [], "__internal": {"x": 1}});
        let err = validate_outgoing(DialectTag::Openai, &payload).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolLeak { .. }));
    }

    #[test]
    fn rejects_anthropic_input_schema_leak() {
        let payload = json!({"model": "gpt-4o-mini", "messages": [], "input_schema": {}});
        assert!(validate_outgoing(DialectTag::Openai, &payload).is_err());
    }

    #[test]
    fn rejects_unconverted_system_block_array() {
        let payload = json!({"model": "gpt-4o-mini", "messages": [], "system": [{"type": "text", "text": "hi"}]});
        assert!(validate_outgoing(DialectTag::Openai, &payload).is_err());
    }

    #[test]
    fn rejects_field_outside_whitelist() {
        let payload = json!({"model": "gpt-4o-mini", "messages": [], "frequency_penalty": 0.5});
        assert!(validate_outgoing(DialectTag::Openai, &payload).is_err());
    }

    #[test]
    fn gemini_whitelist_accepts_tool_config() {
        let payload = json!({"contents": [], "toolConfig": {"functionCallingConfig": {"mode": "AUTO"}}});
        assert!(validate_outgoing(DialectTag::Gemini, &payload).is_ok());
    }

    #[test]
    fn incoming_scan_finds_nested_internal_key() {
        let body = json!({"choices": [{"message": {"__leaked": true}}]});
        assert!(validate_incoming(&body).is_err());
    }

    #[test]
    fn incoming_scan_passes_clean_body() {
        let body = json!({"choices": [{"message": {"content": "hi"}}]});
        assert!(validate_incoming(&body).is_ok());
    }
}
