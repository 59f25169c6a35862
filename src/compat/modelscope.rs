//! ModelScope-hosted OpenAI-compatible endpoints routinely omit envelope
//! fields a strict OpenAI client would expect, and coalesce streamed
//! deltas into a top-level `message` even for non-stream responses. This
//! adapter fills the gaps without introducing fields outside the OpenAI
//! dialect.

use serde_json::{json, Value};

use crate::error::GatewayError;

use super::CompatibilityAdapter;

pub struct ModelScopeAdapter;

impl CompatibilityAdapter for ModelScopeAdapter {
    fn adapt_request(&self, _body: &mut Value) -> Result<(), GatewayError> {
        Ok(())
    }

    fn adapt_response(&self, body: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
        let mut value: Value = serde_json::from_slice(&body).map_err(|e| GatewayError::UpstreamClient {
            status: 502,
            detail: format!("modelscope response is not valid json: {e}"),
        })?;

        let Value::Object(map) = &mut value else {
            return Ok(body);
        };

        map.entry("object").or_insert_with(|| json!("chat.completion"));
        map.entry("id").or_insert_with(|| json!("modelscope-response"));
        map.entry("created").or_insert_with(|| json!(0));

        if let Some(choices) = map.get_mut("choices").and_then(|c| c.as_array_mut()) {
            for choice in choices {
                let Some(choice_obj) = choice.as_object_mut() else { continue };
                if !choice_obj.contains_key("message") {
                    if let Some(delta) = choice_obj.remove("delta") {
                        choice_obj.insert("message".to_string(), delta);
                    }
                }
            }
        }

        serde_json::to_vec(&value).map_err(|e| GatewayError::UpstreamClient {
            status: 502,
            detail: format!("failed to re-serialize normalized modelscope response: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fills_missing_envelope_fields() {
        let body = json!({"choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}]})
            .to_string()
            .into_bytes();
        let adapted = ModelScopeAdapter.adapt_response(body).unwrap();
        let value: Value = serde_json::from_slice(&adapted).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert!(value.get("id").is_some());
    }

    #[test]
    fn coalesces_delta_into_message_when_message_absent() {
        let body = json!({"choices": [{"delta": {"content": "partial"}}]})
            .to_string()
            .into_bytes();
        let adapted = ModelScopeAdapter.adapt_response(body).unwrap();
        let value: Value = serde_json::from_slice(&adapted).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "partial");
        assert!(value["choices"][0].get("delta").is_none());
    }
}
