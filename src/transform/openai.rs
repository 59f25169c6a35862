//! OpenAI chat-completions dialect (section 4.4.1 / 4.4.2).
//!
//! Request direction mirrors the field table: top-level `system` becomes a
//! `role: "system"` message, `stop_sequences` becomes `stop`, tool blocks
//! become `tool_calls`/`role: "tool"` messages. Response direction is the
//! reverse, plus a best-effort repair pass on malformed `tool_calls[].
//! function.arguments` JSON before falling back to a partial envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicStreamEvent, AnthropicTool,
    AnthropicToolChoice, BlockDelta, ContentBlock, MessageContent, MessageDeltaShape,
    MessageStartShape, Role, StopReason, StreamBlockShape, SystemPrompt, Usage,
};

use super::DialectTranslator;

#[derive(Debug, Serialize)]
struct OaRequest {
    model: String,
    messages: Vec<OaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OaTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<OaToolChoice>,
}

#[derive(Debug, Serialize)]
struct OaMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OaToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OaFunctionCall,
}

#[derive(Debug, Serialize)]
struct OaFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OaTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OaFunction,
}

#[derive(Debug, Serialize)]
struct OaFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OaToolChoice {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        choice_type: String,
        function: OaToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct OaToolChoiceFunction {
    name: String,
}

fn convert_message(msg: &AnthropicMessage) -> Vec<OaMessage> {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let mut messages = Vec::new();
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(OaToolCall {
                id,
                call_type: "function".to_string(),
                function: OaFunctionCall {
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => messages.push(OaMessage {
                role: "tool".to_string(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            }),
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        messages.insert(
            0,
            OaMessage {
                role: role.to_string(),
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join(""))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            },
        );
    }

    messages
}

fn convert_tool(tool: &AnthropicTool) -> OaTool {
    OaTool {
        tool_type: "function".to_string(),
        function: OaFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn convert_tool_choice(choice: &AnthropicToolChoice) -> OaToolChoice {
    match choice {
        AnthropicToolChoice::Auto => OaToolChoice::Mode("auto".to_string()),
        AnthropicToolChoice::Any => OaToolChoice::Mode("required".to_string()),
        AnthropicToolChoice::Tool { name } => OaToolChoice::Specific {
            choice_type: "function".to_string(),
            function: OaToolChoiceFunction { name: name.clone() },
        },
    }
}

/// Attempt to fix the common ways a streamed/truncated `arguments` string
/// fails to parse: a trailing comma before a closing brace, or an
/// unterminated object missing its closing braces. One attempt only; if this
/// doesn't produce valid JSON the caller falls back to a partial envelope.
fn repair_tool_arguments(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(raw) {
        return Some(v);
    }

    let trimmed = raw.trim();
    let no_trailing_comma = {
        let mut s = trimmed.to_string();
        while let Some(pos) = s.rfind(",}") {
            s.replace_range(pos..pos + 2, "}");
        }
        while let Some(pos) = s.rfind(",]") {
            s.replace_range(pos..pos + 2, "]");
        }
        s
    };
    if let Ok(v) = serde_json::from_str(&no_trailing_comma) {
        return Some(v);
    }

    let opens = trimmed.matches('{').count();
    let closes = trimmed.matches('}').count();
    if opens > closes {
        let mut balanced = no_trailing_comma.clone();
        for _ in 0..(opens - closes) {
            balanced.push('}');
        }
        if let Ok(v) = serde_json::from_str(&balanced) {
            return Some(v);
        }
    }

    None
}

/// OpenAI `finish_reason` -> Anthropic `stop_reason` (section 4.4.2's exact
/// table; `content_filter` maps to `stop_sequence`, not `end_turn`).
fn convert_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" | "eos" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::StopSequence,
        other => {
            tracing::warn!(finish_reason = other, "unrecognized OpenAI finish_reason, defaulting to end_turn");
            StopReason::EndTurn
        }
    }
}

#[derive(Debug, Deserialize)]
struct OaChatCompletion {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<OaChoice>,
    #[serde(default)]
    usage: Option<OaUsage>,
}

#[derive(Debug, Deserialize)]
struct OaChoice {
    message: OaRespMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaRespMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaRespToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OaRespToolCall {
    id: String,
    function: OaRespFunction,
}

#[derive(Debug, Deserialize)]
struct OaRespFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OaUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OaStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<OaStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OaStreamChoice {
    delta: OaDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OaToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OaFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OaFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

pub struct OpenAiTranslator {
    line_buffer: String,
    sent_initial: bool,
    chunk_index: u32,
    text_block_open: bool,
    tool_block_open: bool,
}

impl OpenAiTranslator {
    pub fn new() -> Self {
        Self {
            line_buffer: String::new(),
            sent_initial: false,
            chunk_index: 0,
            text_block_open: false,
            tool_block_open: false,
        }
    }

    fn translate_sse_data(&mut self, data: &str) -> Result<Vec<AnthropicStreamEvent>, GatewayError> {
        let chunk: OaStreamChunk = serde_json::from_str(data)
            .map_err(|e| GatewayError::UpstreamClient { status: 502, detail: format!("malformed openai stream chunk: {e}") })?;

        let mut events = Vec::new();

        if !self.sent_initial {
            events.push(AnthropicStreamEvent::MessageStart {
                message: MessageStartShape {
                    id: format!("msg_{}", chunk.id.trim_start_matches("chatcmpl-")),
                    message_type: "message".to_string(),
                    role: Role::Assistant,
                    content: vec![],
                    model: chunk.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage::default(),
                },
            });
            self.sent_initial = true;
        }

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    if !self.text_block_open {
                        events.push(AnthropicStreamEvent::ContentBlockStart {
                            index: self.chunk_index,
                            content_block: StreamBlockShape::Text { text: String::new() },
                        });
                        self.text_block_open = true;
                    }
                    events.push(AnthropicStreamEvent::ContentBlockDelta {
                        index: self.chunk_index,
                        delta: BlockDelta::TextDelta { text: content.clone() },
                    });
                }
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    let starting_new = tc.id.is_some()
                        || tc.function.as_ref().and_then(|f| f.name.as_deref()).is_some();
                    if starting_new {
                        if self.text_block_open {
                            events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                            self.chunk_index += 1;
                            self.text_block_open = false;
                        }
                        if self.tool_block_open {
                            events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                            self.chunk_index += 1;
                        }
                        events.push(AnthropicStreamEvent::ContentBlockStart {
                            index: self.chunk_index,
                            content_block: StreamBlockShape::ToolUse {
                                id: tc.id.clone().unwrap_or_default(),
                                name: tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default(),
                                input: serde_json::json!({}),
                            },
                        });
                        self.tool_block_open = true;
                    }

                    if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_deref()) {
                        if !args.is_empty() {
                            events.push(AnthropicStreamEvent::ContentBlockDelta {
                                index: self.chunk_index,
                                delta: BlockDelta::InputJsonDelta { partial_json: args.to_string() },
                            });
                        }
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                if self.text_block_open || self.tool_block_open {
                    events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                    self.text_block_open = false;
                    self.tool_block_open = false;
                }
                events.push(AnthropicStreamEvent::MessageDelta {
                    delta: MessageDeltaShape {
                        stop_reason: Some(convert_finish_reason(reason)),
                        stop_sequence: None,
                    },
                    usage: Usage::default(),
                });
            }
        }

        Ok(events)
    }
}

impl DialectTranslator for OpenAiTranslator {
    fn to_upstream_request(&self, request: &AnthropicRequest) -> Result<Value, GatewayError> {
        let mut messages = Vec::new();

        if let Some(system) = &request.system {
            let text = system.joined_text();
            if !text.is_empty() {
                messages.push(OaMessage {
                    role: "system".to_string(),
                    content: Some(text),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }

        for m in &request.messages {
            messages.extend(convert_message(m));
        }

        let oa_request = OaRequest {
            model: request.model.clone(),
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop_sequences.clone(),
            stream: request.stream,
            tools: request.tools.as_ref().map(|ts| ts.iter().map(convert_tool).collect()),
            tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        };

        serde_json::to_value(&oa_request)
            .map_err(|e| GatewayError::Validation(format!("failed to serialize openai request: {e}")))
    }

    fn from_upstream_response(&self, body: &[u8]) -> Result<AnthropicResponse, GatewayError> {
        let resp: OaChatCompletion = serde_json::from_slice(body)
            .map_err(|e| GatewayError::UpstreamClient { status: 502, detail: format!("malformed openai response: {e}") })?;

        let choice = resp.choices.first();
        let mut content = Vec::new();

        if let Some(choice) = choice {
            if let Some(text) = &choice.message.content {
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text: text.clone() });
                }
            }
            if let Some(tool_calls) = &choice.message.tool_calls {
                for tc in tool_calls {
                    let input = repair_tool_arguments(&tc.function.arguments).unwrap_or_else(|| {
                        tracing::warn!(tool_call_id = %tc.id, "unrepairable tool_call arguments, marking partial");
                        serde_json::json!({ "_raw": tc.function.arguments, "_partial": true })
                    });
                    content.push(ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        input,
                    });
                }
            }
        }

        let usage = resp
            .usage
            .map(|u| Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens })
            .unwrap_or_default();

        let mut response = AnthropicResponse::new(
            format!("msg_{}", resp.id.trim_start_matches("chatcmpl-")),
            resp.model,
            content,
            usage,
        );
        response.stop_reason = choice.and_then(|c| c.finish_reason.as_deref()).map(convert_finish_reason);
        Ok(response)
    }

    fn stream_chunk(&mut self, chunk: &[u8]) -> Result<Vec<AnthropicStreamEvent>, GatewayError> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| GatewayError::UpstreamTransient { attempts: 1, detail: format!("invalid utf8 in stream: {e}") })?;
        self.line_buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(pos) = self.line_buffer.find('\n') {
            let line = self.line_buffer[..pos].trim().to_string();
            self.line_buffer.drain(..=pos);

            let Some(data) = line.strip_prefix("data: ") else { continue };
            if data == "[DONE]" {
                events.push(AnthropicStreamEvent::MessageStop);
                continue;
            }
            events.extend(self.translate_sse_data(data)?);
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnthropicMessage, MessageContent, Role};

    fn sample_request() -> AnthropicRequest {
        AnthropicRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![AnthropicMessage {
                role: Role::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            system: Some(SystemPrompt::Text("be nice".to_string())),
            tools: None,
            tool_choice: None,
            max_tokens: 100,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: false,
            metadata: None,
        }
    }

    #[test]
    fn system_prompt_becomes_leading_message() {
        let translator = OpenAiTranslator::new();
        let v = translator.to_upstream_request(&sample_request()).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][0]["content"], "be nice");
        assert_eq!(v["messages"][1]["role"], "user");
    }

    #[test]
    fn content_filter_maps_to_stop_sequence_not_end_turn() {
        assert_eq!(convert_finish_reason("content_filter"), StopReason::StopSequence);
    }

    #[test]
    fn tool_calls_finish_reason_maps_to_tool_use() {
        assert_eq!(convert_finish_reason("tool_calls"), StopReason::ToolUse);
    }

    #[test]
    fn repairs_trailing_comma_in_arguments() {
        let fixed = repair_tool_arguments(r#"{"city":"London",}"#).unwrap();
        assert_eq!(fixed["city"], "London");
    }

    #[test]
    fn repairs_unterminated_object() {
        let fixed = repair_tool_arguments(r#"{"city":"London""#).unwrap();
        assert_eq!(fixed["city"], "London");
    }

    #[test]
    fn buffered_response_translates_tool_call() {
        let translator = OpenAiTranslator::new();
        let body = br#"{
            "id": "chatcmpl-123",
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {"content": null, "tool_calls": [{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"London\"}"}}]},
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let resp = translator.from_upstream_response(body).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        matches!(&resp.content[0], ContentBlock::ToolUse { name, .. } if name == "get_weather");
    }

    #[test]
    fn streaming_text_delta_emits_message_start_then_delta() {
        let mut translator = OpenAiTranslator::new();
        let chunk = b"data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n";
        let events = translator.stream_chunk(chunk).unwrap();
        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockDelta { .. })));
    }

    #[test]
    fn done_sentinel_emits_message_stop() {
        let mut translator = OpenAiTranslator::new();
        translator.sent_initial = true;
        let events = translator.stream_chunk(b"data: [DONE]\n\n").unwrap();
        assert!(matches!(events[0], AnthropicStreamEvent::MessageStop));
    }
}
