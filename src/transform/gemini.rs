//! Google Gemini `generateContent` dialect (section 4.4.3).
//!
//! No reference implementation for this dialect exists anywhere in the
//! pack (see `DESIGN.md`); built against the documented wire shape
//! (`contents`/`parts`, `functionCall`/`functionResponse`,
//! `toolConfig.functionCallingConfig`) in the same request/response-DTO and
//! trait shape as the other dialect modules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicStreamEvent, AnthropicTool,
    AnthropicToolChoice, BlockDelta, ContentBlock, MessageDeltaShape, MessageStartShape, Role,
    StopReason, StreamBlockShape, Usage,
};

use super::DialectTranslator;

#[derive(Debug, Serialize)]
struct GRequest {
    contents: Vec<GContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "systemInstruction")]
    system_instruction: Option<GContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GToolSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "toolConfig")]
    tool_config: Option<GToolConfig>,
    #[serde(rename = "generationConfig")]
    generation_config: GGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GFunctionResponse>,
}

impl GPart {
    fn text(text: String) -> Self {
        Self { text: Some(text), function_call: None, function_response: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GFunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
struct GToolSet {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct GToolConfig {
    #[serde(rename = "functionCallingConfig")]
    function_calling_config: GFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct GFunctionCallingConfig {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "allowedFunctionNames")]
    allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct GGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "topP")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "stopSequences")]
    stop_sequences: Option<Vec<String>>,
}

fn convert_message(msg: &AnthropicMessage) -> GContent {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    let parts = msg
        .content
        .as_blocks()
        .into_iter()
        .map(|block| match block {
            ContentBlock::Text { text } => GPart::text(text),
            ContentBlock::ToolUse { name, input, .. } => GPart {
                text: None,
                function_call: Some(GFunctionCall { name, args: input }),
                function_response: None,
            },
            ContentBlock::ToolResult { tool_use_id, content } => GPart {
                text: None,
                function_call: None,
                function_response: Some(GFunctionResponse {
                    name: tool_use_id,
                    response: serde_json::json!({ "result": content }),
                }),
            },
        })
        .collect();
    GContent { role: Some(role.to_string()), parts }
}

fn convert_tool(tool: &AnthropicTool) -> GFunctionDeclaration {
    GFunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: tool.input_schema.clone(),
    }
}

/// `ANY` mode requires `allowedFunctionNames` to be set explicitly — Gemini
/// rejects an `ANY` request that omits it.
fn convert_tool_choice(
    choice: &AnthropicToolChoice,
    all_tool_names: &[String],
) -> GToolConfig {
    let config = match choice {
        AnthropicToolChoice::Auto => GFunctionCallingConfig {
            mode: "AUTO".to_string(),
            allowed_function_names: None,
        },
        AnthropicToolChoice::Any => GFunctionCallingConfig {
            mode: "ANY".to_string(),
            allowed_function_names: Some(all_tool_names.to_vec()),
        },
        AnthropicToolChoice::Tool { name } => GFunctionCallingConfig {
            mode: "ANY".to_string(),
            allowed_function_names: Some(vec![name.clone()]),
        },
    };
    GToolConfig { function_calling_config: config }
}

/// Tool use is signaled by the presence of a `tool_use` content block, not by
/// `stop_reason` — Gemini's own `finishReason` is still "STOP" when it emits
/// a `functionCall`, and that's the value that crosses the wire unchanged.
fn convert_finish_reason(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => StopReason::StopSequence,
        // Unlike plain "STOP", this reason itself names a tool-use outcome,
        // so it gets the same treatment as OpenAI's "tool_calls" sentinel.
        "UNEXPECTED_TOOL_CALL" => StopReason::ToolUse,
        other => {
            tracing::warn!(finish_reason = other, "unrecognized gemini finishReason, defaulting to end_turn");
            StopReason::EndTurn
        }
    }
}

#[derive(Debug, Deserialize)]
struct GResponse {
    candidates: Vec<GCandidate>,
    #[serde(default)]
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GUsage>,
}

#[derive(Debug, Deserialize)]
struct GCandidate {
    content: GContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GUsage {
    prompt_token_count: u32,
    candidates_token_count: u32,
}

pub struct GeminiTranslator {
    line_buffer: String,
    sent_initial: bool,
    chunk_index: u32,
    block_open: bool,
}

impl GeminiTranslator {
    pub fn new() -> Self {
        Self { line_buffer: String::new(), sent_initial: false, chunk_index: 0, block_open: false }
    }

    fn response_to_blocks(content: &GContent) -> (Vec<ContentBlock>, bool) {
        let mut blocks = Vec::new();
        let mut has_tool_call = false;
        for (i, part) in content.parts.iter().enumerate() {
            if let Some(text) = &part.text {
                blocks.push(ContentBlock::Text { text: text.clone() });
            }
            if let Some(call) = &part.function_call {
                has_tool_call = true;
                blocks.push(ContentBlock::ToolUse {
                    id: format!("call_{}", i),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
        }
        (blocks, has_tool_call)
    }
}

impl DialectTranslator for GeminiTranslator {
    fn to_upstream_request(&self, request: &AnthropicRequest) -> Result<Value, GatewayError> {
        let contents = request.messages.iter().map(convert_message).collect();

        let system_instruction = request.system.as_ref().map(|s| GContent {
            role: None,
            parts: vec![GPart::text(s.joined_text())],
        });

        let all_tool_names: Vec<String> = request
            .tools
            .as_ref()
            .map(|ts| ts.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default();

        let tools = request.tools.as_ref().map(|ts| {
            vec![GToolSet { function_declarations: ts.iter().map(convert_tool).collect() }]
        });

        let tool_config = request
            .tool_choice
            .as_ref()
            .map(|tc| convert_tool_choice(tc, &all_tool_names));

        let g_request = GRequest {
            contents,
            system_instruction,
            tools,
            tool_config,
            generation_config: GGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                stop_sequences: request.stop_sequences.clone(),
            },
        };

        serde_json::to_value(&g_request)
            .map_err(|e| GatewayError::Validation(format!("failed to serialize gemini request: {e}")))
    }

    fn from_upstream_response(&self, body: &[u8]) -> Result<AnthropicResponse, GatewayError> {
        let resp: GResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::UpstreamClient { status: 502, detail: format!("malformed gemini response: {e}") })?;

        let candidate = resp.candidates.first().ok_or_else(|| GatewayError::UpstreamClient {
            status: 502,
            detail: "gemini response had no candidates".to_string(),
        })?;

        let (mut content, _has_tool_call) = Self::response_to_blocks(&candidate.content);
        let stop_reason = candidate.finish_reason.as_deref().map(convert_finish_reason);

        // Gemini sometimes reports this finishReason with no text part at
        // all; surface it as a real block rather than an empty message.
        if candidate.finish_reason.as_deref() == Some("UNEXPECTED_TOOL_CALL") {
            tracing::warn!("gemini returned UNEXPECTED_TOOL_CALL finishReason");
            content.push(ContentBlock::Text {
                text: "[gemini reported an unexpected tool call]".to_string(),
            });
        }

        let usage = resp
            .usage_metadata
            .map(|u| Usage { input_tokens: u.prompt_token_count, output_tokens: u.candidates_token_count })
            .unwrap_or_default();

        let mut response = AnthropicResponse::new(
            format!("msg_{}", uuid_like()),
            "gemini".to_string(),
            content,
            usage,
        );
        response.stop_reason = stop_reason;
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
            let chunk: GResponse = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(_) => continue,
            };

            if !self.sent_initial {
                events.push(AnthropicStreamEvent::MessageStart {
                    message: MessageStartShape {
                        id: format!("msg_{}", uuid_like()),
                        message_type: "message".to_string(),
                        role: Role::Assistant,
                        content: vec![],
                        model: "gemini".to_string(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: Usage::default(),
                    },
                });
                self.sent_initial = true;
            }

            if let Some(candidate) = chunk.candidates.first() {
                let (blocks, _has_tool_call) = Self::response_to_blocks(&candidate.content);
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !self.block_open {
                                events.push(AnthropicStreamEvent::ContentBlockStart {
                                    index: self.chunk_index,
                                    content_block: StreamBlockShape::Text { text: String::new() },
                                });
                                self.block_open = true;
                            }
                            events.push(AnthropicStreamEvent::ContentBlockDelta {
                                index: self.chunk_index,
                                delta: BlockDelta::TextDelta { text },
                            });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            if self.block_open {
                                events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                                self.chunk_index += 1;
                            }
                            events.push(AnthropicStreamEvent::ContentBlockStart {
                                index: self.chunk_index,
                                content_block: StreamBlockShape::ToolUse { id, name, input: input.clone() },
                            });
                            events.push(AnthropicStreamEvent::ContentBlockDelta {
                                index: self.chunk_index,
                                delta: BlockDelta::InputJsonDelta {
                                    partial_json: input.to_string(),
                                },
                            });
                            self.block_open = true;
                        }
                        ContentBlock::ToolResult { .. } => {}
                    }
                }

                if let Some(reason) = &candidate.finish_reason {
                    if reason == "UNEXPECTED_TOOL_CALL" && !self.block_open {
                        tracing::warn!("gemini returned UNEXPECTED_TOOL_CALL finishReason");
                        events.push(AnthropicStreamEvent::ContentBlockStart {
                            index: self.chunk_index,
                            content_block: StreamBlockShape::Text { text: String::new() },
                        });
                        events.push(AnthropicStreamEvent::ContentBlockDelta {
                            index: self.chunk_index,
                            delta: BlockDelta::TextDelta { text: "[gemini reported an unexpected tool call]".to_string() },
                        });
                        self.block_open = true;
                    }
                    if self.block_open {
                        events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                        self.block_open = false;
                    }
                    events.push(AnthropicStreamEvent::MessageDelta {
                        delta: MessageDeltaShape {
                            stop_reason: Some(convert_finish_reason(reason)),
                            stop_sequence: None,
                        },
                        usage: Usage::default(),
                    });
                    events.push(AnthropicStreamEvent::MessageStop);
                }
            }
        }

        Ok(events)
    }
}

/// Short pseudo-random id suffix; Gemini responses don't carry a request id
/// we can reuse the way OpenAI's `chatcmpl-*` id is reused.
fn uuid_like() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let v = RandomState::new().build_hasher().finish();
    format!("{:016x}", v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnthropicMessage, MessageContent, Role};

    fn sample_request() -> AnthropicRequest {
        AnthropicRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![AnthropicMessage {
                role: Role::User,
                content: MessageContent::Text("hi".to_string()),
            }],
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
    fn user_message_maps_to_user_role_content() {
        let translator = GeminiTranslator::new();
        let v = translator.to_upstream_request(&sample_request()).unwrap();
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(v["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn any_tool_choice_sets_allowed_function_names() {
        let mut req = sample_request();
        req.tools = Some(vec![AnthropicTool {
            name: "get_weather".to_string(),
            description: None,
            input_schema: serde_json::json!({"type":"object"}),
        }]);
        req.tool_choice = Some(AnthropicToolChoice::Any);
        let translator = GeminiTranslator::new();
        let v = translator.to_upstream_request(&req).unwrap();
        assert_eq!(v["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(
            v["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0],
            "get_weather"
        );
    }

    #[test]
    fn stop_finish_reason_maps_to_end_turn() {
        assert_eq!(convert_finish_reason("STOP"), StopReason::EndTurn);
    }

    #[test]
    fn function_call_present_leaves_finish_reason_mapping_untouched() {
        let content = GContent {
            role: Some("model".to_string()),
            parts: vec![GPart {
                text: None,
                function_call: Some(GFunctionCall { name: "calculator".to_string(), args: serde_json::json!({"a":8,"b":9}) }),
                function_response: None,
            }],
        };
        let (blocks, has_tool_call) = GeminiTranslator::response_to_blocks(&content);
        assert!(has_tool_call);
        assert!(matches!(blocks[0], ContentBlock::ToolUse { .. }));
        assert_eq!(convert_finish_reason("STOP"), StopReason::EndTurn);
    }

    #[test]
    fn unexpected_tool_call_reason_maps_to_tool_use() {
        assert_eq!(convert_finish_reason("UNEXPECTED_TOOL_CALL"), StopReason::ToolUse);
    }

    #[test]
    fn unexpected_tool_call_response_carries_a_diagnostic_text_block() {
        let translator = GeminiTranslator::new();
        let body = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": []},
                "finishReason": "UNEXPECTED_TOOL_CALL",
            }],
        });
        let resp = translator.from_upstream_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(resp.content[0], ContentBlock::Text { .. }));
    }
}
