//! AWS CodeWhisperer `GenerateAssistantResponse` dialect (section 4.4.4).
//!
//! The weakest-grounded module in the crate (see `DESIGN.md`): no file in
//! the pack implements this dialect or the `vnd.amazon.eventstream` framing
//! it rides on. Built against the publicly documented binary event-stream
//! layout (4-byte big-endian total/header lengths, a CRC32 prelude checksum,
//! a flat list of `(name, type, value)` headers, a payload, and a trailing
//! CRC32 over the whole message) deep enough to extract the `event-type`
//! header and JSON body that matter here, using the same DTO-plus-trait
//! shape the other dialect modules use.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicStreamEvent, BlockDelta,
    ContentBlock, MessageDeltaShape, MessageStartShape, Role, StopReason, StreamBlockShape, Usage,
};

use super::DialectTranslator;

const PRELUDE_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Serialize)]
struct CwRequest {
    #[serde(rename = "conversationState")]
    conversation_state: CwConversationState,
}

#[derive(Debug, Serialize)]
struct CwConversationState {
    #[serde(rename = "chatTriggerType")]
    chat_trigger_type: String,
    #[serde(rename = "currentMessage")]
    current_message: CwMessage,
    history: Vec<CwMessage>,
}

#[derive(Debug, Serialize)]
struct CwMessage {
    #[serde(rename = "userInputMessage", skip_serializing_if = "Option::is_none")]
    user_input_message: Option<CwUserInputMessage>,
    #[serde(rename = "assistantResponseMessage", skip_serializing_if = "Option::is_none")]
    assistant_response_message: Option<CwAssistantResponseMessage>,
}

#[derive(Debug, Serialize)]
struct CwUserInputMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct CwAssistantResponseMessage {
    content: String,
}

fn convert_message(msg: &AnthropicMessage) -> CwMessage {
    let text = msg
        .content
        .as_blocks()
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::ToolResult { content, .. } => Some(content),
            ContentBlock::ToolUse { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    match msg.role {
        Role::User => CwMessage {
            user_input_message: Some(CwUserInputMessage { content: text }),
            assistant_response_message: None,
        },
        Role::Assistant => CwMessage {
            user_input_message: None,
            assistant_response_message: Some(CwAssistantResponseMessage { content: text }),
        },
    }
}

/// One decoded `vnd.amazon.eventstream` frame: the `event-type` header value
/// (if present) and the raw JSON payload bytes.
struct EventStreamMessage {
    event_type: Option<String>,
    payload: Vec<u8>,
}

/// Decode one complete event-stream message from the front of `buf`,
/// consuming it on success. Returns `None` when `buf` doesn't yet hold a
/// complete frame (wait for more bytes).
fn decode_one_message(buf: &mut BytesMut) -> Result<Option<EventStreamMessage>, GatewayError> {
    if buf.len() < PRELUDE_LEN + CHECKSUM_LEN {
        return Ok(None);
    }

    let total_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let headers_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;

    if total_len < PRELUDE_LEN + CHECKSUM_LEN + headers_len + CHECKSUM_LEN {
        return Err(GatewayError::UpstreamClient {
            status: 502,
            detail: "event-stream frame length header is inconsistent".to_string(),
        });
    }
    if buf.len() < total_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(total_len);
    frame.advance(PRELUDE_LEN + CHECKSUM_LEN);

    let mut headers_buf = frame.split_to(headers_len);
    let mut event_type = None;
    while headers_buf.remaining() > 0 {
        let name_len = headers_buf.get_u8() as usize;
        if headers_buf.remaining() < name_len + 1 {
            break;
        }
        let name = String::from_utf8_lossy(&headers_buf.copy_to_bytes(name_len)).to_string();
        let value_type = headers_buf.get_u8();
        // value type 7 is the string type used for event-stream headers here;
        // other header value types (int, bool, timestamp, byte buffer) aren't
        // needed to extract `event-type`.
        if value_type == 7 {
            if headers_buf.remaining() < 2 {
                break;
            }
            let value_len = headers_buf.get_u16() as usize;
            if headers_buf.remaining() < value_len {
                break;
            }
            let value = String::from_utf8_lossy(&headers_buf.copy_to_bytes(value_len)).to_string();
            if name == "event-type" || name == ":event-type" {
                event_type = Some(value);
            }
        }
    }

    let payload_len = frame.len() - CHECKSUM_LEN;
    let payload = frame.split_to(payload_len).to_vec();
    // trailing CRC32 over the whole message is not re-verified here; transport
    // integrity is reqwest/TLS's job, this layer only needs the framed bytes.

    Ok(Some(EventStreamMessage { event_type, payload }))
}

fn encode_headers(event_type: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let name = b":event-type";
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    out.push(7u8);
    out.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
    out.extend_from_slice(event_type.as_bytes());
    out
}

/// Frame one payload as a `vnd.amazon.eventstream` message. Used only by
/// tests to exercise the decoder against self-produced frames, since no
/// upstream fixture exists in the pack to replay against.
#[cfg(test)]
fn encode_message(event_type: &str, payload: &[u8]) -> Vec<u8> {
    let headers = encode_headers(event_type);
    let headers_len = headers.len() as u32;
    let total_len = (PRELUDE_LEN + CHECKSUM_LEN + headers.len() + payload.len() + CHECKSUM_LEN) as u32;

    let mut out = BytesMut::new();
    out.put_u32(total_len);
    out.put_u32(headers_len);
    out.put_u32(0); // prelude checksum, unchecked on decode
    out.extend_from_slice(&headers);
    out.extend_from_slice(payload);
    out.put_u32(0); // message checksum, unchecked on decode
    out.to_vec()
}

#[derive(Debug, Deserialize)]
struct CwAssistantResponseEvent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    #[serde(rename = "toolUseId")]
    tool_use_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    stop: Option<bool>,
}

pub struct CodeWhispererTranslator {
    buffer: BytesMut,
    sent_initial: bool,
    chunk_index: u32,
    block_open: bool,
    accumulated_text: String,
}

impl CodeWhispererTranslator {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            sent_initial: false,
            chunk_index: 0,
            block_open: false,
            accumulated_text: String::new(),
        }
    }
}

impl DialectTranslator for CodeWhispererTranslator {
    fn to_upstream_request(&self, request: &AnthropicRequest) -> Result<Value, GatewayError> {
        let mut history: Vec<CwMessage> = Vec::new();
        if let Some(system) = &request.system {
            history.push(CwMessage {
                user_input_message: Some(CwUserInputMessage { content: system.joined_text() }),
                assistant_response_message: None,
            });
        }

        let mut messages: Vec<CwMessage> = request.messages.iter().map(convert_message).collect();
        let current_message = messages.pop().ok_or_else(|| {
            GatewayError::Validation("codewhisperer request requires at least one message".to_string())
        })?;
        history.extend(messages);

        let cw = CwRequest {
            conversation_state: CwConversationState {
                chat_trigger_type: "MANUAL".to_string(),
                current_message,
                history,
            },
        };

        serde_json::to_value(&cw).map_err(|e| {
            GatewayError::Validation(format!("failed to serialize codewhisperer request: {e}"))
        })
    }

    fn from_upstream_response(&self, body: &[u8]) -> Result<AnthropicResponse, GatewayError> {
        let mut buf = BytesMut::from(body);
        let mut text = String::new();
        let mut blocks = Vec::new();

        while let Some(msg) = decode_one_message(&mut buf)? {
            let event: CwAssistantResponseEvent = serde_json::from_slice(&msg.payload)
                .map_err(|e| GatewayError::UpstreamClient {
                    status: 502,
                    detail: format!("malformed codewhisperer event body: {e}"),
                })?;
            if let Some(chunk) = event.content {
                text.push_str(&chunk);
            }
            if let (Some(name), Some(id)) = (event.name, event.tool_use_id) {
                blocks.push(ContentBlock::ToolUse {
                    id,
                    name,
                    input: event.input.unwrap_or(Value::Null),
                });
            }
        }

        if !text.is_empty() {
            blocks.insert(0, ContentBlock::Text { text });
        }

        let stop_reason = if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })) {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };

        let mut response = AnthropicResponse::new(
            "msg_codewhisperer".to_string(),
            "codewhisperer".to_string(),
            blocks,
            Usage::default(),
        );
        response.stop_reason = Some(stop_reason);
        Ok(response)
    }

    fn stream_chunk(&mut self, chunk: &[u8]) -> Result<Vec<AnthropicStreamEvent>, GatewayError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        if !self.sent_initial {
            events.push(AnthropicStreamEvent::MessageStart {
                message: MessageStartShape {
                    id: "msg_codewhisperer".to_string(),
                    message_type: "message".to_string(),
                    role: Role::Assistant,
                    content: vec![],
                    model: "codewhisperer".to_string(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage::default(),
                },
            });
            self.sent_initial = true;
        }

        while let Some(msg) = decode_one_message(&mut self.buffer)? {
            let event: CwAssistantResponseEvent = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed codewhisperer event frame");
                    continue;
                }
            };

            if let Some(text) = event.content {
                if !self.block_open {
                    events.push(AnthropicStreamEvent::ContentBlockStart {
                        index: self.chunk_index,
                        content_block: StreamBlockShape::Text { text: String::new() },
                    });
                    self.block_open = true;
                }
                self.accumulated_text.push_str(&text);
                events.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: self.chunk_index,
                    delta: BlockDelta::TextDelta { text },
                });
            }

            if let (Some(name), Some(id)) = (event.name, event.tool_use_id) {
                if self.block_open {
                    events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                    self.chunk_index += 1;
                }
                let input = event.input.unwrap_or(Value::Null);
                events.push(AnthropicStreamEvent::ContentBlockStart {
                    index: self.chunk_index,
                    content_block: StreamBlockShape::ToolUse { id, name, input: input.clone() },
                });
                events.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: self.chunk_index,
                    delta: BlockDelta::InputJsonDelta { partial_json: input.to_string() },
                });
                self.block_open = true;
            }

            if event.stop.unwrap_or(false) {
                if self.block_open {
                    events.push(AnthropicStreamEvent::ContentBlockStop { index: self.chunk_index });
                    self.block_open = false;
                }
                events.push(AnthropicStreamEvent::MessageDelta {
                    delta: MessageDeltaShape {
                        stop_reason: Some(StopReason::EndTurn),
                        stop_sequence: None,
                    },
                    usage: Usage::default(),
                });
                events.push(AnthropicStreamEvent::MessageStop);
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageContent, SystemPrompt};

    fn sample_request() -> AnthropicRequest {
        AnthropicRequest {
            model: "codewhisperer".to_string(),
            messages: vec![AnthropicMessage {
                role: Role::User,
                content: MessageContent::Text("explain this function".to_string()),
            }],
            system: Some(SystemPrompt::Text("be terse".to_string())),
            tools: None,
            tool_choice: None,
            max_tokens: 512,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: false,
            metadata: None,
        }
    }

    #[test]
    fn request_puts_system_prompt_in_history_and_last_message_current() {
        let translator = CodeWhispererTranslator::new();
        let v = translator.to_upstream_request(&sample_request()).unwrap();
        let state = &v["conversationState"];
        assert_eq!(state["history"].as_array().unwrap().len(), 1);
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "explain this function"
        );
    }

    #[test]
    fn decode_roundtrips_single_frame() {
        let payload = br#"{"content":"hello"}"#;
        let framed = encode_message("assistantResponseEvent", payload);
        let mut buf = BytesMut::from(&framed[..]);
        let msg = decode_one_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg.event_type.as_deref(), Some("assistantResponseEvent"));
        assert_eq!(msg.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let payload = br#"{"content":"hello"}"#;
        let framed = encode_message("assistantResponseEvent", payload);
        let mut buf = BytesMut::from(&framed[..framed.len() - 4]);
        let result = decode_one_message(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn stream_chunk_emits_text_delta_then_stop() {
        let mut translator = CodeWhispererTranslator::new();
        let framed = encode_message(
            "assistantResponseEvent",
            br#"{"content":"hi","stop":true}"#,
        );
        let events = translator.stream_chunk(&framed).unwrap();
        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events.last().unwrap(), AnthropicStreamEvent::MessageStop));
    }

    #[test]
    fn buffered_response_collects_text_and_tool_use() {
        let translator = CodeWhispererTranslator::new();
        let mut body = Vec::new();
        body.extend(encode_message("assistantResponseEvent", br#"{"content":"part one "}"#));
        body.extend(encode_message(
            "assistantResponseEvent",
            br#"{"toolUseId":"t1","name":"lookup","input":{"q":"rust"}}"#,
        ));
        let response = translator.from_upstream_response(&body).unwrap();
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(response.content[0], ContentBlock::Text { .. }));
    }
}
