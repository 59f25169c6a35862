//! lmstudio adapter (section 4.6): virtual-model-name remapping for locally
//! hosted MLX models, plus extraction of text-embedded tool calls that some
//! locally-served models emit instead of a proper `tool_calls` array.
//!
//! No file in the retrieval pack implements text-embedded tool-call
//! extraction — this is built directly against the four documented forms
//! (GLM-style `Tool call: Name({...})`, bare function-call-style
//! `Name({...})`, bracketed `[Name({...})]`, and the gpt-oss "harmony"
//! channel-commentary form) and the tutorial/quoted-example heuristics in
//! the same spirit as the teacher's general "don't trust upstream content
//! blindly" posture, without a specific file to adapt from. See
//! `DESIGN.md`.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::GatewayError;

use super::CompatibilityAdapter;

#[derive(Default)]
pub struct LmStudioAdapter {
    model_remap: HashMap<String, String>,
    known_loaded: Option<Vec<String>>,
}

impl LmStudioAdapter {
    pub fn from_settings(settings: &HashMap<String, Value>) -> Self {
        let model_remap = settings
            .get("modelRemap")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let known_loaded = settings
            .get("knownLoadedModels")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());

        Self { model_remap, known_loaded }
    }
}

impl CompatibilityAdapter for LmStudioAdapter {
    fn adapt_request(&self, body: &mut Value) -> Result<(), GatewayError> {
        let Some(model_field) = body.get("model").and_then(|v| v.as_str()) else {
            return Ok(());
        };

        let resolved = self
            .model_remap
            .get(model_field)
            .cloned()
            .unwrap_or_else(|| model_field.to_string());

        if let Some(known) = &self.known_loaded {
            if !known.contains(&resolved) {
                return Err(GatewayError::UpstreamClient {
                    status: 424,
                    detail: format!("lmstudio model '{}' is not in the known-loaded set", resolved),
                });
            }
        }

        body["model"] = Value::String(resolved);
        Ok(())
    }

    fn adapt_response(&self, body: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
        let mut value: Value = serde_json::from_slice(&body).map_err(|e| GatewayError::UpstreamClient {
            status: 502,
            detail: format!("lmstudio response is not valid json: {e}"),
        })?;

        if let Some(choices) = value.get_mut("choices").and_then(|c| c.as_array_mut()) {
            for choice in choices {
                extract_tool_call_in_choice(choice);
            }
        }

        serde_json::to_vec(&value).map_err(|e| GatewayError::UpstreamClient {
            status: 502,
            detail: format!("failed to re-serialize lmstudio response: {e}"),
        })
    }
}

fn extract_tool_call_in_choice(choice: &mut Value) {
    let Some(message) = choice.get_mut("message") else { return };
    let already_has_tool_calls = message
        .get("tool_calls")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    if already_has_tool_calls {
        return;
    }
    let Some(content) = message.get("content").and_then(|v| v.as_str()) else { return };

    let Some(extracted) = extract_embedded_tool_call(content) else { return };

    message["tool_calls"] = Value::Array(vec![serde_json::json!({
        "id": format!("call_{}", extracted.name),
        "type": "function",
        "function": { "name": extracted.name, "arguments": extracted.arguments_json },
    })]);
    message["content"] = Value::Null;
}

struct ExtractedToolCall {
    name: String,
    arguments_json: String,
}

/// One match of an embedded call: byte range in the source text, the
/// extracted name, and its (still-stringified) JSON argument body.
type CallMatch = (usize, usize, String, String);

/// Tries each documented embedded-call syntax in turn (tightest first) and
/// returns the first match that also survives the tutorial/quoted-example
/// heuristic — returning `None` otherwise, including when every match looks
/// like a tutorial example.
fn extract_embedded_tool_call(text: &str) -> Option<ExtractedToolCall> {
    const FINDERS: [fn(&str) -> Option<CallMatch>; 4] =
        [find_channel_commentary_call, find_bracketed_call, find_glm_style_call, find_bare_function_call];

    for finder in FINDERS {
        if let Some((match_start, match_end, name, arguments_json)) = finder(text) {
            if !looks_like_tutorial_context(text, match_start, match_end) {
                return Some(ExtractedToolCall { name, arguments_json });
            }
        }
    }
    None
}

/// GLM-style: `Tool call: Name({...})`.
fn find_glm_style_call(text: &str) -> Option<CallMatch> {
    let marker = "Tool call:";
    let marker_pos = text.find(marker)?;
    let after_marker = &text[marker_pos + marker.len()..];

    let name_start = after_marker.find(|c: char| !c.is_whitespace())?;
    let rest = &after_marker[name_start..];
    let name_end = rest.find('(')?;
    let name = rest[..name_end].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    let after_paren = &rest[name_end + 1..];
    let json_start = after_paren.find('{')?;
    let (json_body, after_json_end) = take_balanced_braces(&after_paren[json_start..])?;
    let after_call = after_json_end.strip_prefix(')')?;

    let match_start = marker_pos;
    let match_end = text.len() - after_call.len();
    Some((match_start, match_end, name.to_string(), json_body.to_string()))
}

/// Bare function-call-style: a plain identifier (optionally dotted, e.g.
/// `functions.get_time`) immediately applied to a single JSON-object
/// argument, with no `Tool call:` marker or brackets around it.
fn find_bare_function_call(text: &str) -> Option<CallMatch> {
    let mut search_from = 0usize;
    while let Some(rel) = text[search_from..].find('(') {
        let paren_idx = search_from + rel;
        let before = &text[..paren_idx];
        let ident_start = before.rfind(|c: char| !(c.is_alphanumeric() || c == '_')).map(|i| i + 1).unwrap_or(0);
        let name = &before[ident_start..];

        if name.is_empty() || name.chars().next().map(|c| c.is_numeric()).unwrap_or(true) {
            search_from = paren_idx + 1;
            continue;
        }

        let after_paren = &text[paren_idx + 1..];
        let trimmed = after_paren.trim_start();
        if !trimmed.starts_with('{') {
            search_from = paren_idx + 1;
            continue;
        }
        let Some((json_body, after_json)) = take_balanced_braces(trimmed) else {
            search_from = paren_idx + 1;
            continue;
        };
        let Some(after_call) = after_json.strip_prefix(')') else {
            search_from = paren_idx + 1;
            continue;
        };

        let match_start = ident_start;
        let match_end = text.len() - after_call.len();
        return Some((match_start, match_end, name.to_string(), json_body.to_string()));
    }
    None
}

/// Bracketed: `[Name({...})]`.
fn find_bracketed_call(text: &str) -> Option<CallMatch> {
    let mut search_from = 0usize;
    while let Some(rel) = text[search_from..].find('[') {
        let bracket_idx = search_from + rel;
        let after_bracket = &text[bracket_idx + 1..];
        let name_region = after_bracket.trim_start();

        let Some(paren_rel) = name_region.find('(') else {
            search_from = bracket_idx + 1;
            continue;
        };
        let name = name_region[..paren_rel].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            search_from = bracket_idx + 1;
            continue;
        }

        let after_paren = &name_region[paren_rel + 1..];
        let Some(brace_rel) = after_paren.find('{') else {
            search_from = bracket_idx + 1;
            continue;
        };
        if !after_paren[..brace_rel].chars().all(char::is_whitespace) {
            search_from = bracket_idx + 1;
            continue;
        }
        let Some((json_body, after_json)) = take_balanced_braces(&after_paren[brace_rel..]) else {
            search_from = bracket_idx + 1;
            continue;
        };
        let Some(after_call) = after_json.strip_prefix(')') else {
            search_from = bracket_idx + 1;
            continue;
        };
        let Some(after_close) = after_call.strip_prefix(']') else {
            search_from = bracket_idx + 1;
            continue;
        };

        let match_start = bracket_idx;
        let match_end = text.len() - after_close.len();
        return Some((match_start, match_end, name.to_string(), json_body.to_string()));
    }
    None
}

/// OpenAI "harmony" channel-commentary form, as emitted by gpt-oss models
/// served locally through lmstudio:
/// `<|channel|>commentary to=functions.Name<|message|>{...}<|call|>`.
fn find_channel_commentary_call(text: &str) -> Option<CallMatch> {
    let marker = "<|channel|>commentary to=functions.";
    let message_marker = "<|message|>";
    let call_marker = "<|call|>";

    let mut search_from = 0usize;
    while let Some(rel) = text[search_from..].find(marker) {
        let start = search_from + rel;
        let after_marker = &text[start + marker.len()..];

        let Some(name_end) = after_marker.find(|c: char| c.is_whitespace() || c == '<') else {
            search_from = start + marker.len();
            continue;
        };
        let name = &after_marker[..name_end];
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            search_from = start + marker.len();
            continue;
        }

        let after_name = &after_marker[name_end..];
        let Some(msg_rel) = after_name.find(message_marker) else {
            search_from = start + marker.len();
            continue;
        };
        let after_message = after_name[msg_rel + message_marker.len()..].trim_start();
        if !after_message.starts_with('{') {
            search_from = start + marker.len();
            continue;
        }
        let Some((json_body, after_json)) = take_balanced_braces(after_message) else {
            search_from = start + marker.len();
            continue;
        };
        let Some(after_call) = after_json.trim_start().strip_prefix(call_marker) else {
            search_from = start + marker.len();
            continue;
        };

        let match_start = start;
        let match_end = text.len() - after_call.len();
        return Some((match_start, match_end, name.to_string(), json_body.to_string()));
    }
    None
}

/// Given a string starting with `{`, returns the balanced-brace substring
/// (inclusive) and the remainder after it.
fn take_balanced_braces(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[..=i], &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn looks_like_tutorial_context(text: &str, match_start: usize, match_end: usize) -> bool {
    let before = &text[..match_start];
    let after = &text[match_end..];

    let trailing_is_trivial = after
        .trim()
        .chars()
        .all(|c| c.is_ascii_punctuation() || c.is_whitespace());
    if !trailing_is_trivial {
        return true;
    }

    let fence_count_before = before.matches("```").count();
    if fence_count_before % 2 == 1 {
        return true; // inside an open fenced code block
    }

    let lower_before = before.to_lowercase();
    lower_before.contains("example") || lower_before.contains("here is how")
}
