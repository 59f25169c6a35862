//! Transformer stage (section 4.4): converts between the canonical Anthropic
//! shapes in [`crate::model`] and each upstream dialect's wire format.
//!
//! Anthropic is always canonical on both ends of this boundary: Ingress
//! produces an `AnthropicRequest` before a translator ever sees it, and
//! every translator's job is to go the rest of the way to (and back from)
//! its one foreign dialect. There is no client-selectable canonical format.

pub mod codewhisperer;
pub mod gemini;
pub mod openai;

use crate::config::providers::DialectTag;
use crate::error::GatewayError;
use crate::model::{AnthropicRequest, AnthropicResponse, AnthropicStreamEvent};

/// One dialect's request/response conversion. Implementations hold whatever
/// per-stream state they need between calls to `stream_chunk` (accumulated
/// text, open block indices, a partial line buffer) — a fresh instance is
/// built per request, never shared across requests.
pub trait DialectTranslator: Send {
    /// Serialize a canonical request into the upstream dialect's JSON body.
    fn to_upstream_request(&self, request: &AnthropicRequest) -> Result<serde_json::Value, GatewayError>;

    /// Parse a complete (non-streaming) upstream response back to canonical shape.
    fn from_upstream_response(&self, body: &[u8]) -> Result<AnthropicResponse, GatewayError>;

    /// Feed one raw chunk of the upstream stream, returning zero or more
    /// canonical Anthropic stream events ready to re-frame as SSE.
    fn stream_chunk(&mut self, chunk: &[u8]) -> Result<Vec<AnthropicStreamEvent>, GatewayError>;
}

/// Build a fresh translator instance for one request.
pub fn translator_for(dialect: DialectTag) -> Box<dyn DialectTranslator> {
    match dialect {
        DialectTag::Openai => Box::new(openai::OpenAiTranslator::new()),
        DialectTag::Gemini => Box::new(gemini::GeminiTranslator::new()),
        DialectTag::Codewhisperer => Box::new(codewhisperer::CodeWhispererTranslator::new()),
        // lmstudio sits on top of the OpenAI wire dialect; the compatibility
        // adapter layer (section 4.6) handles its quirks on top of this.
        DialectTag::Lmstudio => Box::new(openai::OpenAiTranslator::new()),
    }
}
