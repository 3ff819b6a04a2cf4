//! Provider adapters
//!
//! Transforming provider payloads beyond what the scheduler needs is a
//! non-goal: each adapter here does exactly one thing, parse a completed
//! upstream response (or a drained SSE stream) into a `UsageInput` the
//! accounting engine can bill. The request/response bodies themselves pass
//! through unmodified. Dispatch is a trait-object enum per provider, with
//! each adapter body kept intentionally thin.

pub mod anthropic;
pub mod bedrock;
pub mod droid;
pub mod gemini;
pub mod openai;

use serde_json::Value;

use crate::pricing::UsageInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
    Bedrock,
    Droid,
}

pub trait UsageExtractor {
    /// Extracts token usage from a completed (non-streaming) JSON body.
    fn extract_from_body(&self, body: &Value) -> UsageInput;

    /// Extracts token usage from the final accumulated SSE event of a
    /// stream (providers emit a terminal usage-bearing event; everything
    /// before it is passthrough bytes the core never inspects).
    fn extract_from_final_sse_event(&self, event_data: &Value) -> UsageInput {
        self.extract_from_body(event_data)
    }
}

pub fn get_extractor(kind: ProviderKind) -> Box<dyn UsageExtractor + Send + Sync> {
    match kind {
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicAdapter),
        ProviderKind::OpenAi => Box::new(openai::OpenAiAdapter),
        ProviderKind::Gemini => Box::new(gemini::GeminiAdapter),
        ProviderKind::Bedrock => Box::new(bedrock::BedrockAdapter),
        ProviderKind::Droid => Box::new(droid::DroidAdapter),
    }
}

fn as_i64(v: &Value, field: &str) -> i64 {
    v.get(field).and_then(|x| x.as_i64()).unwrap_or(0)
}
