//! Bedrock (Anthropic-on-Bedrock) usage extraction, same response shape as
//! the Anthropic Messages API once unwrapped from the Bedrock envelope.

use serde_json::Value;

use super::{as_i64, UsageExtractor};
use crate::pricing::UsageInput;

pub struct BedrockAdapter;

impl UsageExtractor for BedrockAdapter {
    fn extract_from_body(&self, body: &Value) -> UsageInput {
        let usage = body.get("usage").cloned().unwrap_or(Value::Null);
        UsageInput {
            input_tokens: as_i64(&usage, "input_tokens"),
            output_tokens: as_i64(&usage, "output_tokens"),
            cache_creation_tokens: as_i64(&usage, "cache_creation_input_tokens"),
            cache_read_tokens: as_i64(&usage, "cache_read_input_tokens"),
            cache_creation_split: None,
            anthropic_beta: vec![],
            request_speed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_bedrock_usage() {
        let body = json!({ "usage": { "input_tokens": 10, "output_tokens": 5 } });
        let usage = BedrockAdapter.extract_from_body(&body);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }
}
