//! OpenAI Chat/Responses API usage extraction.

use serde_json::Value;

use super::{as_i64, UsageExtractor};
use crate::pricing::UsageInput;

pub struct OpenAiAdapter;

impl UsageExtractor for OpenAiAdapter {
    fn extract_from_body(&self, body: &Value) -> UsageInput {
        let usage = body.get("usage").cloned().unwrap_or(Value::Null);

        let prompt_details = usage.get("prompt_tokens_details").cloned().unwrap_or(Value::Null);
        let cached = as_i64(&prompt_details, "cached_tokens");
        let prompt_tokens = as_i64(&usage, "prompt_tokens");

        UsageInput {
            input_tokens: (prompt_tokens - cached).max(0),
            output_tokens: as_i64(&usage, "completion_tokens"),
            cache_creation_tokens: 0,
            cache_read_tokens: cached,
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
    fn splits_cached_prompt_tokens() {
        let body = json!({
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "prompt_tokens_details": { "cached_tokens": 20 }
            }
        });
        let usage = OpenAiAdapter.extract_from_body(&body);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cache_read_tokens, 20);
        assert_eq!(usage.output_tokens, 30);
    }
}
