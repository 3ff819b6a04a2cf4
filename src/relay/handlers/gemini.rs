//! Gemini generateContent usage extraction.

use serde_json::Value;

use super::{as_i64, UsageExtractor};
use crate::pricing::UsageInput;

pub struct GeminiAdapter;

impl UsageExtractor for GeminiAdapter {
    fn extract_from_body(&self, body: &Value) -> UsageInput {
        let usage = body.get("usageMetadata").cloned().unwrap_or(Value::Null);

        UsageInput {
            input_tokens: as_i64(&usage, "promptTokenCount"),
            output_tokens: as_i64(&usage, "candidatesTokenCount"),
            cache_creation_tokens: 0,
            cache_read_tokens: as_i64(&usage, "cachedContentTokenCount"),
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
    fn extracts_usage_metadata() {
        let body = json!({
            "usageMetadata": {
                "promptTokenCount": 40,
                "candidatesTokenCount": 15,
                "cachedContentTokenCount": 5
            }
        });
        let usage = GeminiAdapter.extract_from_body(&body);
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.output_tokens, 15);
        assert_eq!(usage.cache_read_tokens, 5);
    }
}
