//! Anthropic Messages API usage extraction.

use serde_json::Value;

use super::{as_i64, UsageExtractor};
use crate::pricing::{CacheCreationSplit, UsageInput};

pub struct AnthropicAdapter;

impl UsageExtractor for AnthropicAdapter {
    fn extract_from_body(&self, body: &Value) -> UsageInput {
        let usage = body.get("usage").cloned().unwrap_or(Value::Null);

        let split = usage.get("cache_creation").map(|cc| CacheCreationSplit {
            ephemeral_5m_input_tokens: as_i64(cc, "ephemeral_5m_input_tokens"),
            ephemeral_1h_input_tokens: as_i64(cc, "ephemeral_1h_input_tokens"),
        });

        UsageInput {
            input_tokens: as_i64(&usage, "input_tokens"),
            output_tokens: as_i64(&usage, "output_tokens"),
            cache_creation_tokens: as_i64(&usage, "cache_creation_input_tokens"),
            cache_read_tokens: as_i64(&usage, "cache_read_input_tokens"),
            cache_creation_split: split,
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
    fn extracts_basic_usage() {
        let body = json!({
            "usage": {
                "input_tokens": 100,
                "output_tokens": 50,
                "cache_creation_input_tokens": 10,
                "cache_read_input_tokens": 5
            }
        });
        let usage = AnthropicAdapter.extract_from_body(&body);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.cache_creation_tokens, 10);
        assert_eq!(usage.cache_read_tokens, 5);
    }

    #[test]
    fn extracts_cache_creation_split() {
        let body = json!({
            "usage": {
                "input_tokens": 1,
                "output_tokens": 1,
                "cache_creation": { "ephemeral_5m_input_tokens": 7, "ephemeral_1h_input_tokens": 3 }
            }
        });
        let usage = AnthropicAdapter.extract_from_body(&body);
        let split = usage.cache_creation_split.unwrap();
        assert_eq!(split.ephemeral_5m_input_tokens, 7);
        assert_eq!(split.ephemeral_1h_input_tokens, 3);
    }
}
