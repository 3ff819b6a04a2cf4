//! Droid usage extraction. Droid accounts forward to either an Anthropic-
//! or OpenAI-shaped upstream depending on `endpointType`, so this adapter
//! tries both usage shapes and takes whichever is present.

use serde_json::Value;

use super::{as_i64, UsageExtractor};
use crate::pricing::UsageInput;

pub struct DroidAdapter;

impl UsageExtractor for DroidAdapter {
    fn extract_from_body(&self, body: &Value) -> UsageInput {
        if let Some(usage) = body.get("usage") {
            if usage.get("input_tokens").is_some() {
                return UsageInput {
                    input_tokens: as_i64(usage, "input_tokens"),
                    output_tokens: as_i64(usage, "output_tokens"),
                    cache_creation_tokens: as_i64(usage, "cache_creation_input_tokens"),
                    cache_read_tokens: as_i64(usage, "cache_read_input_tokens"),
                    cache_creation_split: None,
                    anthropic_beta: vec![],
                    request_speed: None,
                };
            }
            if usage.get("prompt_tokens").is_some() {
                return UsageInput {
                    input_tokens: as_i64(usage, "prompt_tokens"),
                    output_tokens: as_i64(usage, "completion_tokens"),
                    cache_creation_tokens: 0,
                    cache_read_tokens: 0,
                    cache_creation_split: None,
                    anthropic_beta: vec![],
                    request_speed: None,
                };
            }
        }
        UsageInput::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn falls_back_between_shapes() {
        let anthropic_shaped = json!({ "usage": { "input_tokens": 3, "output_tokens": 2 } });
        assert_eq!(DroidAdapter.extract_from_body(&anthropic_shaped).input_tokens, 3);

        let openai_shaped = json!({ "usage": { "prompt_tokens": 9, "completion_tokens": 4 } });
        assert_eq!(DroidAdapter.extract_from_body(&openai_shaped).input_tokens, 9);
    }
}
