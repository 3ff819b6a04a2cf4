//! Client Validator
//!
//! Restricts an API Key to specific client User-Agents and path prefixes.
//! Matching is a simple allow-list: a key with `allowedClients` set must
//! have at least one client type whose UA matcher AND path whitelist both
//! accept the incoming request.

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    ClaudeCode,
    GeminiCli,
    CodexCli,
    DroidCli,
}

impl ClientType {
    pub fn id(self) -> &'static str {
        match self {
            ClientType::ClaudeCode => "claude_code",
            ClientType::GeminiCli => "gemini_cli",
            ClientType::CodexCli => "codex_cli",
            ClientType::DroidCli => "droid_cli",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "claude_code" => Some(ClientType::ClaudeCode),
            "gemini_cli" => Some(ClientType::GeminiCli),
            "codex_cli" => Some(ClientType::CodexCli),
            "droid_cli" => Some(ClientType::DroidCli),
            _ => None,
        }
    }

    fn user_agent_matches(self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        match self {
            ClientType::ClaudeCode => ua.contains("claude-cli") || ua.contains("claude-code"),
            ClientType::GeminiCli => ua.contains("gemini-cli"),
            ClientType::CodexCli => ua.contains("codex"),
            ClientType::DroidCli => ua.contains("droid"),
        }
    }

    fn allowed_path_prefixes(self) -> &'static [&'static str] {
        match self {
            ClientType::ClaudeCode => &["/api/v1/messages", "/claude/v1/messages"],
            ClientType::GeminiCli => &["/gemini/"],
            ClientType::CodexCli => &["/openai/responses", "/openai/v1/responses"],
            ClientType::DroidCli => &["/droid/claude/", "/droid/openai/"],
        }
    }

    fn allows_path(self, path: &str) -> bool {
        self.allowed_path_prefixes().iter().any(|p| path.starts_with(p))
    }
}

/// Validates an incoming request against a key's `allowedClients` list. No
/// restriction configured ⇒ always allowed.
pub fn validate(allowed_clients: &[String], user_agent: &str, path: &str) -> AppResult<()> {
    if allowed_clients.is_empty() {
        return Ok(());
    }

    let ok = allowed_clients
        .iter()
        .filter_map(|id| ClientType::from_id(id))
        .any(|ct| ct.user_agent_matches(user_agent) && ct.allows_path(path));

    if ok {
        Ok(())
    } else {
        Err(AppError::ClientNotAllowed(format!(
            "user-agent/path not permitted for this key: ua={user_agent} path={path}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_code_allows_its_own_path_never_chat_completions() {
        assert!(validate(&["claude_code".into()], "claude-cli/1.0", "/api/v1/messages").is_ok());
        assert!(validate(&["claude_code".into()], "claude-cli/1.0", "/v1/chat/completions").is_err());
    }

    #[test]
    fn empty_allowlist_permits_everything() {
        assert!(validate(&[], "anything", "/anything").is_ok());
    }

    #[test]
    fn wrong_user_agent_rejected() {
        assert!(validate(&["claude_code".into()], "curl/8.0", "/api/v1/messages").is_err());
    }
}
