//! Upstream Account / Account Group data model
//!
//! One physical hash per platform (`claude:account:<id>`,
//! `openai:account:<id>`, …) but a single Rust shape: every platform variant
//! carries the same scheduler-relevant fields. Provider-specific
//! fetch/update lives behind `AccountStore` rather than multiplying structs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    ClaudeOfficial,
    ClaudeConsole,
    Openai,
    OpenaiResponses,
    Gemini,
    GeminiApi,
    Bedrock,
    Droid,
    Ccr,
    AzureOpenai,
}

impl Platform {
    pub fn account_key_prefix(self) -> &'static str {
        match self {
            Platform::ClaudeOfficial | Platform::ClaudeConsole => "claude",
            Platform::Openai => "openai",
            Platform::OpenaiResponses => "openai_responses_account",
            Platform::Gemini | Platform::GeminiApi => "gemini",
            Platform::Bedrock => "bedrock",
            Platform::Droid => "droid",
            Platform::Ccr => "ccr",
            Platform::AzureOpenai => "azure_openai",
        }
    }

    pub fn account_hash_key(self, id: &str) -> String {
        match self {
            Platform::OpenaiResponses => format!("openai_responses_account:{id}"),
            _ => format!("{}:account:{id}", self.account_key_prefix()),
        }
    }

    pub fn index_key(self) -> String {
        format!("{}:account:index", self.account_key_prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Blocked,
    Unauthorized,
    Error,
    TempError,
}

impl AccountStatus {
    pub fn is_schedulable_status(self) -> bool {
        matches!(self, AccountStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Shared,
    Dedicated,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Anthropic,
    Openai,
    Comm,
}

/// The union of fields the scheduler needs from any platform's account
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    /// Encrypted credential material (`hex(iv):hex(ct)` or legacy plaintext).
    pub encrypted_credential: String,
    pub endpoint_type: Option<EndpointType>,
    pub base_url: Option<String>,
    pub priority: i32,
    pub account_type: AccountType,
    pub group_ids: Vec<String>,
    pub is_active: bool,
    pub schedulable: bool,
    pub status: AccountStatus,
    pub rate_limited_at: Option<i64>,
    pub model_mapping: std::collections::HashMap<String, String>,
    pub supported_models: Vec<String>,
    pub subscription_expires_at: Option<i64>,
    pub created_at: i64,
    pub last_used_at: i64,
}

impl Account {
    pub fn default_priority() -> i32 {
        50
    }

    pub fn supports_model(&self, requested_model: &str) -> bool {
        let requested = requested_model.to_lowercase();
        let supported_ok = self.supported_models.is_empty()
            || self.supported_models.iter().any(|m| m.to_lowercase() == requested);
        let mapping_ok = self.model_mapping.is_empty()
            || self.model_mapping.keys().any(|m| m.to_lowercase() == requested);
        supported_ok && mapping_ok
    }

    pub fn supports_endpoint(&self, requested: EndpointType) -> bool {
        match self.endpoint_type {
            None => true,
            Some(EndpointType::Comm) => true,
            Some(own) => match requested {
                EndpointType::Comm => true,
                EndpointType::Anthropic | EndpointType::Openai => {
                    own == requested || matches!(own, EndpointType::Anthropic | EndpointType::Openai)
                }
            },
        }
    }

    pub fn is_candidate(&self) -> bool {
        self.is_active
            && self.schedulable
            && !matches!(
                self.status,
                AccountStatus::Error | AccountStatus::Unauthorized | AccountStatus::Blocked | AccountStatus::TempError
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroup {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A key's platform binding, which may point at a single account, a group,
/// or be unset (meaning: schedule from the whole shared pool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    None,
    Account(String),
    Group(String),
}

pub fn parse_binding(raw: &Option<String>) -> Binding {
    match raw {
        None => Binding::None,
        Some(s) if s.is_empty() => Binding::None,
        Some(s) => {
            if let Some(gid) = s.strip_prefix("group:") {
                Binding::Group(gid.to_string())
            } else if let Some(id) = s.strip_prefix("api:") {
                Binding::Account(id.to_string())
            } else if let Some(id) = s.strip_prefix("responses:") {
                Binding::Account(id.to_string())
            } else {
                Binding::Account(s.to_string())
            }
        }
    }
}

pub struct AccountStore<'a> {
    kv: &'a KvStore,
}

impl<'a> AccountStore<'a> {
    pub fn new(kv: &'a KvStore) -> Self {
        Self { kv }
    }

    pub async fn load(&self, platform: Platform, id: &str) -> AppResult<Option<Account>> {
        let data = self.kv.hgetall(&platform.account_hash_key(id)).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_account(id, platform, &data)))
    }

    pub async fn load_many(&self, platform: Platform, ids: &[String]) -> AppResult<HashMap<String, Account>> {
        let mut out = HashMap::new();
        for id in ids {
            if let Some(account) = self.load(platform, id).await? {
                out.insert(id.clone(), account);
            }
        }
        Ok(out)
    }
}

pub fn group_members_key(group_id: &str) -> String {
    format!("account_group_members:{group_id}")
}

pub fn group_reverse_key(platform: Platform, account_id: &str) -> String {
    format!("account_groups_reverse:{}:{account_id}", platform.account_key_prefix())
}

/// Rebuilds both directions of account/group membership from each account's
/// own `groupIds` field, the data an admin writes to the account hash. Scans
/// every platform's account index, then for every account reconciles
/// `account_groups_reverse:<platform>:<accountId>` and `account_group_
/// members:<groupId>` with its current `groupIds`, adding what's missing and
/// dropping what's no longer there. Idempotent, so it doubles as both the
/// boot-time build and the periodic resync that picks up membership changes
/// made outside this process.
pub async fn rebuild_group_membership_index(kv: &KvStore) -> AppResult<()> {
    const PLATFORMS: [Platform; 8] = [
        Platform::ClaudeOfficial,
        Platform::Openai,
        Platform::OpenaiResponses,
        Platform::Gemini,
        Platform::Bedrock,
        Platform::Droid,
        Platform::Ccr,
        Platform::AzureOpenai,
    ];

    let store = AccountStore::new(kv);
    for platform in PLATFORMS {
        let scan_pattern = format!("{}:account:*", platform.account_key_prefix());
        let ids = crate::indexing::get_all_ids_by_index(
            kv,
            &platform.index_key(),
            &scan_pattern,
            crate::indexing::extract_last_segment,
        )
        .await?;

        for id in ids {
            let Some(account) = store.load(platform, &id).await? else { continue };
            let reverse_key = group_reverse_key(account.platform, &id);
            let tracked = kv.smembers(&reverse_key).await?;

            for stale_gid in tracked.iter().filter(|g| !account.group_ids.contains(g)) {
                kv.srem(&reverse_key, stale_gid).await?;
                kv.srem(&group_members_key(stale_gid), &id).await?;
            }
            for gid in &account.group_ids {
                kv.sadd(&reverse_key, gid).await?;
                kv.sadd(&group_members_key(gid), &id).await?;
            }
        }
    }
    Ok(())
}

/// Runs `rebuild_group_membership_index` once immediately (the boot-time
/// build the indexing layer requires) and then on a fixed interval, so
/// group membership edits made outside this process still converge here,
/// the same polling-resync shape `pricing::refresh_loop` uses for a value
/// this process also doesn't own.
pub async fn group_membership_refresh_loop(kv: Arc<KvStore>, interval_secs: u64) {
    loop {
        if let Err(e) = rebuild_group_membership_index(&kv).await {
            crate::logger::warn("accounts", &format!("group membership index rebuild failed: {e}"));
        }
        tokio::time::sleep(std::time::Duration::from_secs(interval_secs.max(1))).await;
    }
}

/// Resolves a group's member account ids, preferring the forward
/// `account_group_members:<groupId>` set and falling back to a scan of
/// `account_groups_reverse:<platform>:*` for sets that contain `groupId`
/// when the forward set hasn't been populated yet, backfilling it from
/// whatever the scan finds.
pub async fn resolve_group_members(kv: &KvStore, platform_prefix: &str, group_id: &str) -> AppResult<Vec<String>> {
    let forward_key = group_members_key(group_id);
    let direct = kv.smembers(&forward_key).await?;
    if !direct.is_empty() {
        return Ok(direct);
    }

    let pattern = format!("account_groups_reverse:{platform_prefix}:*");
    let reverse_keys = kv.chunked_scan(&pattern, crate::kv::DEFAULT_SCAN_ITER_CAP).await?;
    let mut members = Vec::new();
    for key in &reverse_keys {
        let groups = kv.smembers(key).await?;
        if groups.iter().any(|g| g == group_id) {
            if let Some(account_id) = crate::indexing::extract_last_segment(key) {
                kv.sadd(&forward_key, &account_id).await?;
                members.push(account_id);
            }
        }
    }
    Ok(members)
}

fn decode_account(id: &str, platform: Platform, data: &HashMap<String, String>) -> Account {
    let get_bool = |field: &str, default: bool| data.get(field).map(|v| v == "true").unwrap_or(default);
    let get_i64 = |field: &str, default: i64| data.get(field).and_then(|v| v.parse().ok()).unwrap_or(default);
    let get_i32 = |field: &str, default: i32| data.get(field).and_then(|v| v.parse().ok()).unwrap_or(default);

    let status = match data.get("status").map(String::as_str) {
        Some("blocked") => AccountStatus::Blocked,
        Some("unauthorized") => AccountStatus::Unauthorized,
        Some("error") => AccountStatus::Error,
        Some("temp_error") => AccountStatus::TempError,
        _ => AccountStatus::Active,
    };
    let account_type = match data.get("accountType").map(String::as_str) {
        Some("dedicated") => AccountType::Dedicated,
        Some("group") => AccountType::Group,
        _ => AccountType::Shared,
    };
    // `claude:account:<id>` holds both claude-official and claude-console
    // accounts under the same key prefix/index; a stored `platform` field
    // (not the caller's guess) is what tells them apart, since a key's
    // `claudeAccountId` and `claudeConsoleAccountId` bindings resolve
    // against the same index but are scheduled as distinct pools.
    let platform = match data.get("platform").map(String::as_str) {
        Some("claude-console") => Platform::ClaudeConsole,
        Some("claude-official") => Platform::ClaudeOfficial,
        Some("openai-responses") => Platform::OpenaiResponses,
        Some("gemini-api") => Platform::GeminiApi,
        Some("azure-openai") => Platform::AzureOpenai,
        _ => platform,
    };
    let endpoint_type = match data.get("endpointType").map(String::as_str) {
        Some("anthropic") => Some(EndpointType::Anthropic),
        Some("openai") => Some(EndpointType::Openai),
        Some("comm") => Some(EndpointType::Comm),
        _ => None,
    };
    let split_csv = |field: &str| -> Vec<String> {
        data.get(field)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    };

    Account {
        id: id.to_string(),
        name: data.get("name").cloned().unwrap_or_default(),
        platform,
        encrypted_credential: data.get("encryptedCredential").cloned().unwrap_or_default(),
        endpoint_type,
        base_url: data.get("baseUrl").cloned(),
        priority: get_i32("priority", Account::default_priority()),
        account_type,
        group_ids: split_csv("groupIds"),
        is_active: get_bool("isActive", true),
        schedulable: get_bool("schedulable", true),
        status,
        rate_limited_at: data.get("rateLimitedAt").and_then(|v| v.parse().ok()),
        model_mapping: data
            .get("modelMapping")
            .and_then(|v| serde_json::from_str::<HashMap<String, String>>(v).ok())
            .unwrap_or_default(),
        supported_models: split_csv("supportedModels"),
        subscription_expires_at: data.get("subscriptionExpiresAt").and_then(|v| v.parse().ok()),
        created_at: get_i64("createdAt", 0),
        last_used_at: get_i64("lastUsedAt", 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_shapes() {
        assert_eq!(Platform::ClaudeOfficial.account_hash_key("a1"), "claude:account:a1");
        assert_eq!(Platform::OpenaiResponses.account_hash_key("a2"), "openai_responses_account:a2");
    }

    #[test]
    fn group_membership_key_shapes() {
        assert_eq!(group_members_key("g1"), "account_group_members:g1");
        assert_eq!(group_reverse_key(Platform::ClaudeOfficial, "a1"), "account_groups_reverse:claude:a1");
        assert_eq!(group_reverse_key(Platform::ClaudeConsole, "a1"), "account_groups_reverse:claude:a1");
    }

    #[test]
    fn binding_parses_prefixes() {
        assert_eq!(parse_binding(&Some("group:g1".into())), Binding::Group("g1".into()));
        assert_eq!(parse_binding(&Some("api:acc1".into())), Binding::Account("acc1".into()));
        assert_eq!(parse_binding(&Some("plain-id".into())), Binding::Account("plain-id".into()));
        assert_eq!(parse_binding(&None), Binding::None);
    }

    #[test]
    fn model_support_empty_lists_allow_any() {
        let acc = Account {
            id: "a".into(),
            name: "a".into(),
            platform: Platform::Openai,
            encrypted_credential: String::new(),
            endpoint_type: None,
            base_url: None,
            priority: 50,
            account_type: AccountType::Shared,
            group_ids: vec![],
            is_active: true,
            schedulable: true,
            status: AccountStatus::Active,
            rate_limited_at: None,
            model_mapping: Default::default(),
            supported_models: vec![],
            subscription_expires_at: None,
            created_at: 0,
            last_used_at: 0,
        };
        assert!(acc.supports_model("gpt-4o"));
        assert!(acc.is_candidate());
    }
}
