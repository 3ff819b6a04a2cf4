//! API Key model, authentication and quota admission
//!
//! Covers the pre-admission checks from the control-plane spec: model
//! restriction, daily/total/weekly-Opus cost caps, the rate-limit window,
//! and concurrency/queue admission. All fail fast and in this order.

use std::collections::HashMap;

use redis::Script;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::kv::KvStore;
use crate::time_util;

/// Atomically rolls `window_start`/`requests`/`tokens`/`cost` to a fresh
/// window once `window` seconds have elapsed, then admits the request only
/// if doing so keeps `requests <= max_requests`. Folding the roll-and-check
/// into one script avoids the lost-update race a get/reset/get/incr round
/// trip would have under concurrent requests against the same key. Rolling
/// the tokens/cost counters here too (even though this call never touches
/// them otherwise) is what makes "on expiry the counters requests|tokens|cost
/// reset atomically" hold: a request admitted right after rollover must see
/// last window's token/cost spend as zero, not carried over.
static RATE_WINDOW_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local start_key = KEYS[1]
        local requests_key = KEYS[2]
        local tokens_key = KEYS[3]
        local cost_key = KEYS[4]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local max_requests = tonumber(ARGV[3])

        local window_start = tonumber(redis.call('GET', start_key))
        if not window_start or now - window_start >= window then
            redis.call('SET', start_key, now, 'EX', window)
            redis.call('SET', requests_key, 0, 'EX', window)
            redis.call('SET', tokens_key, 0, 'EX', window)
            redis.call('SET', cost_key, 0, 'EX', window)
            window_start = now
        end

        local current = tonumber(redis.call('GET', requests_key)) or 0
        local tokens = tonumber(redis.call('GET', tokens_key)) or 0
        local cost = tonumber(redis.call('GET', cost_key)) or 0
        if current + 1 > max_requests then
            return {0, tokens, cost}
        end
        redis.call('INCR', requests_key)
        return {1, tokens, cost}
        "#,
    )
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub hashed_key: String,
    pub name: String,
    pub tags: Vec<String>,
    pub is_active: bool,
    pub is_deleted: bool,
    pub owner_display_name: String,
    pub allowed_clients: Vec<String>,
    pub restricted_models: Vec<String>,
    pub enable_model_restriction: bool,
    pub token_limit: Option<i64>,
    pub daily_cost_limit: Option<f64>,
    pub total_cost_limit: Option<f64>,
    pub weekly_opus_cost_limit: Option<f64>,
    pub weekly_reset_day: u32,
    pub weekly_reset_hour: u32,
    pub rate_limit_window: i64,
    pub rate_limit_requests: Option<i64>,
    pub rate_limit_tokens: Option<i64>,
    pub rate_limit_cost: Option<f64>,
    pub max_concurrency: i64,
    pub activation_duration: Option<i64>,
    pub service_rates: HashMap<String, f64>,
    pub claude_account_id: Option<String>,
    pub claude_console_account_id: Option<String>,
    pub gemini_account_id: Option<String>,
    pub openai_account_id: Option<String>,
    pub bedrock_account_id: Option<String>,
    pub droid_account_id: Option<String>,
    pub ccr_account_id: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub last_used_at: i64,
    pub first_used_at: Option<i64>,
}

impl Default for ApiKey {
    fn default() -> Self {
        Self {
            id: String::new(),
            hashed_key: String::new(),
            name: String::new(),
            tags: vec![],
            is_active: true,
            is_deleted: false,
            owner_display_name: String::new(),
            allowed_clients: vec![],
            restricted_models: vec![],
            enable_model_restriction: false,
            token_limit: None,
            daily_cost_limit: None,
            total_cost_limit: None,
            weekly_opus_cost_limit: None,
            weekly_reset_day: 1,
            weekly_reset_hour: 0,
            rate_limit_window: 60,
            rate_limit_requests: None,
            rate_limit_tokens: None,
            rate_limit_cost: None,
            max_concurrency: 0,
            activation_duration: None,
            service_rates: HashMap::new(),
            claude_account_id: None,
            claude_console_account_id: None,
            gemini_account_id: None,
            openai_account_id: None,
            bedrock_account_id: None,
            droid_account_id: None,
            ccr_account_id: None,
            expires_at: None,
            created_at: 0,
            last_used_at: 0,
            first_used_at: None,
        }
    }
}

pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ApiKeyStore<'a> {
    kv: &'a KvStore,
}

impl<'a> ApiKeyStore<'a> {
    pub fn new(kv: &'a KvStore) -> Self {
        Self { kv }
    }

    /// Resolves a plaintext key to its id via `apikey:hash_map`, falling
    /// back to the legacy single-row structure and back-filling the map on
    /// a legacy hit.
    pub async fn resolve_key_id(&self, plaintext: &str) -> AppResult<String> {
        let hashed = hash_key(plaintext);

        if let Some(key_id) = self.kv.hget("apikey:hash_map", &hashed).await? {
            if self.kv.hgetall(&format!("apikey:{key_id}")).await?.is_empty() {
                self.kv.hdel("apikey:hash_map", &hashed).await?;
                return Err(AppError::InvalidCredentials);
            }
            return Ok(key_id);
        }

        let legacy_key = format!("apikey_hash:{hashed}");
        let legacy = self.kv.hgetall(&legacy_key).await?;
        if let Some(key_id) = legacy.get("keyId") {
            self.kv.hset("apikey:hash_map", &hashed, key_id).await?;
            return Ok(key_id.clone());
        }

        Err(AppError::InvalidCredentials)
    }

    pub async fn load(&self, key_id: &str) -> AppResult<ApiKey> {
        let data = self.kv.hgetall(&format!("apikey:{key_id}")).await?;
        if data.is_empty() {
            return Err(AppError::InvalidCredentials);
        }
        Ok(decode_api_key(key_id, &data))
    }
}

fn decode_api_key(id: &str, data: &HashMap<String, String>) -> ApiKey {
    let mut key = ApiKey {
        id: id.to_string(),
        ..Default::default()
    };
    if let Some(v) = data.get("hashedKey") {
        key.hashed_key = v.clone();
    }
    if let Some(v) = data.get("name") {
        key.name = v.clone();
    }
    if let Some(v) = data.get("isActive") {
        key.is_active = v == "true";
    }
    if let Some(v) = data.get("isDeleted") {
        key.is_deleted = v == "true";
    }
    if let Some(v) = data.get("enableModelRestriction") {
        key.enable_model_restriction = v == "true";
    }
    if let Some(v) = data.get("restrictedModels") {
        key.restricted_models = v.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
    }
    if let Some(v) = data.get("allowedClients") {
        key.allowed_clients = v.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
    }
    if let Some(v) = data.get("dailyCostLimit").and_then(|s| s.parse().ok()) {
        key.daily_cost_limit = Some(v);
    }
    if let Some(v) = data.get("totalCostLimit").and_then(|s| s.parse().ok()) {
        key.total_cost_limit = Some(v);
    }
    if let Some(v) = data.get("weeklyOpusCostLimit").and_then(|s| s.parse().ok()) {
        key.weekly_opus_cost_limit = Some(v);
    }
    if let Some(v) = data.get("weeklyResetDay").and_then(|s| s.parse().ok()) {
        key.weekly_reset_day = v;
    }
    if let Some(v) = data.get("weeklyResetHour").and_then(|s| s.parse().ok()) {
        key.weekly_reset_hour = v;
    }
    if let Some(v) = data.get("rateLimitWindow").and_then(|s| s.parse().ok()) {
        key.rate_limit_window = v;
    }
    if let Some(v) = data.get("rateLimitRequests").and_then(|s| s.parse().ok()) {
        key.rate_limit_requests = Some(v);
    }
    if let Some(v) = data.get("rateLimitTokens").and_then(|s| s.parse().ok()) {
        key.rate_limit_tokens = Some(v);
    }
    if let Some(v) = data.get("rateLimitCost").and_then(|s| s.parse().ok()) {
        key.rate_limit_cost = Some(v);
    }
    if let Some(v) = data.get("maxConcurrency").and_then(|s| s.parse().ok()) {
        key.max_concurrency = v;
    }
    if let Some(v) = data.get("expiresAt").and_then(|s| s.parse().ok()) {
        key.expires_at = Some(v);
    }
    if let Some(v) = data.get("activationDuration").and_then(|s| s.parse().ok()) {
        key.activation_duration = Some(v);
    }
    if let Some(v) = data.get("firstUsedAt").and_then(|s| s.parse().ok()) {
        key.first_used_at = Some(v);
    }
    if let Some(v) = data.get("createdAt").and_then(|s| s.parse().ok()) {
        key.created_at = v;
    }
    if let Some(v) = data.get("lastUsedAt").and_then(|s| s.parse().ok()) {
        key.last_used_at = v;
    }
    if let Some(v) = data.get("serviceRates") {
        if let Ok(parsed) = serde_json::from_str::<HashMap<String, f64>>(v) {
            key.service_rates = parsed;
        }
    }
    key.claude_account_id = data.get("claudeAccountId").cloned();
    key.claude_console_account_id = data.get("claudeConsoleAccountId").cloned();
    key.gemini_account_id = data.get("geminiAccountId").cloned();
    key.openai_account_id = data.get("openaiAccountId").cloned();
    key.bedrock_account_id = data.get("bedrockAccountId").cloned();
    key.droid_account_id = data.get("droidAccountId").cloned();
    key.ccr_account_id = data.get("ccrAccountId").cloned();
    key
}

/// Validates auth-level policy (not quota): deletion, activation,
/// expiration.
pub fn validate_key_policy(key: &ApiKey, now_millis: i64) -> AppResult<()> {
    if key.is_deleted {
        return Err(AppError::KeyDeleted);
    }
    if !key.is_active {
        return Err(AppError::KeyInactive);
    }
    if let Some(expires_at) = key.expires_at {
        if expires_at > 0 && expires_at < now_millis {
            return Err(AppError::KeyExpired);
        }
    }
    if let (Some(duration), Some(first_used)) = (key.activation_duration, key.first_used_at) {
        if duration > 0 && now_millis > first_used + duration * 1000 {
            return Err(AppError::KeyExpired);
        }
    }
    Ok(())
}

pub fn check_model_restriction(key: &ApiKey, requested_model: &str) -> AppResult<()> {
    if key.enable_model_restriction && !key.restricted_models.iter().any(|m| m == requested_model) {
        return Err(AppError::ModelNotAllowed(requested_model.to_string()));
    }
    Ok(())
}

pub struct QuotaChecker<'a> {
    kv: &'a KvStore,
    tz_offset_hours: i64,
}

impl<'a> QuotaChecker<'a> {
    pub fn new(kv: &'a KvStore, tz_offset_hours: i64) -> Self {
        Self { kv, tz_offset_hours }
    }

    pub async fn check_daily_and_total_cost(&self, key: &ApiKey, now_millis: i64) -> AppResult<()> {
        if let Some(limit) = key.daily_cost_limit {
            if limit > 0.0 {
                let today = time_util::date_string(now_millis, self.tz_offset_hours);
                let spent: f64 = self
                    .kv
                    .get(&format!("usage:cost:daily:{}:{}", key.id, today))
                    .await?
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                if spent >= limit {
                    return Err(AppError::QuotaExceeded("daily cost limit reached".into()));
                }
            }
        }
        if let Some(limit) = key.total_cost_limit {
            if limit > 0.0 {
                let spent: f64 = self
                    .kv
                    .get(&format!("usage:cost:total:{}", key.id))
                    .await?
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                if spent >= limit {
                    return Err(AppError::QuotaExceeded("total cost limit reached".into()));
                }
            }
        }
        Ok(())
    }

    pub async fn check_weekly_opus_cost(
        &self,
        key: &ApiKey,
        requested_model_is_claude: bool,
        account_type_opus_eligible: bool,
        now_millis: i64,
    ) -> AppResult<()> {
        let Some(limit) = key.weekly_opus_cost_limit else { return Ok(()) };
        if limit <= 0.0 || !requested_model_is_claude || !account_type_opus_eligible {
            return Ok(());
        }
        let period = time_util::period_string(now_millis, self.tz_offset_hours, key.weekly_reset_day, key.weekly_reset_hour);
        let spent: f64 = self
            .kv
            .get(&format!("usage:opus:weekly:{}:{}", key.id, period))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        if spent >= limit {
            return Err(AppError::QuotaExceeded("weekly opus cost limit reached".into()));
        }
        Ok(())
    }

    /// Checks and admits one request against the rolling rate-limit window,
    /// atomically. `requests` gates admission up front; `tokens`/`cost` were
    /// last incremented by the *previous* request's completion (they can't
    /// be known for the request in flight), so a request is also rejected
    /// here if the window's carried-over token/cost spend already meets or
    /// exceeds its limit, the same "reset together on rollover" window the
    /// `requests` counter uses.
    pub async fn check_and_admit_rate_window(&self, key: &ApiKey, now_secs: i64) -> AppResult<()> {
        let Some(max_requests) = key.rate_limit_requests else { return Ok(()) };
        if max_requests <= 0 {
            return Ok(());
        }

        let window = key.rate_limit_window.max(1);
        let window_start_key = format!("rate_limit:window_start:{}", key.id);
        let requests_key = format!("rate_limit:requests:{}", key.id);
        let tokens_key = format!("rate_limit:tokens:{}", key.id);
        let cost_key = format!("rate_limit:cost:{}", key.id);

        let args = vec![now_secs.to_string(), window.to_string(), max_requests.to_string()];
        let value = self
            .kv
            .eval_script(
                &RATE_WINDOW_SCRIPT,
                &[&window_start_key, &requests_key, &tokens_key, &cost_key],
                &args,
            )
            .await?;
        let (admitted, tokens, cost): (i64, i64, f64) = redis::from_redis_value(&value).unwrap_or((0, 0, 0.0));
        if admitted != 1 {
            return Err(AppError::RateLimited("request rate limit exceeded for window".into()));
        }
        if let Some(limit) = key.rate_limit_tokens {
            if limit > 0 && tokens >= limit {
                return Err(AppError::RateLimited("token rate limit exceeded for window".into()));
            }
        }
        if let Some(limit) = key.rate_limit_cost {
            if limit > 0.0 && cost >= limit {
                return Err(AppError::RateLimited("cost rate limit exceeded for window".into()));
            }
        }
        Ok(())
    }

    pub async fn incr_rate_window_tokens_cost(&self, key: &ApiKey, tokens: i64, cost: f64) -> AppResult<()> {
        let tokens_key = format!("rate_limit:tokens:{}", key.id);
        let cost_key = format!("rate_limit:cost:{}", key.id);
        self.kv.incr_by(&tokens_key, tokens).await?;
        self.kv.incr_by_float(&cost_key, cost).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_restriction_blocks_non_listed_model() {
        let mut key = ApiKey::default();
        key.enable_model_restriction = true;
        key.restricted_models = vec!["claude-3-5-sonnet".into()];
        assert!(check_model_restriction(&key, "gpt-4o").is_err());
        assert!(check_model_restriction(&key, "claude-3-5-sonnet").is_ok());
    }

    #[test]
    fn policy_rejects_deleted_and_expired() {
        let mut key = ApiKey::default();
        key.is_deleted = true;
        assert!(matches!(validate_key_policy(&key, 0), Err(AppError::KeyDeleted)));

        let mut key2 = ApiKey::default();
        key2.expires_at = Some(1000);
        assert!(matches!(validate_key_policy(&key2, 2000), Err(AppError::KeyExpired)));
        assert!(validate_key_policy(&key2, 500).is_ok());
    }

    #[test]
    fn hash_key_is_deterministic() {
        assert_eq!(hash_key("sk-abc"), hash_key("sk-abc"));
        assert_ne!(hash_key("sk-abc"), hash_key("sk-def"));
    }
}
