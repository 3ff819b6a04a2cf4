//! Usage Accounting
//!
//! Called once at the end of every completed request. Every effect listed
//! here happens inside one logical pipeline: token counters across four
//! granularities and four dimensions, cost aggregates, indices, the system
//! metrics minute bucket, the capped per-key usage record list, and the
//! weekly-Opus counter. None of this may ever fail the request it accounts
//! for; callers log and continue on error (see `AppError::is_best_effort`).

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::indexing;
use crate::kv::KvStore;
use crate::time_util;

const DAILY_TTL_SECS: i64 = 32 * 24 * 60 * 60;
const HOURLY_TTL_SECS: i64 = 7 * 24 * 60 * 60;
const MONTHLY_TTL_SECS: i64 = 365 * 24 * 60 * 60;
const RECORDS_CAP: isize = 200;
const RECORDS_TTL_SECS: u64 = 90 * 24 * 60 * 60;
const OPUS_WEEKLY_TTL_SECS: u64 = 14 * 24 * 60 * 60;
const COST_DAILY_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const COST_HOURLY_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const COST_MONTHLY_TTL_SECS: u64 = 90 * 24 * 60 * 60;

/// One completed request's worth of metered token/cost data, as produced by
/// a provider adapter and handed to accounting by the relay orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageEvent {
    pub key_id: String,
    pub account_id: String,
    pub account_type: String,
    pub request_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
    pub ephemeral_5m_tokens: i64,
    pub ephemeral_1h_tokens: i64,
    pub is_long_context_request: bool,
    pub real_cost: f64,
    pub rated_cost: f64,
    pub response_time_ms: i64,
    pub timestamp_millis: i64,
}

impl UsageEvent {
    pub fn all_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_create_tokens + self.cache_read_tokens
    }
}

/// Strips provider-specific decoration from a model name so usage from
/// `us.anthropic.claude-3-5-sonnet-20241022-v2:0` and
/// `claude-3-5-sonnet-20241022` aggregate to the same bucket.
pub fn normalize_model_name(model: &str) -> String {
    static BEDROCK_CLAUDE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[a-z]{2}\.anthropic\.").unwrap());
    static VERSION_SUFFIX: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"-v\d+(:\d+)?$").unwrap());

    let mut m = model.to_string();
    if BEDROCK_CLAUDE.is_match(&m) || m.contains("claude") {
        m = BEDROCK_CLAUDE.replace(&m, "").to_string();
        m = m.trim_start_matches("anthropic.").to_string();
        m = VERSION_SUFFIX.replace(&m, "").to_string();
    } else {
        m = VERSION_SUFFIX.replace(&m, "").to_string();
        m = m.trim_end_matches(":latest").to_string();
    }
    m
}

struct Bucketed {
    label: String,
    ttl_secs: Option<i64>,
}

fn buckets(ts: i64, tz_offset: i64) -> Vec<(&'static str, Bucketed)> {
    vec![
        ("total", Bucketed { label: String::new(), ttl_secs: None }),
        ("daily", Bucketed { label: time_util::date_string(ts, tz_offset), ttl_secs: Some(DAILY_TTL_SECS) }),
        ("hourly", Bucketed { label: time_util::hour_string(ts, tz_offset), ttl_secs: Some(HOURLY_TTL_SECS) }),
        ("monthly", Bucketed { label: time_util::month_string(ts, tz_offset), ttl_secs: Some(MONTHLY_TTL_SECS) }),
    ]
}

async fn hincr_with_ttl(kv: &KvStore, key: &str, field: &str, delta: i64, ttl: Option<i64>) -> AppResult<()> {
    if delta == 0 {
        return Ok(());
    }
    kv.hincr_by(key, field, delta).await?;
    if let Some(secs) = ttl {
        kv.expire(key, secs).await?;
    }
    Ok(())
}

async fn apply_token_fields(
    kv: &KvStore,
    key: &str,
    ev: &UsageEvent,
    ttl: Option<i64>,
) -> AppResult<()> {
    hincr_with_ttl(kv, key, "inputTokens", ev.input_tokens, ttl).await?;
    hincr_with_ttl(kv, key, "outputTokens", ev.output_tokens, ttl).await?;
    hincr_with_ttl(kv, key, "cacheCreateTokens", ev.cache_create_tokens, ttl).await?;
    hincr_with_ttl(kv, key, "cacheReadTokens", ev.cache_read_tokens, ttl).await?;
    hincr_with_ttl(kv, key, "allTokens", ev.all_tokens(), ttl).await?;
    hincr_with_ttl(kv, key, "requests", 1, ttl).await?;
    hincr_with_ttl(kv, key, "ephemeral5mTokens", ev.ephemeral_5m_tokens, ttl).await?;
    hincr_with_ttl(kv, key, "ephemeral1hTokens", ev.ephemeral_1h_tokens, ttl).await?;
    if ev.is_long_context_request {
        hincr_with_ttl(kv, key, "longContextInputTokens", ev.input_tokens, ttl).await?;
        hincr_with_ttl(kv, key, "longContextOutputTokens", ev.output_tokens, ttl).await?;
        hincr_with_ttl(kv, key, "longContextRequests", 1, ttl).await?;
    }
    Ok(())
}

async fn apply_cost_fields(kv: &KvStore, key: &str, ev: &UsageEvent, ttl: Option<i64>) -> AppResult<()> {
    let real_micro = (ev.real_cost * 1_000_000.0).round() as i64;
    let rated_micro = (ev.rated_cost * 1_000_000.0).round() as i64;
    hincr_with_ttl(kv, key, "realCostMicro", real_micro, ttl).await?;
    hincr_with_ttl(kv, key, "ratedCostMicro", rated_micro, ttl).await?;
    Ok(())
}

fn is_claude_family(model: &str) -> bool {
    model.to_lowercase().contains("claude")
}

fn opus_eligible_account(account_type: &str) -> bool {
    matches!(account_type, "claude-official" | "claude-console" | "ccr")
}

pub struct UsageAccounting<'a> {
    kv: &'a KvStore,
    tz_offset_hours: i64,
    metrics_window_minutes: i64,
}

impl<'a> UsageAccounting<'a> {
    pub fn new(kv: &'a KvStore, tz_offset_hours: i64, metrics_window_minutes: i64) -> Self {
        Self { kv, tz_offset_hours, metrics_window_minutes }
    }

    pub async fn record_key_usage(
        &self,
        ev: &UsageEvent,
        weekly_reset_day: u32,
        weekly_reset_hour: u32,
    ) -> AppResult<()> {
        let model = normalize_model_name(&ev.model);
        let ts = ev.timestamp_millis;
        let kv = self.kv;

        for (granularity, bucket) in buckets(ts, self.tz_offset_hours) {
            let per_key = match granularity {
                "total" => format!("usage:{}", ev.key_id),
                _ => format!("usage:{}:{}:{}", granularity, ev.key_id, bucket.label),
            };
            apply_token_fields(kv, &per_key, ev, bucket.ttl_secs).await?;

            let per_key_model = match granularity {
                "total" | "alltime" => format!("usage:{}:model:alltime:{}", ev.key_id, model),
                _ => format!("usage:{}:model:{}:{}:{}", ev.key_id, granularity, model, bucket.label),
            };
            apply_token_fields(kv, &per_key_model, ev, if granularity == "total" { None } else { bucket.ttl_secs }).await?;
            apply_cost_fields(kv, &per_key_model, ev, if granularity == "total" { None } else { bucket.ttl_secs }).await?;

            let per_model_global = match granularity {
                "total" => None,
                _ => Some(format!("usage:model:{}:{}:{}", granularity, model, bucket.label)),
            };
            if let Some(k) = &per_model_global {
                apply_token_fields(kv, k, ev, bucket.ttl_secs).await?;
            }

            let global = match granularity {
                "total" => "usage:global:total".to_string(),
                _ => format!("usage:global:{}:{}", granularity, bucket.label),
            };
            apply_token_fields(kv, &global, ev, bucket.ttl_secs).await?;

            if granularity != "total" {
                self.maintain_indices(granularity, &bucket.label, &ev.key_id, &model).await?;
            }
        }

        self.record_cost_aggregates(ev).await?;
        self.bump_system_minute(ev).await?;
        self.append_usage_record(ev).await?;

        if is_claude_family(&model) && opus_eligible_account(&ev.account_type) {
            self.bump_weekly_opus(ev, weekly_reset_day, weekly_reset_hour).await?;
        }

        Ok(())
    }

    pub async fn record_account_usage(&self, ev: &UsageEvent) -> AppResult<()> {
        let model = normalize_model_name(&ev.model);
        let ts = ev.timestamp_millis;
        let kv = self.kv;

        for (granularity, bucket) in buckets(ts, self.tz_offset_hours) {
            let per_account = match granularity {
                "total" => format!("account_usage:{}", ev.account_id),
                _ => format!("account_usage:{}:{}:{}", granularity, ev.account_id, bucket.label),
            };
            apply_token_fields(kv, &per_account, ev, bucket.ttl_secs).await?;

            if granularity != "total" {
                let idx = format!("account_usage:{}:index:{}", granularity, bucket.label);
                indexing::add_to_index(kv, &idx, &ev.account_id).await?;

                let model_idx_key = format!("account_usage:model:{}:{}:{}", granularity, model, bucket.label);
                apply_token_fields(kv, &model_idx_key, ev, bucket.ttl_secs).await?;
                let model_idx = format!("account_usage:model:{}:index:{}", granularity, bucket.label);
                indexing::add_to_index(kv, &model_idx, &ev.account_id).await?;
            }
        }
        Ok(())
    }

    async fn maintain_indices(&self, granularity: &str, bucket: &str, key_id: &str, model: &str) -> AppResult<()> {
        let kv = self.kv;
        if matches!(granularity, "daily" | "hourly") {
            let idx = format!("usage:{}:index:{}", granularity, bucket);
            indexing::add_to_index(kv, &idx, key_id).await?;

            let model_idx = format!("usage:model:{}:index:{}", granularity, bucket);
            indexing::add_to_index(kv, &model_idx, model).await?;

            let keymodel_idx = format!("usage:keymodel:{}:index:{}", granularity, bucket);
            indexing::add_to_index(kv, &keymodel_idx, &format!("{key_id}:{model}")).await?;
        }
        if granularity == "monthly" {
            let model_idx = format!("usage:model:monthly:index:{}", bucket);
            indexing::add_to_index(kv, &model_idx, model).await?;
            kv.sadd("usage:model:monthly:months", bucket).await?;
        }
        Ok(())
    }

    async fn record_cost_aggregates(&self, ev: &UsageEvent) -> AppResult<()> {
        let kv = self.kv;
        let ts = ev.timestamp_millis;
        let daily = time_util::date_string(ts, self.tz_offset_hours);
        let hourly = time_util::hour_string(ts, self.tz_offset_hours);
        let monthly = time_util::month_string(ts, self.tz_offset_hours);

        add_cost(kv, &format!("usage:cost:daily:{}:{}", ev.key_id, daily), ev.rated_cost, Some(COST_DAILY_TTL_SECS)).await?;
        add_cost(kv, &format!("usage:cost:hourly:{}:{}", ev.key_id, hourly), ev.rated_cost, Some(COST_HOURLY_TTL_SECS)).await?;
        add_cost(kv, &format!("usage:cost:monthly:{}:{}", ev.key_id, monthly), ev.rated_cost, Some(COST_MONTHLY_TTL_SECS)).await?;
        add_cost(kv, &format!("usage:cost:total:{}", ev.key_id), ev.rated_cost, None).await?;

        add_cost(kv, &format!("usage:cost:real:daily:{}:{}", ev.key_id, daily), ev.real_cost, Some(COST_DAILY_TTL_SECS)).await?;
        add_cost(kv, &format!("usage:cost:real:total:{}", ev.key_id), ev.real_cost, None).await?;
        Ok(())
    }

    async fn bump_system_minute(&self, ev: &UsageEvent) -> AppResult<()> {
        let minute = ev.timestamp_millis / 1000 / 60;
        let key = format!("system:metrics:minute:{minute}");
        apply_token_fields(self.kv, &key, ev, None).await?;
        self.kv
            .expire(&key, 2 * self.metrics_window_minutes * 60)
            .await
    }

    async fn append_usage_record(&self, ev: &UsageEvent) -> AppResult<()> {
        let key = format!("usage:records:{}", ev.key_id);
        let payload = serde_json::to_string(ev).unwrap_or_default();
        self.kv.lpush(&key, &payload).await?;
        self.kv.ltrim(&key, 0, RECORDS_CAP - 1).await?;
        self.kv.expire(&key, RECORDS_TTL_SECS as i64).await
    }

    async fn bump_weekly_opus(&self, ev: &UsageEvent, reset_day: u32, reset_hour: u32) -> AppResult<()> {
        let period = time_util::period_string(ev.timestamp_millis, self.tz_offset_hours, reset_day, reset_hour);
        let key = format!("usage:opus:weekly:{}:{}", ev.key_id, period);
        add_cost(self.kv, &key, ev.rated_cost, Some(OPUS_WEEKLY_TTL_SECS)).await?;

        let real_key = format!("usage:opus:real:weekly:{}:{}", ev.key_id, period);
        add_cost(self.kv, &real_key, ev.real_cost, Some(OPUS_WEEKLY_TTL_SECS)).await
    }
}

async fn add_cost(kv: &KvStore, key: &str, delta: f64, ttl_secs: Option<u64>) -> AppResult<()> {
    kv.incr_by_float(key, delta).await?;
    if let Some(ttl) = ttl_secs {
        kv.expire(key, ttl as i64).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backfill / migration jobs
// ---------------------------------------------------------------------------

pub mod migration {
    use super::*;

    fn marker_key(name: &str) -> String {
        format!("system:migration:{name}")
    }

    /// Guards `job` so it runs at most once per store, identified by `name`.
    /// Returns `true` if the job actually ran this call.
    pub async fn run_once<F, Fut>(kv: &KvStore, name: &str, job: F) -> AppResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AppResult<()>>,
    {
        if !kv.set_nx(&marker_key(name), "1").await? {
            return Ok(false);
        }
        job().await?;
        Ok(true)
    }

    /// Rebuilds all daily/hourly/keymodel indices by scanning the usage
    /// keyspace. Idempotent: rebuilding from scratch twice yields the same
    /// index sets since SADD is itself idempotent.
    pub async fn rebuild_usage_indices(kv: &KvStore) -> AppResult<()> {
        run_once(kv, "usage-index-v2", || async {
            for granularity in ["daily", "hourly"] {
                // usage:<granularity>:<keyId>:<bucket>
                let per_key_pattern = format!("usage:{granularity}:*");
                let mut per_key_batches: Vec<Vec<String>> = Vec::new();
                kv.scan_and_process(&per_key_pattern, crate::kv::DEFAULT_SCAN_ITER_CAP, |batch| {
                    per_key_batches.push(batch);
                })
                .await?;
                for batch in per_key_batches {
                    for key in batch {
                        let parts: Vec<&str> = key.splitn(4, ':').collect();
                        let [_, _, key_id, bucket] = parts[..] else { continue };
                        indexing::add_to_index(kv, &format!("usage:{granularity}:index:{bucket}"), key_id).await?;
                    }
                }

                // usage:<keyId>:model:<granularity>:<model>:<bucket>
                let per_key_model_pattern = format!("usage:*:model:{granularity}:*:*");
                let mut per_key_model_batches: Vec<Vec<String>> = Vec::new();
                kv.scan_and_process(&per_key_model_pattern, crate::kv::DEFAULT_SCAN_ITER_CAP, |batch| {
                    per_key_model_batches.push(batch);
                })
                .await?;
                for batch in per_key_model_batches {
                    for key in batch {
                        let parts: Vec<&str> = key.splitn(6, ':').collect();
                        let [_, key_id, _model_lit, _, model, bucket] = parts[..] else { continue };
                        indexing::add_to_index(kv, &format!("usage:model:{granularity}:index:{bucket}"), model).await?;
                        indexing::add_to_index(
                            kv,
                            &format!("usage:keymodel:{granularity}:index:{bucket}"),
                            &format!("{key_id}:{model}"),
                        )
                        .await?;
                    }
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Aggregates all per-key-per-model-monthly hashes into the alltime
    /// per-key-per-model hash, for every key that doesn't already have one.
    pub async fn backfill_alltime_model_stats(kv: &KvStore) -> AppResult<()> {
        run_once(kv, "alltime-model-stats", || async {
            let key_ids = kv.smembers("apikey:idx:all").await?;
            for key_id in key_ids {
                let pattern = format!("usage:{key_id}:model:monthly:*");
                let monthly_keys = kv.chunked_scan(&pattern, crate::kv::DEFAULT_SCAN_ITER_CAP).await?;
                for mk in monthly_keys {
                    let Some(model) = mk.split(':').nth(4) else { continue };
                    let alltime_key = format!("usage:{key_id}:model:alltime:{model}");
                    let fields = kv.hgetall(&mk).await?;
                    for (field, value) in fields {
                        if let Ok(v) = value.parse::<i64>() {
                            kv.hincr_by(&alltime_key, &field, v).await?;
                        }
                    }
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Derives `usage:global:total` once from the sum of per-key totals, if
    /// it doesn't already exist.
    pub async fn backfill_global_stats(kv: &KvStore) -> AppResult<()> {
        run_once(kv, "global-stats", || async {
            let key_ids = kv.smembers("apikey:idx:all").await?;
            let fields = ["inputTokens", "outputTokens", "cacheCreateTokens", "cacheReadTokens", "allTokens", "requests"];
            for key_id in key_ids {
                let per_key = format!("usage:{key_id}");
                let data = kv.hgetall(&per_key).await?;
                for field in fields {
                    if let Some(v) = data.get(field).and_then(|s| s.parse::<i64>().ok()) {
                        kv.hincr_by("usage:global:total", field, v).await?;
                    }
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Reconstructs each key's current weekly-Opus counter from daily model
    /// buckets under a distributed lock, run as a daily top-of-day job. Per
    /// the known quirk in the source behaviour this is preserved as-is: if a
    /// key's reset-day configuration changed mid-window, the backfilled
    /// figure includes the old period's tail.
    pub async fn rebuild_weekly_opus_cost(
        kv: &KvStore,
        key_id: &str,
        weekly_reset_day: u32,
        weekly_reset_hour: u32,
        tz_offset_hours: i64,
    ) -> AppResult<()> {
        let lock_key = format!("system:migration:weekly-opus-lock:{key_id}");
        if !kv.set_nx_ex(&lock_key, "1", 300).await? {
            return Ok(());
        }

        let now = crate::time_util::now_millis();
        let period_start = crate::time_util::period_start_date(now, tz_offset_hours, weekly_reset_day, weekly_reset_hour);
        let period = period_start.format("%Y-%m-%d").to_string();

        let mut total_rated = 0f64;
        let mut day = period_start;
        let today_end = chrono::Utc::now();
        while day <= today_end {
            let bucket = day.format("%Y-%m-%d").to_string();
            let daily_key = format!("usage:cost:daily:{key_id}:{bucket}");
            if let Some(v) = kv.get(&daily_key).await?.and_then(|s| s.parse::<f64>().ok()) {
                total_rated += v;
            }
            day += chrono::Duration::days(1);
        }

        let key = format!("usage:opus:weekly:{key_id}:{period}");
        kv.set_ex(&key, &total_rated.to_string(), OPUS_WEEKLY_TTL_SECS).await
    }

    /// Fills missing daily/hourly/monthly cost keys from historical token
    /// buckets, never overwriting existing data (`SET NX`).
    pub async fn backfill_cost_init(kv: &KvStore, key_id: &str, bucket: &str, granularity: &str, rated_cost: f64) -> AppResult<()> {
        let key = format!("usage:cost:{granularity}:{key_id}:{bucket}");
        kv.set_nx(&key, &rated_cost.to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bedrock_claude() {
        assert_eq!(
            normalize_model_name("us.anthropic.claude-3-5-sonnet-20241022-v2:0"),
            "claude-3-5-sonnet-20241022"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_model_name("us.anthropic.claude-3-5-sonnet-20241022-v2:0");
        let twice = normalize_model_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_strips_latest_suffix() {
        assert_eq!(normalize_model_name("gpt-4o:latest"), "gpt-4o");
    }

    #[test]
    fn opus_eligibility() {
        assert!(opus_eligible_account("claude-official"));
        assert!(!opus_eligible_account("openai"));
    }
}
