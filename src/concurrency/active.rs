//! Lease-based active-request counters
//!
//! Key `concurrency:<apiKeyId>` (or `concurrency:console_account:<accountId>`
//! for per-account console concurrency) is a sorted set mapping
//! `requestId -> expireAtMillis`. Every op first evicts stale members so a
//! crashed request can never permanently occupy a slot.

use redis::Script;

use crate::error::AppResult;
use crate::kv::KvStore;

const DEFAULT_LEASE_SECONDS: i64 = 300;

fn key_for(scope: &str) -> String {
    format!("concurrency:{scope}")
}

pub fn key_for_api_key(api_key_id: &str) -> String {
    key_for(api_key_id)
}

pub fn key_for_console_account(account_id: &str) -> String {
    key_for(&format!("console_account:{account_id}"))
}

static ACQUIRE_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local request_id = ARGV[2]
        local expire_at = tonumber(ARGV[3])
        local grace_ms = tonumber(ARGV[4])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
        redis.call('ZADD', key, expire_at, request_id)
        redis.call('PEXPIRE', key, math.max(expire_at - now + grace_ms, 60000))
        return redis.call('ZCARD', key)
        "#,
    )
});

static REFRESH_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local request_id = ARGV[2]
        local new_expire_at = tonumber(ARGV[3])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
        if redis.call('ZSCORE', key, request_id) then
            redis.call('ZADD', key, new_expire_at, request_id)
            return 1
        end
        return 0
        "#,
    )
});

static RELEASE_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local request_id = ARGV[2]

        redis.call('ZREM', key, request_id)
        redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
        local count = redis.call('ZCARD', key)
        if count == 0 then
            redis.call('DEL', key)
        end
        return count
        "#,
    )
});

static GET_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
        return redis.call('ZCARD', key)
        "#,
    )
});

pub struct ActiveConcurrency<'a> {
    kv: &'a KvStore,
}

impl<'a> ActiveConcurrency<'a> {
    pub fn new(kv: &'a KvStore) -> Self {
        Self { kv }
    }

    /// Admits `request_id` into `scope_key`'s active set and returns the
    /// post-admission count (including this request).
    pub async fn acquire(&self, scope_key: &str, request_id: &str, lease_seconds: i64) -> AppResult<u64> {
        let now = crate::time_util::now_millis();
        let lease_ms = lease_seconds.max(1) * 1000;
        let expire_at = now + lease_ms;
        let grace_ms = 30_000;

        let args = vec![now.to_string(), request_id.to_string(), expire_at.to_string(), grace_ms.to_string()];
        let value = self.kv.eval_script(&ACQUIRE_SCRIPT, &[scope_key], &args).await?;
        Ok(redis::from_redis_value(&value).unwrap_or(0))
    }

    pub async fn refresh_lease(&self, scope_key: &str, request_id: &str, lease_seconds: i64) -> AppResult<bool> {
        let now = crate::time_util::now_millis();
        let lease_ms = lease_seconds.max(1) * 1000;
        let new_expire = now + lease_ms;
        let args = vec![now.to_string(), request_id.to_string(), new_expire.to_string()];
        let value = self.kv.eval_script(&REFRESH_SCRIPT, &[scope_key], &args).await?;
        let flag: i64 = redis::from_redis_value(&value).unwrap_or(0);
        Ok(flag == 1)
    }

    pub async fn release(&self, scope_key: &str, request_id: &str) -> AppResult<u64> {
        let now = crate::time_util::now_millis();
        let args = vec![now.to_string(), request_id.to_string()];
        let value = self.kv.eval_script(&RELEASE_SCRIPT, &[scope_key], &args).await?;
        Ok(redis::from_redis_value(&value).unwrap_or(0))
    }

    pub async fn get(&self, scope_key: &str) -> AppResult<u64> {
        let now = crate::time_util::now_millis();
        let args = vec![now.to_string()];
        let value = self.kv.eval_script(&GET_SCRIPT, &[scope_key], &args).await?;
        Ok(redis::from_redis_value(&value).unwrap_or(0))
    }
}

pub const DEFAULT_LEASE: i64 = DEFAULT_LEASE_SECONDS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(key_for_api_key("k1"), "concurrency:k1");
        assert_eq!(key_for_console_account("a1"), "concurrency:console_account:a1");
    }
}
