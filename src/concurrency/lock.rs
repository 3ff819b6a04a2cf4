//! Per-account message serialization lock
//!
//! Some upstream providers require strictly serialized requests per
//! account, with a minimum gap between consecutive sends. `acquire`
//! encodes both constraints (mutual exclusion + minimum delay) in one
//! script so no two callers can race between the delay check and the lock
//! write.

use redis::Script;

use crate::error::AppResult;
use crate::kv::KvStore;

fn lock_key(account_id: &str) -> String {
    format!("user_msg_queue_lock:{account_id}")
}

fn last_key(account_id: &str) -> String {
    format!("user_msg_queue_last:{account_id}")
}

const LAST_TIME_TTL_SECS: i64 = 60;

static ACQUIRE_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local lock_key = KEYS[1]
        local last_key = KEYS[2]
        local request_id = ARGV[1]
        local lock_ttl_ms = tonumber(ARGV[2])
        local delay_ms = tonumber(ARGV[3])
        local now = tonumber(ARGV[4])

        if redis.call('GET', lock_key) then
            return {0, -1}
        end

        local last = redis.call('GET', last_key)
        if last then
            local elapsed = now - tonumber(last)
            if elapsed < delay_ms then
                return {0, delay_ms - elapsed}
            end
        end

        redis.call('SET', lock_key, request_id, 'PX', lock_ttl_ms)
        return {1, 0}
        "#,
    )
});

static RELEASE_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local lock_key = KEYS[1]
        local last_key = KEYS[2]
        local request_id = ARGV[1]
        local now = ARGV[2]
        local ttl = tonumber(ARGV[3])

        if redis.call('GET', lock_key) == request_id then
            redis.call('SET', last_key, now, 'EX', ttl)
            redis.call('DEL', lock_key)
            return 1
        end
        return 0
        "#,
    )
});

#[derive(Debug, Clone, Copy)]
pub struct AcquireResult {
    pub acquired: bool,
    /// `None` when the lock is simply held by someone else (wait indefinitely
    /// / give up); `Some(ms)` when the remaining inter-request delay should
    /// be waited out.
    pub wait_ms: Option<i64>,
}

pub struct AccountLock<'a> {
    kv: &'a KvStore,
}

impl<'a> AccountLock<'a> {
    pub fn new(kv: &'a KvStore) -> Self {
        Self { kv }
    }

    pub async fn acquire(
        &self,
        account_id: &str,
        request_id: &str,
        lock_ttl_ms: i64,
        delay_ms: i64,
    ) -> AppResult<AcquireResult> {
        let now = crate::time_util::now_millis();
        let args = vec![
            request_id.to_string(),
            lock_ttl_ms.to_string(),
            delay_ms.to_string(),
            now.to_string(),
        ];
        let value = self
            .kv
            .eval_script(&ACQUIRE_SCRIPT, &[&lock_key(account_id), &last_key(account_id)], &args)
            .await?;
        let (flag, wait): (i64, i64) = redis::from_redis_value(&value).unwrap_or((0, -1));
        Ok(AcquireResult {
            acquired: flag == 1,
            wait_ms: if flag == 1 || wait < 0 { None } else { Some(wait) },
        })
    }

    pub async fn release(&self, account_id: &str, request_id: &str) -> AppResult<bool> {
        let now = crate::time_util::now_millis().to_string();
        let args = vec![request_id.to_string(), now, LAST_TIME_TTL_SECS.to_string()];
        let value = self
            .kv
            .eval_script(&RELEASE_SCRIPT, &[&lock_key(account_id), &last_key(account_id)], &args)
            .await?;
        let flag: i64 = redis::from_redis_value(&value).unwrap_or(0);
        Ok(flag == 1)
    }

    pub async fn force_release(&self, account_id: &str) -> AppResult<()> {
        self.kv.del(&lock_key(account_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(lock_key("a"), "user_msg_queue_lock:a");
        assert_eq!(last_key("a"), "user_msg_queue_last:a");
    }
}
