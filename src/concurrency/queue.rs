//! FIFO queue counters + stats
//!
//! `concurrency:queue:<apiKeyId>` is a plain integer counter representing
//! requests currently waiting for admission; `concurrency:queue:stats:<id>`
//! tracks lifetime outcome counts; wait-time samples are capped lists used
//! for dashboards.

use redis::Script;

use crate::error::AppResult;
use crate::kv::KvStore;

pub fn queue_key(api_key_id: &str) -> String {
    format!("concurrency:queue:{api_key_id}")
}

pub fn stats_key(api_key_id: &str) -> String {
    format!("concurrency:queue:stats:{api_key_id}")
}

pub fn wait_times_key(api_key_id: &str) -> String {
    format!("concurrency:queue:wait_times:{api_key_id}")
}

pub const GLOBAL_WAIT_TIMES_KEY: &str = "concurrency:queue:wait_times:global";
const PER_KEY_WAIT_SAMPLE_CAP: isize = 500;
const GLOBAL_WAIT_SAMPLE_CAP: isize = 2000;
const STATS_TTL_SECS: i64 = 7 * 24 * 60 * 60;
const WAIT_TIMES_TTL_SECS: i64 = 24 * 60 * 60;

static INCR_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local ttl = tonumber(ARGV[1])
        local value = redis.call('INCR', key)
        redis.call('EXPIRE', key, ttl)
        return value
        "#,
    )
});

static DECR_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local value = redis.call('DECR', key)
        if value <= 0 then
            redis.call('DEL', key)
            return 0
        end
        return value
        "#,
    )
});

static STAT_INCR_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local field = ARGV[1]
        local ttl = tonumber(ARGV[2])
        redis.call('HINCRBY', key, field, 1)
        redis.call('EXPIRE', key, ttl)
        return 1
        "#,
    )
});

static PUSH_WAIT_SAMPLE_SCRIPT: once_cell::sync::Lazy<Script> = once_cell::sync::Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local value = ARGV[1]
        local cap = tonumber(ARGV[2])
        local ttl = tonumber(ARGV[3])
        redis.call('LPUSH', key, value)
        redis.call('LTRIM', key, 0, cap - 1)
        redis.call('EXPIRE', key, ttl)
        return 1
        "#,
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Entered,
    Success,
    Timeout,
    Cancelled,
    SocketChanged,
    RejectedOverload,
}

impl QueueOutcome {
    fn field(self) -> &'static str {
        match self {
            QueueOutcome::Entered => "entered",
            QueueOutcome::Success => "success",
            QueueOutcome::Timeout => "timeout",
            QueueOutcome::Cancelled => "cancelled",
            QueueOutcome::SocketChanged => "socket_changed",
            QueueOutcome::RejectedOverload => "rejected_overload",
        }
    }
}

pub struct QueueCounter<'a> {
    kv: &'a KvStore,
}

impl<'a> QueueCounter<'a> {
    pub fn new(kv: &'a KvStore) -> Self {
        Self { kv }
    }

    pub async fn incr(&self, api_key_id: &str, timeout_ms: u64) -> AppResult<i64> {
        let ttl = ((timeout_ms as f64) / 1000.0).ceil() as i64 + 30;
        let args = vec![ttl.to_string()];
        let value = self
            .kv
            .eval_script(&INCR_SCRIPT, &[&queue_key(api_key_id)], &args)
            .await?;
        let count = redis::from_redis_value(&value).unwrap_or(0);
        self.record_stat(api_key_id, QueueOutcome::Entered).await?;
        Ok(count)
    }

    pub async fn decr(&self, api_key_id: &str) -> AppResult<i64> {
        let value = self
            .kv
            .eval_script(&DECR_SCRIPT, &[&queue_key(api_key_id)], &[])
            .await?;
        Ok(redis::from_redis_value(&value).unwrap_or(0))
    }

    pub async fn record_stat(&self, api_key_id: &str, outcome: QueueOutcome) -> AppResult<()> {
        let args = vec![outcome.field().to_string(), STATS_TTL_SECS.to_string()];
        self.kv
            .eval_script(&STAT_INCR_SCRIPT, &[&stats_key(api_key_id)], &args)
            .await?;
        Ok(())
    }

    pub async fn record_wait_time(&self, api_key_id: &str, wait_ms: i64) -> AppResult<()> {
        let value = wait_ms.to_string();
        let key_args = vec![value.clone(), PER_KEY_WAIT_SAMPLE_CAP.to_string(), WAIT_TIMES_TTL_SECS.to_string()];
        self.kv
            .eval_script(&PUSH_WAIT_SAMPLE_SCRIPT, &[&wait_times_key(api_key_id)], &key_args)
            .await?;

        let global_args = vec![value, GLOBAL_WAIT_SAMPLE_CAP.to_string(), WAIT_TIMES_TTL_SECS.to_string()];
        self.kv
            .eval_script(&PUSH_WAIT_SAMPLE_SCRIPT, &[GLOBAL_WAIT_TIMES_KEY], &global_args)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(queue_key("k"), "concurrency:queue:k");
        assert_eq!(stats_key("k"), "concurrency:queue:stats:k");
        assert_eq!(wait_times_key("k"), "concurrency:queue:wait_times:k");
    }

    #[test]
    fn outcome_fields() {
        assert_eq!(QueueOutcome::Entered.field(), "entered");
        assert_eq!(QueueOutcome::RejectedOverload.field(), "rejected_overload");
    }
}
