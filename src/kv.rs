//! KV Store Adapter
//!
//! Typed surface over a networked Redis-compatible key-value store: strings,
//! hashes, sets, sorted sets, lists, TTLs, pipelines and server-side atomic
//! scripts. Every primitive/accounting/indexing module goes through this
//! adapter rather than holding its own connection.

use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::{AppError, AppResult};

/// Default cap on how many SCAN round-trips a single chunked-scan call will
/// perform before giving up and returning what it has, so a caller-bounded
/// pattern never turns into an unbounded full-keyspace walk.
pub const DEFAULT_SCAN_ITER_CAP: usize = 10_000;
/// Chunk size used by batch-hash-get and batch-delete so a single pipeline
/// never holds more than this many keys in flight.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Escape hatch for callers that need a raw command not covered by the
    /// typed surface above (e.g. `TTL`).
    pub async fn raw_connection(&self) -> AppResult<ConnectionManager> {
        Ok(self.conn.clone())
    }

    // ---- strings ----

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.conn()
            .set(key, value)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        self.conn()
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    /// `SET key value NX EX ttl`, true if the key was set (did not exist).
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<bool> {
        let res: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(res.is_some())
    }

    pub async fn set_nx(&self, key: &str, value: &str) -> AppResult<bool> {
        self.conn()
            .set_nx(key, value)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn del(&self, key: &str) -> AppResult<u64> {
        self.conn()
            .del(key)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> AppResult<()> {
        let _: () = self
            .conn()
            .expire(key, ttl_secs)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> AppResult<i64> {
        self.conn()
            .incr(key, delta)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    /// `INCRBYFLOAT key delta`, atomic float accumulation, used for cost
    /// counters that many concurrent requests write to concurrently (a
    /// read-then-write round trip would drop increments under contention).
    pub async fn incr_by_float(&self, key: &str, delta: f64) -> AppResult<f64> {
        let raw: String = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        raw.parse()
            .map_err(|_| AppError::StoreUnavailable(format!("non-numeric INCRBYFLOAT reply: {raw}")))
    }

    // ---- hashes ----

    pub async fn hget(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        self.conn()
            .hget(key, field)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        self.conn()
            .hset(key, field, value)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> AppResult<i64> {
        self.conn()
            .hincr(key, field, delta)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn hdel(&self, key: &str, field: &str) -> AppResult<u64> {
        self.conn()
            .hdel(key, field)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    /// Chunked pipelined HGETALL over many keys, bounded to `DEFAULT_CHUNK_SIZE`
    /// keys in flight at once so a large fan-out never holds an unbounded
    /// pipeline buffer.
    pub async fn batch_hgetall(
        &self,
        keys: &[String],
    ) -> AppResult<HashMap<String, HashMap<String, String>>> {
        let mut out = HashMap::new();
        for chunk in keys.chunks(DEFAULT_CHUNK_SIZE) {
            let mut pipe = redis::pipe();
            for k in chunk {
                pipe.hgetall(k);
            }
            let results: Vec<HashMap<String, String>> = pipe
                .query_async(&mut self.conn())
                .await
                .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
            for (k, v) in chunk.iter().zip(results.into_iter()) {
                out.insert(k.clone(), v);
            }
        }
        Ok(out)
    }

    /// Chunked pipelined DEL over many keys.
    pub async fn batch_del(&self, keys: &[String]) -> AppResult<u64> {
        let mut total = 0u64;
        for chunk in keys.chunks(DEFAULT_CHUNK_SIZE) {
            let mut pipe = redis::pipe();
            for k in chunk {
                pipe.del(k);
            }
            let results: Vec<u64> = pipe
                .query_async(&mut self.conn())
                .await
                .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
            total += results.iter().sum::<u64>();
        }
        Ok(total)
    }

    // ---- sets ----

    pub async fn sadd(&self, key: &str, member: &str) -> AppResult<()> {
        let _: () = self
            .conn()
            .sadd(key, member)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> AppResult<()> {
        let _: () = self
            .conn()
            .srem(key, member)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        self.conn()
            .smembers(key)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        self.conn()
            .sismember(key, member)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    // ---- sorted sets ----

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> AppResult<()> {
        let _: () = self
            .conn()
            .zadd(key, member, score)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn zrem(&self, key: &str, member: &str) -> AppResult<()> {
        let _: () = self
            .conn()
            .zrem(key, member)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn zscore(&self, key: &str, member: &str) -> AppResult<Option<f64>> {
        self.conn()
            .zscore(key, member)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn zcard(&self, key: &str) -> AppResult<u64> {
        self.conn()
            .zcard(key)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> AppResult<()> {
        let _: () = self
            .conn()
            .zrembyscore(key, min, max)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    // ---- lists ----

    pub async fn lpush(&self, key: &str, value: &str) -> AppResult<()> {
        let _: () = self
            .conn()
            .lpush(key, value)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> AppResult<()> {
        let _: () = self
            .conn()
            .ltrim(key, start, stop)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> AppResult<Vec<String>> {
        self.conn()
            .lrange(key, start, stop)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    // ---- scripts ----

    pub async fn eval_script(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> AppResult<redis::Value> {
        let mut invocation = script.prepare_invoke();
        for k in keys {
            invocation.key(*k);
        }
        for a in args {
            invocation.arg(a);
        }
        invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    // ---- scanning ----

    /// Cursor-based SCAN over a pattern, deduplicating keys seen across
    /// cursor wraparound, bounded by `iter_cap` round-trips.
    pub async fn chunked_scan(&self, pattern: &str, iter_cap: usize) -> AppResult<Vec<String>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut cursor: u64 = 0;
        let mut iters = 0usize;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut self.conn())
                .await
                .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
            for k in batch {
                if seen.insert(k.clone()) {
                    out.push(k);
                }
            }
            cursor = next_cursor;
            iters += 1;
            if cursor == 0 || iters >= iter_cap {
                break;
            }
        }
        Ok(out)
    }

    /// Streams matches of `pattern` in bounded batches to `process`, dropping
    /// each batch before scanning further so a full-keyspace pattern never
    /// accumulates unbounded memory. Returns the total number of keys seen.
    pub async fn scan_and_process<F>(
        &self,
        pattern: &str,
        iter_cap: usize,
        mut process: F,
    ) -> AppResult<usize>
    where
        F: FnMut(Vec<String>),
    {
        let mut cursor: u64 = 0;
        let mut iters = 0usize;
        let mut total = 0usize;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut self.conn())
                .await
                .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
            total += batch.len();
            process(batch);
            cursor = next_cursor;
            iters += 1;
            if cursor == 0 || iters >= iter_cap {
                break;
            }
        }
        Ok(total)
    }
}

pub type SharedKv = Arc<KvStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_sane() {
        assert!(DEFAULT_CHUNK_SIZE > 0 && DEFAULT_CHUNK_SIZE <= 1000);
    }
}
