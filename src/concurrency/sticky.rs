//! Sticky session mapping
//!
//! `sticky_session:<hash>` maps a session hash to the account id chosen for
//! it. Lookups are last-writer-wins and treat missing/stale mappings as
//! cache misses rather than errors; the scheduler simply re-selects.

use crate::error::AppResult;
use crate::kv::KvStore;

pub fn key_for(session_hash: &str) -> String {
    format!("sticky_session:{session_hash}")
}

/// Builds the composite key the scheduler looks sticky mappings up by.
pub fn sticky_lookup_key(platform: &str, endpoint: &str, api_key_id: Option<&str>, session_hash: &str) -> String {
    let key_part = api_key_id.unwrap_or("default");
    format!("{platform}:{endpoint}:{key_part}:{session_hash}")
}

pub struct StickySessions<'a> {
    kv: &'a KvStore,
}

impl<'a> StickySessions<'a> {
    pub fn new(kv: &'a KvStore) -> Self {
        Self { kv }
    }

    pub async fn get(&self, session_hash: &str) -> AppResult<Option<String>> {
        self.kv.get(&key_for(session_hash)).await
    }

    pub async fn set(&self, session_hash: &str, account_id: &str, ttl_hours: i64) -> AppResult<()> {
        self.kv
            .set_ex(&key_for(session_hash), account_id, (ttl_hours.max(1) * 3600) as u64)
            .await
    }

    pub async fn delete(&self, session_hash: &str) -> AppResult<()> {
        self.kv.del(&key_for(session_hash)).await?;
        Ok(())
    }

    /// Refreshes TTL back to full only if the remaining TTL has dropped
    /// below `renewal_threshold_minutes`.
    pub async fn renew_if_needed(
        &self,
        session_hash: &str,
        account_id: &str,
        ttl_hours: i64,
        renewal_threshold_minutes: i64,
    ) -> AppResult<()> {
        let key = key_for(session_hash);
        let ttl_secs: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut redis_conn(self).await?)
            .await
            .unwrap_or(-1);

        if ttl_secs >= 0 && ttl_secs < renewal_threshold_minutes * 60 {
            self.set(session_hash, account_id, ttl_hours).await?;
        }
        Ok(())
    }
}

// Small helper kept private to this module: sticky renewal needs a raw TTL
// read that the typed KvStore surface doesn't otherwise expose.
async fn redis_conn(sessions: &StickySessions<'_>) -> AppResult<redis::aio::ConnectionManager> {
    sessions.kv.raw_connection().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shape() {
        assert_eq!(key_for("abc123"), "sticky_session:abc123");
    }

    #[test]
    fn lookup_key_shape() {
        assert_eq!(
            sticky_lookup_key("claude", "anthropic", Some("k1"), "h1"),
            "claude:anthropic:k1:h1"
        );
        assert_eq!(
            sticky_lookup_key("claude", "anthropic", None, "h1"),
            "claude:anthropic:default:h1"
        );
    }
}
