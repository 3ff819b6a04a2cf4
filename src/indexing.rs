//! Indexing Layer
//!
//! Every operation that would otherwise need to scan the whole keyspace must
//! be constant-time given an index set. This module maintains those sets on
//! write and provides the SCAN-based fallback with empty-marker caching for
//! when an index hasn't been built yet (cold start, or pre-migration data).

use crate::error::AppResult;
use crate::kv::{KvStore, DEFAULT_SCAN_ITER_CAP};

const EMPTY_MARKER_TTL_SECS: u64 = 3600;

fn empty_marker_key(index_key: &str) -> String {
    format!("{index_key}:empty")
}

/// Adds `id` to `index_key` and clears its empty marker, since the index is
/// no longer empty.
pub async fn add_to_index(kv: &KvStore, index_key: &str, id: &str) -> AppResult<()> {
    kv.sadd(index_key, id).await?;
    kv.del(&empty_marker_key(index_key)).await?;
    Ok(())
}

pub async fn remove_from_index(kv: &KvStore, index_key: &str, id: &str) -> AppResult<()> {
    kv.srem(index_key, id).await
}

/// Resolves all ids for `index_key`, falling back to a SCAN over
/// `scan_pattern` (extracting ids with `extract`) when the index itself is
/// empty and has not been marked empty recently.
pub async fn get_all_ids_by_index<F>(
    kv: &KvStore,
    index_key: &str,
    scan_pattern: &str,
    extract: F,
) -> AppResult<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    if kv.get(&empty_marker_key(index_key)).await?.as_deref() == Some("1") {
        return Ok(Vec::new());
    }

    let members = kv.smembers(index_key).await?;
    if !members.is_empty() {
        return Ok(members);
    }

    let scanned_keys = kv.chunked_scan(scan_pattern, DEFAULT_SCAN_ITER_CAP).await?;
    let mut ids = Vec::new();
    for key in &scanned_keys {
        if let Some(id) = extract(key) {
            kv.sadd(index_key, &id).await?;
            ids.push(id);
        }
    }

    if ids.is_empty() {
        kv.set_ex(&empty_marker_key(index_key), "1", EMPTY_MARKER_TTL_SECS).await?;
    } else {
        kv.del(&empty_marker_key(index_key)).await?;
    }

    Ok(ids)
}

/// Standard id extractor for keys shaped `prefix:<id>`.
pub fn extract_last_segment(key: &str) -> Option<String> {
    key.rsplit(':').next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_trailing_segment() {
        assert_eq!(extract_last_segment("claude:account:abc-123"), Some("abc-123".to_string()));
        assert_eq!(extract_last_segment("usage:keyid"), Some("keyid".to_string()));
    }

    #[test]
    fn empty_marker_key_shape() {
        assert_eq!(empty_marker_key("usage:daily:index:2026-07-27"), "usage:daily:index:2026-07-27:empty");
    }
}
