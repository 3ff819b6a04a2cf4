//! HTTP client utilities: retry/backoff, SSE streaming helpers, and the
//! actual upstream forward call.
//!
//! Streaming passthrough copies bytes verbatim; only line boundaries are
//! buffered across chunked reads so a `[DONE]` sentinel or usage event
//! embedded in a later chunk is never split.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, initial_ms: 500, max_ms: 8000 }
    }
}

/// Exponential backoff with jitter: `min(max_ms, initial_ms * 2^(attempt-1))`
/// plus up to 20% random jitter.
pub fn calculate_retry_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let base = cfg.initial_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let capped = base.min(cfg.max_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped / 5 + 1);
    Duration::from_millis(capped + jitter)
}

/// 5xx and 429 are retryable; other 4xx are not.
pub fn should_retry(status_code: u16) -> bool {
    status_code == 429 || (500..600).contains(&status_code)
}

/// Buffers raw SSE bytes across chunk boundaries, yielding complete lines.
/// Mirrors the behaviour needed to drain a provider's chunked stream
/// without ever holding more than one partial line in memory.
#[derive(Default)]
pub struct SseLineBuffer {
    partial: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a raw chunk, returning complete lines found so far (the final
    /// partial line, if any, is retained for the next call).
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line = self.partial[..pos].trim_end_matches('\r').to_string();
            lines.push(line);
            self.partial.drain(..=pos);
        }
        lines
    }

    pub fn drain_remaining(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

pub fn normalize_stream_flag(payload: &serde_json::Value) -> bool {
    payload.get("stream").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Forwards one request to an account's upstream, with bounded retry on
/// retryable status codes. Non-streaming: waits for the full body and
/// returns it as parsed JSON. Streaming callers should use
/// `forward_streaming` instead so bytes reach the client as they arrive.
pub struct UpstreamClient {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl UpstreamClient {
    pub fn new(retry: RetryConfig) -> Self {
        Self { http: reqwest::Client::new(), retry }
    }

    fn request(&self, url: &str, bearer: &str, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .bearer_auth(bearer)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
    }

    /// Sends `body` to `url`, retrying on 429/5xx up to `retry.max_attempts`
    /// times with jittered exponential backoff, and returns the parsed JSON
    /// response body.
    pub async fn forward_json(&self, url: &str, bearer: &str, body: &Value) -> AppResult<Value> {
        let mut attempt = 1;
        loop {
            let resp = self
                .request(url, bearer, body)
                .send()
                .await
                .map_err(|e| AppError::UpstreamError(format!("request to {url} failed: {e}")))?;

            let status = resp.status().as_u16();
            if should_retry(status) && attempt < self.retry.max_attempts {
                tokio::time::sleep(calculate_retry_delay(attempt, &self.retry)).await;
                attempt += 1;
                continue;
            }

            let text = resp
                .text()
                .await
                .map_err(|e| AppError::UpstreamError(format!("could not read response body: {e}")))?;

            if status >= 400 {
                return Err(AppError::UpstreamError(format!("upstream returned {status}: {text}")));
            }

            return serde_json::from_str(&text)
                .map_err(|e| AppError::UpstreamError(format!("upstream response was not valid json: {e}")));
        }
    }

    /// Sends `body` to `url` and drains the SSE response through
    /// `SseLineBuffer`, handing each reconstructed line to `on_line` as it
    /// arrives (verbatim passthrough to the client) while accumulating the
    /// raw bytes for any caller that needs the full transcript afterward.
    /// Returns once the upstream closes the connection or emits `[DONE]`.
    pub async fn forward_streaming<F: FnMut(&str)>(
        &self,
        url: &str,
        bearer: &str,
        body: &Value,
        mut on_line: F,
    ) -> AppResult<Vec<String>> {
        use futures_util::StreamExt;

        let resp = self
            .request(url, bearer, body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamError(format!("request to {url} failed: {e}")))?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::UpstreamError(format!("upstream returned {status}: {text}")));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = SseLineBuffer::new();
        let mut sse_data_lines = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::UpstreamError(format!("stream read failed: {e}")))?;
            let text = String::from_utf8_lossy(&chunk);
            for line in buffer.feed(&text) {
                on_line(&line);
                if let Some(data) = parse_sse_data(&line) {
                    if is_sse_done(data) {
                        return Ok(sse_data_lines);
                    }
                    sse_data_lines.push(data.to_string());
                }
            }
        }
        if let Some(rest) = buffer.drain_remaining() {
            on_line(&rest);
        }
        Ok(sse_data_lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(should_retry(429));
        assert!(should_retry(503));
        assert!(!should_retry(400));
        assert!(!should_retry(404));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let cfg = RetryConfig { max_attempts: 5, initial_ms: 100, max_ms: 1000 };
        let d1 = calculate_retry_delay(1, &cfg);
        let d3 = calculate_retry_delay(3, &cfg);
        assert!(d1.as_millis() >= 100);
        assert!(d3.as_millis() <= 1200);
    }

    #[test]
    fn sse_buffer_handles_split_lines() {
        let mut buf = SseLineBuffer::new();
        let lines = buf.feed("data: {\"a\":1}\ndata: partial");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string()]);
        let lines2 = buf.feed("-line\n");
        assert_eq!(lines2, vec!["data: partial-line".to_string()]);
    }

    #[test]
    fn done_sentinel_detected() {
        assert!(is_sse_done(parse_sse_data("data: [DONE]").unwrap()));
        assert!(!is_sse_done(parse_sse_data("data: {}").unwrap()));
    }
}
