//! Relay Orchestrator
//!
//! Composes API-Key admission → scheduler → upstream forward → accounting.
//! Owns request-id generation, lease renewal, cancellation propagation and
//! the finally-style release of every releasable resource a request holds.

pub mod client;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::apikey::{ApiKey, QuotaChecker};
use crate::concurrency::active::ActiveConcurrency;
use crate::concurrency::lock::AccountLock;
use crate::concurrency::queue::{QueueCounter, QueueOutcome};
use crate::error::{AppError, AppResult};
use crate::kv::KvStore;
use crate::pricing::{PricingService, UsageInput};
use crate::scheduler::{ScheduleRequest, Scheduler};
use crate::usage::{UsageAccounting, UsageEvent};

/// Every admitted request owns exactly three releasables: the concurrency
/// lease, the optional account lock, and the optional queue slot, plus an
/// optional fourth for console accounts specifically. `Guard` tracks what
/// was actually acquired so cleanup only releases those.
///
/// Owns its `KvStore` handle (rather than borrowing it) so `Drop` can spawn
/// a detached cleanup task: when a client disconnects mid-request, axum
/// drops the handler's future without ever reaching an explicit `release`
/// call, and that drop is the only cancellation signal this core gets.
pub struct AdmissionGuard {
    kv: Arc<KvStore>,
    key_id: String,
    request_id: String,
    lease_seconds: i64,
    queued: bool,
    account_lock: Option<String>,
    console_account_id: Option<String>,
    released: std::sync::atomic::AtomicBool,
}

impl AdmissionGuard {
    /// Records that a per-account serialization lock was acquired after
    /// account selection, so `release` knows to free it too. Spec ordering:
    /// the lock is taken after the scheduler picks an account and before
    /// forwarding, not at admission time, since admission doesn't know the
    /// account yet.
    pub fn set_account_lock(&mut self, account_id: String) {
        self.account_lock = Some(account_id);
    }

    /// Records that this request also holds a lease in a claude-console
    /// account's own concurrency set (`concurrency:console_account:<id>`),
    /// separate from the per-key lease, so `release` frees both.
    pub fn set_console_account(&mut self, account_id: String) {
        self.console_account_id = Some(account_id);
    }

    pub async fn release(&self, account_lock_request_id: &str) -> AppResult<()> {
        self.released.store(true, std::sync::atomic::Ordering::SeqCst);

        let active = ActiveConcurrency::new(&self.kv);
        active
            .release(&crate::concurrency::active::key_for_api_key(&self.key_id), &self.request_id)
            .await?;

        if let Some(account_id) = &self.console_account_id {
            active
                .release(&crate::concurrency::active::key_for_console_account(account_id), &self.request_id)
                .await?;
        }

        if self.queued {
            QueueCounter::new(&self.kv).decr(&self.key_id).await?;
        }

        if let Some(account_id) = &self.account_lock {
            AccountLock::new(&self.kv).release(account_id, account_lock_request_id).await?;
        }

        Ok(())
    }
}

impl Drop for AdmissionGuard {
    /// Fires only when the guard is dropped without an explicit `release`,
    /// i.e. the client disconnected (or the handler task was otherwise
    /// cancelled) before the pipeline reached a normal exit path. Releases
    /// the same three resources `release` would, recording `cancelled`
    /// rather than `success`/`timeout` in the queue stats, via a detached
    /// task since `Drop::drop` cannot be async.
    fn drop(&mut self) {
        if self.released.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        let kv = self.kv.clone();
        let key_id = self.key_id.clone();
        let request_id = self.request_id.clone();
        let queued = self.queued;
        let account_lock = self.account_lock.clone();
        let console_account_id = self.console_account_id.clone();

        tokio::spawn(async move {
            let active = ActiveConcurrency::new(&kv);
            if let Err(e) = active.release(&crate::concurrency::active::key_for_api_key(&key_id), &request_id).await {
                crate::logger::warn("relay", &format!("cancelled-request lease release failed: {e}"));
            }

            if let Some(account_id) = &console_account_id {
                if let Err(e) = active
                    .release(&crate::concurrency::active::key_for_console_account(account_id), &request_id)
                    .await
                {
                    crate::logger::warn("relay", &format!("cancelled-request console lease release failed: {e}"));
                }
            }

            if queued {
                let queue = QueueCounter::new(&kv);
                if let Err(e) = queue.decr(&key_id).await {
                    crate::logger::warn("relay", &format!("cancelled-request queue decr failed: {e}"));
                }
                if let Err(e) = queue.record_stat(&key_id, QueueOutcome::Cancelled).await {
                    crate::logger::warn("relay", &format!("cancelled-request stat record failed: {e}"));
                }
            }

            if let Some(account_id) = &account_lock {
                if let Err(e) = AccountLock::new(&kv).release(account_id, &request_id).await {
                    crate::logger::warn("relay", &format!("cancelled-request account lock release failed: {e}"));
                }
            }
        });
    }
}

pub struct RelayOrchestrator {
    pub kv: Arc<KvStore>,
    pub pricing: Arc<PricingService>,
    pub tz_offset_hours: i64,
    pub metrics_window_minutes: i64,
    pub sticky_ttl_hours: i64,
    pub renewal_threshold_minutes: i64,
    pub lease_seconds: i64,
    pub renew_interval_seconds: i64,
    pub queue_poll_interval_ms: u64,
}

impl RelayOrchestrator {
    /// Pre-admission: model restriction, cost caps, rate window, concurrency
    /// or queue. Returns a request id and an admission guard, or a fail-fast
    /// `AppError`.
    pub async fn admit(
        &self,
        key: &ApiKey,
        requested_model: &str,
        is_claude_model: bool,
        account_type_opus_eligible: bool,
        queue_timeout_ms: u64,
    ) -> AppResult<(String, AdmissionGuard)> {
        crate::apikey::check_model_restriction(key, requested_model)?;

        let quota = QuotaChecker::new(&self.kv, self.tz_offset_hours);
        let now_millis = crate::time_util::now_millis();
        quota.check_daily_and_total_cost(key, now_millis).await?;
        quota
            .check_weekly_opus_cost(key, is_claude_model, account_type_opus_eligible, now_millis)
            .await?;
        quota.check_and_admit_rate_window(key, now_millis / 1000).await?;

        let request_id = Uuid::new_v4().to_string();
        let active = ActiveConcurrency::new(&self.kv);
        let scope_key = crate::concurrency::active::key_for_api_key(&key.id);

        let mut queued = false;
        if key.max_concurrency > 0 {
            let current = active.get(&scope_key).await?;
            if current >= key.max_concurrency as u64 {
                queued = true;
                self.wait_in_queue(key, &scope_key, queue_timeout_ms).await?;
            }
        }

        active.acquire(&scope_key, &request_id, self.lease_seconds).await?;

        Ok((
            request_id.clone(),
            AdmissionGuard {
                kv: self.kv.clone(),
                key_id: key.id.clone(),
                request_id,
                lease_seconds: self.lease_seconds,
                queued,
                account_lock: None,
                console_account_id: None,
                released: std::sync::atomic::AtomicBool::new(false),
            },
        ))
    }

    /// Admits this request into a claude-console account's own concurrency
    /// set once the scheduler has picked that account, in addition to the
    /// per-key lease taken at `admit`. Registers it on the guard so release
    /// frees both leases.
    pub async fn acquire_console_account_lease(
        &self,
        guard: &mut AdmissionGuard,
        account_id: &str,
        request_id: &str,
    ) -> AppResult<()> {
        let active = ActiveConcurrency::new(&self.kv);
        active
            .acquire(
                &crate::concurrency::active::key_for_console_account(account_id),
                request_id,
                self.lease_seconds,
            )
            .await?;
        guard.set_console_account(account_id.to_string());
        Ok(())
    }

    async fn wait_in_queue(&self, key: &ApiKey, scope_key: &str, timeout_ms: u64) -> AppResult<()> {
        let queue = QueueCounter::new(&self.kv);
        queue.incr(&key.id, timeout_ms).await?;

        let active = ActiveConcurrency::new(&self.kv);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let start = crate::time_util::now_millis();

        loop {
            let current = active.get(scope_key).await?;
            if current < key.max_concurrency as u64 {
                let wait_ms = crate::time_util::now_millis() - start;
                queue.record_wait_time(&key.id, wait_ms).await?;
                queue.record_stat(&key.id, QueueOutcome::Success).await?;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                queue.decr(&key.id).await?;
                queue.record_stat(&key.id, QueueOutcome::Timeout).await?;
                return Err(AppError::QueueTimeout);
            }
            tokio::time::sleep(Duration::from_millis(self.queue_poll_interval_ms)).await;
        }
    }

    pub async fn select_account(
        &self,
        req: &ScheduleRequest<'_>,
        accounts_by_id: &std::collections::HashMap<String, crate::accounts::Account>,
    ) -> AppResult<crate::scheduler::Selection> {
        let scheduler = Scheduler::new(&self.kv, self.sticky_ttl_hours, self.renewal_threshold_minutes);
        scheduler.select(req, accounts_by_id).await
    }

    /// Acquires the per-account serialization lock once an account has been
    /// selected, retrying the configured minimum inter-request delay if the
    /// account just finished another request. Registers the lock on the
    /// guard so `release` frees it alongside the concurrency lease.
    pub async fn acquire_account_lock(
        &self,
        guard: &mut AdmissionGuard,
        account_id: &str,
        request_id: &str,
        lock_ttl_ms: i64,
        min_delay_ms: i64,
        max_wait_ms: u64,
    ) -> AppResult<()> {
        let lock = AccountLock::new(&self.kv);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(max_wait_ms);
        loop {
            let result = lock.acquire(account_id, request_id, lock_ttl_ms, min_delay_ms).await?;
            if result.acquired {
                guard.set_account_lock(account_id.to_string());
                return Ok(());
            }
            let Some(wait_ms) = result.wait_ms else {
                if tokio::time::Instant::now() >= deadline {
                    return Err(AppError::AccountRateLimited);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            if wait_ms < 0 || tokio::time::Instant::now() >= deadline {
                return Err(AppError::AccountRateLimited);
            }
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
        }
    }

    /// Process-wide per-service cost multiplier, applied to every key's rated
    /// cost on top of that key's own per-service multiplier. Stored separately
    /// from any one key so an operator can retune billing for a whole service
    /// (e.g. "claude-official") without touching every key record.
    async fn global_service_multiplier(&self, service: &str) -> f64 {
        match self.kv.get(&format!("system:config:global_rate:{service}")).await {
            Ok(Some(v)) => v.parse().unwrap_or(1.0),
            _ => 1.0,
        }
    }

    /// Runs post-request accounting: token/cost usage for the key and the
    /// account, plus rate-limit token/cost counters. Never surfaces an error
    /// to the caller; failures here are logged and swallowed.
    pub async fn account_for_completion(
        &self,
        key: &ApiKey,
        account_id: &str,
        account_type: &str,
        model: &str,
        usage_input: &UsageInput,
        request_id: &str,
        response_time_ms: i64,
    ) {
        let breakdown = self.pricing.calculate_cost(model, usage_input);
        let global_rate = self.global_service_multiplier(account_type).await;
        let key_rate = key.service_rates.get(account_type).copied().unwrap_or(1.0);
        let rated_cost = breakdown.total * global_rate * key_rate;

        let ev = UsageEvent {
            key_id: key.id.clone(),
            account_id: account_id.to_string(),
            account_type: account_type.to_string(),
            request_id: request_id.to_string(),
            model: model.to_string(),
            input_tokens: usage_input.input_tokens,
            output_tokens: usage_input.output_tokens,
            cache_create_tokens: usage_input.cache_creation_tokens,
            cache_read_tokens: usage_input.cache_read_tokens,
            ephemeral_5m_tokens: usage_input.cache_creation_split.as_ref().map(|s| s.ephemeral_5m_input_tokens).unwrap_or(0),
            ephemeral_1h_tokens: usage_input.cache_creation_split.as_ref().map(|s| s.ephemeral_1h_input_tokens).unwrap_or(0),
            is_long_context_request: breakdown.is_long_context_request,
            real_cost: breakdown.total,
            rated_cost,
            response_time_ms,
            timestamp_millis: crate::time_util::now_millis(),
        };

        let accounting = UsageAccounting::new(&self.kv, self.tz_offset_hours, self.metrics_window_minutes);
        if let Err(e) = accounting.record_key_usage(&ev, key.weekly_reset_day, key.weekly_reset_hour).await {
            crate::logger::warn("usage", &format!("failed to record key usage (best-effort): {e}"));
        }
        if let Err(e) = accounting.record_account_usage(&ev).await {
            crate::logger::warn("usage", &format!("failed to record account usage (best-effort): {e}"));
        }

        let quota = QuotaChecker::new(&self.kv, self.tz_offset_hours);
        if let Err(e) = quota.incr_rate_window_tokens_cost(key, ev.all_tokens(), rated_cost).await {
            crate::logger::warn("usage", &format!("failed to increment rate window counters: {e}"));
        }
    }
}
