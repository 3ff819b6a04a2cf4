//! Account Scheduler
//!
//! Chooses an upstream account for a request: resolve the candidate set
//! (binding → group → shared pool), filter by health/endpoint/model
//! compatibility, consult the sticky mapping, then sort by priority then
//! recency. One algorithm serves every platform; only the candidate source
//! differs.

use std::collections::HashMap;

use crate::accounts::{Account, Binding, EndpointType};
use crate::concurrency::sticky::{sticky_lookup_key, StickySessions};
use crate::error::{AppError, AppResult};
use crate::kv::KvStore;

pub struct Scheduler<'a> {
    kv: &'a KvStore,
    sticky_ttl_hours: i64,
    renewal_threshold_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub platform_prefix: &'a str,
    pub endpoint: EndpointType,
    pub api_key_id: Option<&'a str>,
    pub session_hash: Option<&'a str>,
    pub requested_model: &'a str,
    pub binding: Binding,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account_id: String,
    pub via_sticky: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(kv: &'a KvStore, sticky_ttl_hours: i64, renewal_threshold_minutes: i64) -> Self {
        Self { kv, sticky_ttl_hours, renewal_threshold_minutes }
    }

    /// Loads the binding-resolved candidate set before filtering. Split out
    /// so callers (and tests) can supply accounts without a live store.
    pub async fn resolve_candidate_ids(&self, req: &ScheduleRequest<'_>) -> AppResult<Vec<String>> {
        match &req.binding {
            Binding::Account(id) => Ok(vec![id.clone()]),
            Binding::Group(gid) => crate::accounts::resolve_group_members(self.kv, req.platform_prefix, gid).await,
            Binding::None => {
                let idx = format!("{}:account:index", req.platform_prefix);
                self.kv.smembers(&idx).await
            }
        }
    }

    pub fn filter_candidates<'b>(req: &ScheduleRequest<'_>, accounts: &'b [Account]) -> Vec<&'b Account> {
        accounts
            .iter()
            .filter(|a| a.is_candidate())
            .filter(|a| a.supports_endpoint(req.endpoint))
            .filter(|a| a.supports_model(req.requested_model))
            .collect()
    }

    pub fn sort_candidates(candidates: &mut Vec<&Account>) {
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.last_used_at.cmp(&b.last_used_at))
                .then(a.created_at.cmp(&b.created_at))
        });
    }

    /// Full selection: binding is dedicated-account ⇒ sticky is skipped
    /// entirely (there is only one possible choice anyway); otherwise sticky
    /// is tried first.
    pub async fn select(
        &self,
        req: &ScheduleRequest<'_>,
        accounts_by_id: &HashMap<String, Account>,
    ) -> AppResult<Selection> {
        let candidate_ids = self.resolve_candidate_ids(req).await?;
        let mut candidates: Vec<Account> = candidate_ids
            .iter()
            .filter_map(|id| accounts_by_id.get(id).cloned())
            .collect();

        let is_dedicated_single = matches!(req.binding, Binding::Account(_)) && candidates.len() <= 1;

        if !is_dedicated_single {
            if let Some(session_hash) = req.session_hash {
                if let Some(selection) = self.try_sticky(req, session_hash, &candidates).await? {
                    return Ok(selection);
                }
            }
        }

        let mut refs: Vec<&Account> = candidates
            .iter()
            .filter(|a| a.is_candidate())
            .filter(|a| a.supports_endpoint(req.endpoint))
            .filter(|a| a.supports_model(req.requested_model))
            .collect();

        if refs.is_empty() {
            let reason = if matches!(req.binding, Binding::None) {
                "pool exhausted"
            } else {
                "binding prevents any choice"
            };
            return Err(AppError::NoAvailableAccount(reason.to_string()));
        }

        Self::sort_candidates(&mut refs);
        let chosen = refs[0].id.clone();

        if let Some(session_hash) = req.session_hash {
            if !is_dedicated_single {
                let key = sticky_lookup_key(req.platform_prefix, endpoint_label(req.endpoint), req.api_key_id, session_hash);
                StickySessions::new(self.kv).set(&key, &chosen, self.sticky_ttl_hours).await?;
            }
        }

        Ok(Selection { account_id: chosen, via_sticky: false })
    }

    async fn try_sticky(
        &self,
        req: &ScheduleRequest<'_>,
        session_hash: &str,
        candidates: &[Account],
    ) -> AppResult<Option<Selection>> {
        let sticky = StickySessions::new(self.kv);
        let key = sticky_lookup_key(req.platform_prefix, endpoint_label(req.endpoint), req.api_key_id, session_hash);

        let Some(account_id) = sticky.get(&key).await? else {
            return Ok(None);
        };

        let still_valid = candidates
            .iter()
            .find(|a| a.id == account_id)
            .map(|a| a.is_candidate() && a.supports_endpoint(req.endpoint) && a.supports_model(req.requested_model))
            .unwrap_or(false);

        if !still_valid {
            sticky.delete(&key).await?;
            return Ok(None);
        }

        sticky
            .renew_if_needed(&key, &account_id, self.sticky_ttl_hours, self.renewal_threshold_minutes)
            .await?;

        Ok(Some(Selection { account_id, via_sticky: true }))
    }

    pub async fn mark_used(&self, account: &crate::accounts::Platform, account_id: &str, now_millis: i64) -> AppResult<()> {
        let key = account.account_hash_key(account_id);
        self.kv.hset(&key, "lastUsedAt", &now_millis.to_string()).await
    }
}

fn endpoint_label(e: EndpointType) -> &'static str {
    match e {
        EndpointType::Anthropic => "anthropic",
        EndpointType::Openai => "openai",
        EndpointType::Comm => "comm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountStatus, AccountType, Platform};

    fn make_account(id: &str, priority: i32, last_used_at: i64) -> Account {
        Account {
            id: id.to_string(),
            name: id.to_string(),
            platform: Platform::Openai,
            encrypted_credential: String::new(),
            endpoint_type: None,
            base_url: None,
            priority,
            account_type: AccountType::Shared,
            group_ids: vec![],
            is_active: true,
            schedulable: true,
            status: AccountStatus::Active,
            rate_limited_at: None,
            model_mapping: Default::default(),
            supported_models: vec![],
            subscription_expires_at: None,
            created_at: 0,
            last_used_at,
        }
    }

    #[test]
    fn sort_prefers_lower_priority_then_less_recently_used() {
        let a = make_account("a", 50, 100);
        let b = make_account("b", 10, 500);
        let c = make_account("c", 10, 200);
        let mut v = vec![&a, &b, &c];
        Scheduler::sort_candidates(&mut v);
        assert_eq!(v[0].id, "c");
        assert_eq!(v[1].id, "b");
        assert_eq!(v[2].id, "a");
    }

    #[test]
    fn filter_excludes_unschedulable() {
        let mut a = make_account("a", 50, 0);
        a.schedulable = false;
        let accounts = vec![a];
        let req = ScheduleRequest {
            platform_prefix: "openai",
            endpoint: EndpointType::Openai,
            api_key_id: None,
            session_hash: None,
            requested_model: "gpt-4o",
            binding: Binding::None,
        };
        assert!(Scheduler::filter_candidates(&req, &accounts).is_empty());
    }
}
