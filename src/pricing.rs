//! Pricing Engine
//!
//! A pure function once the price table is loaded: no store I/O happens
//! inside `calculate_cost`. The table itself is process-wide state, bootstrapped
//! at startup from a bundled fallback file (`load_fallback_table`) and kept
//! current by a background task (`refresh_loop`) that re-fetches from a
//! configured URL every 24h and polls a hash endpoint every 10 min to catch
//! changes in between, all without blocking request handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const HASH_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const TABLE_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelPrice {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    #[serde(default)]
    pub cache_creation_input_token_cost: Option<f64>,
    #[serde(default)]
    pub cache_read_input_token_cost: Option<f64>,
    #[serde(default)]
    pub input_cost_per_token_above_200k_tokens: Option<f64>,
    #[serde(default)]
    pub output_cost_per_token_above_200k_tokens: Option<f64>,
    #[serde(default)]
    pub input_cost_per_token_above_1hr: Option<f64>,
    #[serde(default)]
    pub provider_specific_entry: Option<ProviderSpecificEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSpecificEntry {
    #[serde(default)]
    pub fast: Option<f64>,
}

#[derive(Debug, Default)]
pub struct PriceTable {
    pub models: HashMap<String, ModelPrice>,
}

pub struct PricingService {
    table: RwLock<PriceTable>,
}

impl Default for PricingService {
    fn default() -> Self {
        Self::new(PriceTable::default())
    }
}

impl PricingService {
    pub fn new(table: PriceTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }

    pub fn replace_table(&self, table: PriceTable) {
        *self.table.write().unwrap() = table;
    }

    fn lookup(&self, model: &str) -> Option<ModelPrice> {
        self.table.read().unwrap().models.get(model).cloned()
    }

    pub fn calculate_cost(&self, model: &str, usage: &UsageInput) -> CostBreakdown {
        let stripped_model = model.trim_end_matches("[1m]").to_string();
        let context_1m_suffix = model.ends_with("[1m]");
        let context_1m_requested = context_1m_suffix
            || usage
                .anthropic_beta
                .iter()
                .any(|b| b.contains("context-1m-2025-08-07"));

        let price = match self.lookup(&stripped_model) {
            Some(p) => p,
            None => {
                crate::logger::warn(
                    "pricing",
                    &format!("no price entry for model '{stripped_model}', defaulting cost to 0"),
                );
                return CostBreakdown::default();
            }
        };

        let total_input = usage.input_tokens + usage.cache_creation_tokens + usage.cache_read_tokens;
        let is_long_context = context_1m_requested && total_input > 200_000;
        let is_claude_family = stripped_model.to_lowercase().contains("claude");

        let (mut input_price, mut output_price) = (price.input_cost_per_token, price.output_cost_per_token);
        if is_long_context {
            if let Some(p) = price.input_cost_per_token_above_200k_tokens {
                input_price = p;
            } else if is_claude_family {
                input_price *= 2.0;
            }
            if let Some(p) = price.output_cost_per_token_above_200k_tokens {
                output_price = p;
            }
        }

        let fast_mode_requested = usage
            .anthropic_beta
            .iter()
            .any(|b| b.contains("fast-mode-2026-02-01"))
            && usage.request_speed.as_deref() == Some("fast");

        let mut fast_multiplier = 1.0;
        if fast_mode_requested {
            fast_multiplier = match price.provider_specific_entry.as_ref().and_then(|e| e.fast) {
                Some(m) if m > 0.0 => m,
                _ => {
                    crate::logger::warn(
                        "pricing",
                        "fast mode requested but no provider fast multiplier configured; using 1.0",
                    );
                    1.0
                }
            };
        }

        let effective_input_price = input_price * fast_multiplier;
        let effective_output_price = output_price * fast_multiplier;

        let (cache_create_price, cache_read_price, ephemeral_1h_price) = if is_claude_family {
            (
                effective_input_price * 1.25,
                effective_input_price * 0.1,
                effective_input_price * 2.0,
            )
        } else {
            let cache_create = price.cache_creation_input_token_cost.unwrap_or(0.0);
            let cache_read = price.cache_read_input_token_cost.unwrap_or(0.0);
            let ephemeral_1h = price
                .input_cost_per_token_above_1hr
                .unwrap_or_else(|| family_default_1h_price(&stripped_model));
            (cache_create, cache_read, ephemeral_1h)
        };

        let input_cost = usage.input_tokens as f64 * effective_input_price;
        let output_cost = usage.output_tokens as f64 * effective_output_price;

        let (cache_write_cost, ephemeral_5m_cost, ephemeral_1h_cost) = if let Some(split) = &usage.cache_creation_split
        {
            let eph5 = split.ephemeral_5m_input_tokens as f64 * cache_create_price;
            let eph1 = split.ephemeral_1h_input_tokens as f64 * ephemeral_1h_price;
            (eph5 + eph1, eph5, eph1)
        } else {
            let all = usage.cache_creation_tokens as f64 * cache_create_price;
            (all, all, 0.0)
        };

        let cache_read_cost = usage.cache_read_tokens as f64 * cache_read_price;

        let total = input_cost + output_cost + cache_write_cost + cache_read_cost;

        CostBreakdown {
            input: input_cost,
            output: output_cost,
            cache_write: cache_write_cost,
            cache_read: cache_read_cost,
            ephemeral_5m: ephemeral_5m_cost,
            ephemeral_1h: ephemeral_1h_cost,
            total,
            is_long_context_request: is_long_context,
        }
    }
}

/// Loads the bundled fallback price table from disk, or an empty table if
/// the path is unset or unreadable. Bootstraps the service before the first
/// remote refresh completes.
pub fn load_fallback_table(path: Option<&Path>) -> PriceTable {
    let Some(path) = path else { return PriceTable::default() };
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<HashMap<String, ModelPrice>>(&raw) {
            Ok(models) => PriceTable { models },
            Err(e) => {
                crate::logger::warn("pricing", &format!("fallback table at {path:?} is not valid json: {e}"));
                PriceTable::default()
            }
        },
        Err(e) => {
            crate::logger::warn("pricing", &format!("could not read fallback table at {path:?}: {e}"));
            PriceTable::default()
        }
    }
}

/// Keeps the in-memory price table current: a 24h full re-fetch from
/// `pricing_url`, a 10-minute poll of `hash_url` that only re-fetches on
/// change, and nothing else; the file-watch leg described in the module
/// doc is handled by a one-shot reload at startup (`load_fallback_table`)
/// rather than a standing watcher, since the fallback file is expected to
/// change only on deploy.
pub async fn refresh_loop(service: std::sync::Arc<PricingService>, pricing_url: Option<String>, hash_url: Option<String>) {
    let Some(pricing_url) = pricing_url else {
        crate::logger::info("pricing", "no pricing_url configured, skipping remote refresh loop");
        return;
    };
    let client = reqwest::Client::new();
    let mut last_hash: Option<String> = None;
    let mut last_full_refresh = tokio::time::Instant::now() - TABLE_REFRESH_INTERVAL;

    loop {
        let due_for_full_refresh = last_full_refresh.elapsed() >= TABLE_REFRESH_INTERVAL;
        let hash_changed = if let Some(hash_url) = &hash_url {
            match client.get(hash_url).send().await.and_then(|r| r.error_for_status()) {
                Ok(resp) => match resp.text().await {
                    Ok(hash) => {
                        let changed = last_hash.as_deref() != Some(hash.as_str());
                        last_hash = Some(hash);
                        changed
                    }
                    Err(_) => false,
                },
                Err(e) => {
                    crate::logger::warn("pricing", &format!("hash poll failed: {e}"));
                    false
                }
            }
        } else {
            false
        };

        if due_for_full_refresh || hash_changed {
            match client.get(&pricing_url).send().await.and_then(|r| r.error_for_status()) {
                Ok(resp) => match resp.json::<HashMap<String, ModelPrice>>().await {
                    Ok(models) => {
                        service.replace_table(PriceTable { models });
                        last_full_refresh = tokio::time::Instant::now();
                        crate::logger::info("pricing", "price table refreshed");
                    }
                    Err(e) => crate::logger::warn("pricing", &format!("price table response was not valid json: {e}")),
                },
                Err(e) => crate::logger::warn("pricing", &format!("price table fetch failed: {e}")),
            }
        }

        tokio::time::sleep(HASH_POLL_INTERVAL).await;
    }
}

/// Watches the fallback price-table file on disk and reparses it into the
/// service on change, debounced 500ms so a burst of writes from an editor or
/// a deploy step collapses into a single reload. Grounded on the debounced
/// `notify::RecommendedWatcher` + channel shape used elsewhere in the pack
/// for config hot-reload; runs on its own OS thread since `notify`'s
/// callback is synchronous and this crate's async runtime shouldn't block
/// on filesystem events.
pub fn watch_fallback_file(service: std::sync::Arc<PricingService>, path: PathBuf) {
    std::thread::spawn(move || {
        use notify::{RecursiveMode, Watcher};

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                crate::logger::warn("pricing", &format!("could not start fallback-file watcher: {e}"));
                return;
            }
        };

        let Some(parent) = path.parent() else { return };
        if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
            crate::logger::warn("pricing", &format!("could not watch {parent:?}: {e}"));
            return;
        }

        loop {
            let first = match rx.recv() {
                Ok(ev) => ev,
                Err(_) => return,
            };
            if !is_relevant(&first, &path) {
                continue;
            }
            // Debounce: drain anything else that arrives within 500ms before reloading.
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(_) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => break,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
                }
            }
            let table = load_fallback_table(Some(&path));
            if !table.models.is_empty() {
                service.replace_table(table);
                crate::logger::info("pricing", &format!("reloaded fallback table from {path:?}"));
            }
        }
    });
}

fn is_relevant(ev: &notify::Result<notify::Event>, path: &Path) -> bool {
    let Ok(ev) = ev else { return false };
    if !matches!(ev.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
        return false;
    }
    ev.paths.iter().any(|p| p == path)
}

/// Model-family-default 1h-cache price ($/token), resolved by keyword match
/// when the table has no explicit `*_above_1hr` entry.
fn family_default_1h_price(model: &str) -> f64 {
    let m = model.to_lowercase();
    if m.contains("opus") {
        30.0 / 1_000_000.0
    } else if m.contains("sonnet") {
        6.0 / 1_000_000.0
    } else if m.contains("haiku") {
        1.8 / 1_000_000.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheCreationSplit {
    pub ephemeral_5m_input_tokens: i64,
    pub ephemeral_1h_input_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct UsageInput {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_split: Option<CacheCreationSplit>,
    pub anthropic_beta: Vec<String>,
    pub request_speed: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub ephemeral_5m: f64,
    pub ephemeral_1h: f64,
    pub total: f64,
    pub is_long_context_request: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sonnet_price() -> ModelPrice {
        ModelPrice {
            input_cost_per_token: 3.0 / 1_000_000.0,
            output_cost_per_token: 15.0 / 1_000_000.0,
            cache_creation_input_token_cost: None,
            cache_read_input_token_cost: None,
            input_cost_per_token_above_200k_tokens: None,
            output_cost_per_token_above_200k_tokens: None,
            input_cost_per_token_above_1hr: None,
            provider_specific_entry: Some(ProviderSpecificEntry { fast: Some(6.0) }),
        }
    }

    fn service_with_sonnet() -> PricingService {
        let mut models = HashMap::new();
        models.insert("claude-sonnet-4-20250514".to_string(), sonnet_price());
        PricingService::new(PriceTable { models })
    }

    #[test]
    fn scenario_200k_tier() {
        let svc = service_with_sonnet();
        let usage = UsageInput {
            input_tokens: 150_000,
            output_tokens: 5_000,
            cache_creation_tokens: 60_000,
            cache_read_tokens: 10_000,
            cache_creation_split: None,
            anthropic_beta: vec![],
            request_speed: None,
        };
        let breakdown = svc.calculate_cost("claude-sonnet-4-20250514[1m]", &usage);
        assert!(breakdown.is_long_context_request);

        let expected_input_price = sonnet_price().input_cost_per_token * 2.0;
        let expected_input_cost = 150_000.0 * expected_input_price;
        assert!((breakdown.input - expected_input_cost).abs() < 1e-9);

        let expected_cache_create = 60_000.0 * (expected_input_price * 1.25);
        assert!((breakdown.cache_write - expected_cache_create).abs() < 1e-9);

        let expected_cache_read = 10_000.0 * (expected_input_price * 0.1);
        assert!((breakdown.cache_read - expected_cache_read).abs() < 1e-9);
    }

    #[test]
    fn scenario_fast_mode() {
        let svc = service_with_sonnet();
        let usage = UsageInput {
            input_tokens: 1_000,
            output_tokens: 1_000,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_split: None,
            anthropic_beta: vec!["fast-mode-2026-02-01".to_string()],
            request_speed: Some("fast".to_string()),
        };
        let breakdown = svc.calculate_cost("claude-sonnet-4-20250514", &usage);

        let base_input = sonnet_price().input_cost_per_token;
        let base_output = sonnet_price().output_cost_per_token;
        assert!((breakdown.input - 1_000.0 * base_input * 6.0).abs() < 1e-9);
        assert!((breakdown.output - 1_000.0 * base_output * 6.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_defaults_to_zero_cost() {
        let svc = service_with_sonnet();
        let usage = UsageInput {
            input_tokens: 100,
            ..Default::default()
        };
        let breakdown = svc.calculate_cost("unknown-model", &usage);
        assert_eq!(breakdown.total, 0.0);
    }
}
