use std::sync::Arc;

use ccr_relay::accounts;
use ccr_relay::config;
use ccr_relay::kv::KvStore;
use ccr_relay::logger;
use ccr_relay::pricing::{self, PricingService};
use ccr_relay::relay::RelayOrchestrator;
use ccr_relay::server::{self, AppState};

#[tokio::main]
async fn main() {
    logger::init();
    logger::info("app", "starting relay");

    std::panic::set_hook(Box::new(|panic_info| {
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error("panic", &format!("panic: {message} at {location}"));
    }));

    let settings = config::load();

    let kv = match KvStore::connect(&settings.redis.url).await {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            logger::error("app", &format!("could not connect to store at {}: {e}", settings.redis.url));
            std::process::exit(1);
        }
    };

    let fallback_table = pricing::load_fallback_table(settings.pricing.fallback_path.as_deref());
    let pricing_service = Arc::new(PricingService::new(fallback_table));

    tokio::spawn(pricing::refresh_loop(
        pricing_service.clone(),
        settings.pricing.pricing_url.clone(),
        settings.pricing.hash_url.clone(),
    ));

    if let Some(path) = settings.pricing.fallback_path.clone() {
        pricing::watch_fallback_file(pricing_service.clone(), path);
    }

    tokio::spawn(accounts::group_membership_refresh_loop(kv.clone(), 300));

    let orchestrator = Arc::new(RelayOrchestrator {
        kv: kv.clone(),
        pricing: pricing_service.clone(),
        tz_offset_hours: settings.system.timezone_offset,
        metrics_window_minutes: settings.system.metrics_window_minutes,
        sticky_ttl_hours: settings.session.sticky_ttl_hours,
        renewal_threshold_minutes: settings.session.renewal_threshold_minutes,
        lease_seconds: settings.concurrency.lease_seconds,
        renew_interval_seconds: settings.concurrency.renew_interval_seconds,
        queue_poll_interval_ms: 200,
    });

    let encryptors = Arc::new(ccr_relay::crypto::EncryptorRegistry::new(
        settings.security.encryption_key.clone(),
    ));

    let bind_addr = settings.server.bind_addr.clone();
    let state = AppState {
        kv,
        pricing: pricing_service,
        settings: Arc::new(settings),
        orchestrator,
        encryptors,
    };

    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve(state, &bind_addr).await {
            logger::error("app", &format!("server exited with error: {e}"));
        }
    });

    tokio::select! {
        _ = server_task => {}
        _ = tokio::signal::ctrl_c() => {
            logger::info("app", "received shutdown signal");
        }
    }
}
