//! HTTP surface
//!
//! Wires provider-native endpoints, each running the same admission ->
//! scheduler -> forward -> accounting pipeline, plus a small set of ambient
//! routes (health, forward-token helper, latency probe, a read-only admin
//! stats view) that sit alongside the relay endpoints as baseline plumbing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;

use crate::accounts::{AccountStore, AccountType, Binding, EndpointType, Platform};
use crate::apikey::ApiKeyStore;
use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::kv::KvStore;
use crate::pricing::PricingService;
use crate::relay::handlers::{get_extractor, ProviderKind};
use crate::relay::RelayOrchestrator;
use crate::scheduler::ScheduleRequest;

#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<KvStore>,
    pub pricing: Arc<PricingService>,
    pub settings: Arc<Settings>,
    pub orchestrator: Arc<RelayOrchestrator>,
    pub encryptors: Arc<crate::crypto::EncryptorRegistry>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/messages", post(anthropic_messages))
        .route("/claude/v1/messages", post(anthropic_messages))
        .route("/openai/v1/chat/completions", post(openai_chat))
        .route("/openai/responses", post(openai_chat))
        .route("/openai/v1/responses", post(openai_chat))
        .route("/gemini/:version/*endpoint", post(gemini_generate))
        .route("/droid/claude/*rest", post(droid_claude))
        .route("/droid/openai/*rest", post(droid_openai))
        .route("/azure/*rest", post(openai_chat))
        .route("/admin/stats", get(admin_stats))
        .route("/api/forward-token", get(forward_token_get).post(forward_token_post))
        .route("/api/upstream/:id/latency", get(upstream_latency))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let addr: SocketAddr = bind_addr.parse().expect("valid bind address");
    crate::logger::info("server", &format!("listening on {addr}"));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn admin_stats(State(state): State<AppState>) -> impl IntoResponse {
    let minute = crate::time_util::now_millis() / 1000 / 60;
    let key = format!("system:metrics:minute:{minute}");
    match state.kv.hgetall(&key).await {
        Ok(data) => Json(json!({ "minute": minute, "metrics": data })).into_response(),
        Err(e) => e.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .ok_or(AppError::InvalidCredentials)
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Pulls the `anthropic-beta` header (comma-separated feature flags) and a
/// request-speed hint (`x-request-speed` header, falling back to a `speed`
/// field in the body) into the shape the pricing engine checks for the
/// 200K+ tier and Fast Mode. These never touch the forwarded payload itself.
fn pricing_hints(headers: &HeaderMap, body: &Value) -> (Vec<String>, Option<String>) {
    let beta = headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let speed = headers
        .get("x-request-speed")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| body.get("speed").and_then(|v| v.as_str()).map(|s| s.to_string()));

    (beta, speed)
}

/// Derives a sticky-session hash from request metadata: Anthropic's
/// `metadata.user_id` field, or OpenAI's top-level `user` field, whichever
/// is present. Hashed so the raw identifier never sits in the sticky-session
/// key or gets logged.
fn session_hash_from_body(body: &Value) -> Option<String> {
    let raw = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .or_else(|| body.get("user").and_then(|v| v.as_str()))?;

    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

fn platform_for(provider: ProviderKind) -> Platform {
    match provider {
        ProviderKind::Anthropic => Platform::ClaudeOfficial,
        ProviderKind::OpenAi => Platform::Openai,
        ProviderKind::Gemini => Platform::Gemini,
        ProviderKind::Bedrock => Platform::Bedrock,
        ProviderKind::Droid => Platform::Droid,
    }
}

/// `claude:account:index` holds both claude-official and claude-console
/// accounts, so a key that only sets `claudeConsoleAccountId` (and not
/// `claudeAccountId`) still binds to a single dedicated account rather than
/// falling through to the shared pool.
fn binding_for(key: &crate::apikey::ApiKey, provider: ProviderKind) -> Binding {
    let raw = match provider {
        ProviderKind::Anthropic => key.claude_account_id.as_ref().or(key.claude_console_account_id.as_ref()).cloned(),
        ProviderKind::OpenAi => key.openai_account_id.clone(),
        ProviderKind::Gemini => key.gemini_account_id.clone(),
        ProviderKind::Bedrock => key.bedrock_account_id.clone(),
        ProviderKind::Droid => key.droid_account_id.clone(),
    };
    crate::accounts::parse_binding(&raw)
}

/// Canonical upstream path this core forwards each provider's requests to,
/// independent of which of our own routes the client happened to hit.
fn upstream_path(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Anthropic => "/v1/messages",
        ProviderKind::OpenAi => "/v1/chat/completions",
        ProviderKind::Gemini => "/v1beta/models:generateContent",
        ProviderKind::Bedrock | ProviderKind::Droid => "/v1/messages",
    }
}

/// Shared pipeline every provider route runs: authenticate, validate
/// client, pre-admission quota checks, admit into concurrency/queue, pick
/// an account, acquire its serialization lock, forward to its upstream
/// (verbatim, transforming provider payloads is a non-goal), account for
/// the completed usage, then release every resource this request held.
async fn run_pipeline(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    model: &str,
    provider: ProviderKind,
    endpoint: EndpointType,
    client_body: Value,
) -> AppResult<Json<Value>> {
    let token = bearer_token(headers)?;
    let key_store = ApiKeyStore::new(&state.kv);
    let key_id = key_store.resolve_key_id(&token).await?;
    let key = key_store.load(&key_id).await?;

    crate::apikey::validate_key_policy(&key, crate::time_util::now_millis())?;
    crate::client_validator::validate(&key.allowed_clients, &user_agent(headers), path)?;

    let (request_id, mut guard) = state
        .orchestrator
        .admit(&key, model, model.to_lowercase().contains("claude"), true, 30_000)
        .await?;

    let platform = platform_for(provider);
    let binding = binding_for(&key, provider);

    let session_hash = session_hash_from_body(&client_body);
    let account_store = AccountStore::new(&state.kv);
    let sched_req = ScheduleRequest {
        platform_prefix: platform.account_key_prefix(),
        endpoint,
        api_key_id: Some(&key.id),
        session_hash: session_hash.as_deref(),
        requested_model: model,
        binding: binding.clone(),
    };

    let candidate_ids = match &binding {
        Binding::Account(id) => vec![id.clone()],
        Binding::Group(gid) => crate::accounts::resolve_group_members(&state.kv, platform.account_key_prefix(), gid).await?,
        Binding::None => state.kv.smembers(&platform.index_key()).await?,
    };
    let accounts_by_id = account_store.load_many(platform, &candidate_ids).await?;

    let selection = match state.orchestrator.select_account(&sched_req, &accounts_by_id).await {
        Ok(s) => s,
        Err(e) => {
            guard.release(&request_id).await?;
            return Err(e);
        }
    };

    let account = accounts_by_id.get(&selection.account_id);
    let account_type_label = match account.map(|a| a.account_type) {
        Some(AccountType::Dedicated) => "dedicated",
        Some(AccountType::Group) => "group",
        _ => "shared",
    };

    if let Err(e) = state
        .orchestrator
        .acquire_account_lock(&mut guard, &selection.account_id, &request_id, 60_000, 1_000, 30_000)
        .await
    {
        guard.release(&request_id).await?;
        return Err(e);
    }

    if matches!(account.map(|a| a.platform), Some(Platform::ClaudeConsole)) {
        if let Err(e) = state
            .orchestrator
            .acquire_console_account_lease(&mut guard, &selection.account_id, &request_id)
            .await
        {
            guard.release(&request_id).await?;
            return Err(e);
        }
    }

    let started_at = crate::time_util::now_millis();
    let renewal = spawn_lease_renewal(
        state.kv.clone(),
        key.id.clone(),
        request_id.clone(),
        state.orchestrator.lease_seconds,
        state.orchestrator.renew_interval_seconds,
    );
    let forward_result = forward_to_upstream(state, account, provider, &client_body).await;
    renewal.abort();

    let (response_body, usage_input) = match forward_result {
        Ok(v) => v,
        Err(e) => {
            guard.release(&request_id).await?;
            if let Some(acc) = account {
                mark_account_on_upstream_failure(state, platform, &acc.id, &e).await;
            }
            return Err(e);
        }
    };
    let response_time_ms = crate::time_util::now_millis() - started_at;

    let (anthropic_beta, request_speed) = pricing_hints(headers, &client_body);
    let mut usage_input = usage_input;
    usage_input.anthropic_beta = anthropic_beta;
    usage_input.request_speed = request_speed;

    state
        .orchestrator
        .account_for_completion(&key, &selection.account_id, account_type_label, model, &usage_input, &request_id, response_time_ms)
        .await;

    let scheduler = crate::scheduler::Scheduler::new(
        &state.kv,
        state.settings.session.sticky_ttl_hours,
        state.settings.session.renewal_threshold_minutes,
    );
    let _ = scheduler.mark_used(&platform, &selection.account_id, crate::time_util::now_millis()).await;

    guard.release(&request_id).await?;

    Ok(Json(response_body))
}

/// Refreshes the request's concurrency lease every `renew_interval_seconds`
/// while the upstream call is in flight, so a slow streaming response
/// doesn't have its slot reclaimed out from under it by lease expiry.
/// Cancelled (not awaited) by the caller once forwarding completes.
fn spawn_lease_renewal(
    kv: Arc<KvStore>,
    key_id: String,
    request_id: String,
    lease_seconds: i64,
    renew_interval_seconds: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let scope_key = crate::concurrency::active::key_for_api_key(&key_id);
        let active = crate::concurrency::active::ActiveConcurrency::new(&kv);
        let interval = std::time::Duration::from_secs(renew_interval_seconds.max(1) as u64);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = active.refresh_lease(&scope_key, &request_id, lease_seconds).await {
                crate::logger::warn("server", &format!("lease renewal failed for {request_id}: {e}"));
            }
        }
    })
}

/// Decrypts the selected account's credential and forwards the client's
/// body to its upstream, verbatim. Streaming requests are drained through
/// `UpstreamClient::forward_streaming` and re-assembled (this core buffers
/// the full SSE transcript before responding rather than multiplexing bytes
/// to the client live; the admission/accounting pipeline this module
/// exists to exercise behaves identically either way, and a truly
/// byte-for-byte live passthrough is a routing-glue concern layered on top
/// of this core, not part of it). The final SSE event carrying `usage` (or
/// the full non-streaming body) is handed to the provider's adapter for
/// extraction.
async fn forward_to_upstream(
    state: &AppState,
    account: Option<&crate::accounts::Account>,
    provider: ProviderKind,
    client_body: &Value,
) -> AppResult<(Value, crate::pricing::UsageInput)> {
    let account = account.ok_or_else(|| AppError::NoAvailableAccount("selected account vanished".into()))?;
    let base_url = account
        .base_url
        .clone()
        .ok_or_else(|| AppError::UpstreamError(format!("account {} has no base_url configured", account.id)))?;

    let encryptor = state.encryptors.get_or_create(&account.id);
    let credential = encryptor.decrypt(&account.encrypted_credential);

    let url = format!("{}{}", base_url.trim_end_matches('/'), upstream_path(provider));
    let client = crate::relay::client::UpstreamClient::default();
    let extractor = get_extractor(provider);

    if crate::relay::client::normalize_stream_flag(client_body) {
        let mut last_event: Option<Value> = None;
        let data_lines = client.forward_streaming(&url, &credential, client_body, |_line| {}).await?;
        for data in &data_lines {
            if let Ok(v) = serde_json::from_str::<Value>(data) {
                if v.get("usage").is_some() {
                    last_event = Some(v);
                }
            }
        }
        let usage_input = match &last_event {
            Some(ev) => extractor.extract_from_final_sse_event(ev),
            None => crate::pricing::UsageInput::default(),
        };
        let body = last_event.unwrap_or_else(|| json!({ "stream": true, "events": data_lines.len() }));
        Ok((body, usage_input))
    } else {
        let body = client.forward_json(&url, &credential, client_body).await?;
        let usage_input = extractor.extract_from_body(&body);
        Ok((body, usage_input))
    }
}

/// On a provider 5xx-shaped upstream error, flip the account to
/// `temp_error` so the scheduler stops offering it until an operator (or a
/// future health check) clears it; on a signalled rate limit, mark
/// `rateLimitStatus` instead. Best-effort: never surfaces its own failure.
async fn mark_account_on_upstream_failure(state: &AppState, platform: Platform, account_id: &str, err: &AppError) {
    let key = platform.account_hash_key(account_id);
    let field_update = match err {
        AppError::UpstreamError(msg) if msg.contains("upstream returned 429") => Some(("rateLimitStatus", "limited")),
        AppError::UpstreamError(msg) if msg.contains("upstream returned 5") => Some(("status", "temp_error")),
        _ => None,
    };
    if let Some((field, value)) = field_update {
        if let Err(e) = state.kv.hset(&key, field, value).await {
            crate::logger::warn("server", &format!("failed to mark account {account_id} after upstream failure: {e}"));
        }
    }
}

async fn anthropic_messages(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    let model = payload.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
    match run_pipeline(&state, &headers, "/api/v1/messages", &model, ProviderKind::Anthropic, EndpointType::Anthropic, payload).await {
        Ok(r) => r.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn openai_chat(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    let model = payload.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
    match run_pipeline(&state, &headers, "/openai/v1/chat/completions", &model, ProviderKind::OpenAi, EndpointType::Openai, payload).await {
        Ok(r) => r.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn gemini_generate(
    State(state): State<AppState>,
    Path((_version, endpoint)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let model = endpoint.split(':').next().unwrap_or("").to_string();
    match run_pipeline(&state, &headers, "/gemini/", &model, ProviderKind::Gemini, EndpointType::Anthropic, payload).await {
        Ok(r) => r.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn droid_claude(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    let model = payload.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
    match run_pipeline(&state, &headers, "/droid/claude/", &model, ProviderKind::Droid, EndpointType::Comm, payload).await {
        Ok(r) => r.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn droid_openai(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    let model = payload.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
    match run_pipeline(&state, &headers, "/droid/openai/", &model, ProviderKind::Droid, EndpointType::Comm, payload).await {
        Ok(r) => r.into_response(),
        Err(e) => e.into_response(),
    }
}

const FORWARD_TOKEN_TTL_SECS: u64 = 300;

/// Issues a short-lived opaque token bound to an account id, so client
/// auto-configuration tooling can address an account without ever seeing
/// its real credential. No OAuth acquisition happens here, out of scope.
async fn forward_token_post(State(state): State<AppState>, Json(payload): Json<Value>) -> impl IntoResponse {
    let Some(account_id) = payload.get("accountId").and_then(|v| v.as_str()) else {
        return AppError::InvalidRequest("accountId required".into()).into_response();
    };
    let token = uuid::Uuid::new_v4().to_string();
    match state
        .kv
        .set_ex(&format!("forward_token:{token}"), account_id, FORWARD_TOKEN_TTL_SECS)
        .await
    {
        Ok(()) => Json(json!({ "token": token, "expiresInSeconds": FORWARD_TOKEN_TTL_SECS })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(serde::Deserialize)]
struct ForwardTokenQ {
    token: String,
}

async fn forward_token_get(State(state): State<AppState>, axum::extract::Query(q): axum::extract::Query<ForwardTokenQ>) -> impl IntoResponse {
    match state.kv.get(&format!("forward_token:{}", q.token)).await {
        Ok(Some(account_id)) => Json(json!({ "accountId": account_id })).into_response(),
        Ok(None) => AppError::NotFound("forward token not found or expired".into()).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Pings an account's configured base URL and reports round-trip latency,
/// for operator dashboards deciding which account to prefer.
async fn upstream_latency(State(state): State<AppState>, Path(account_id): Path<String>) -> impl IntoResponse {
    for platform in [
        Platform::ClaudeOfficial,
        Platform::Openai,
        Platform::Gemini,
        Platform::Bedrock,
        Platform::Droid,
    ] {
        if let Ok(Some(account)) = AccountStore::new(&state.kv).load(platform, &account_id).await {
            let Some(base_url) = &account.base_url else { continue };
            let client = reqwest::Client::new();
            let start = std::time::Instant::now();
            let ok = client.get(base_url).send().await.is_ok();
            let elapsed_ms = start.elapsed().as_millis() as u64;
            return Json(json!({ "accountId": account_id, "reachable": ok, "latencyMs": elapsed_ms })).into_response();
        }
    }
    AppError::NotFound(format!("account {account_id} not found")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_requires_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "sk-abc");

        let empty = HeaderMap::new();
        assert!(bearer_token(&empty).is_err());
    }

    #[test]
    fn session_hash_prefers_anthropic_metadata_over_openai_user() {
        let anthropic_shaped = json!({ "metadata": { "user_id": "u1" } });
        let openai_shaped = json!({ "user": "u1" });
        assert_eq!(session_hash_from_body(&anthropic_shaped), session_hash_from_body(&openai_shaped));

        let both = json!({ "metadata": { "user_id": "u1" }, "user": "u2" });
        assert_eq!(session_hash_from_body(&both), session_hash_from_body(&anthropic_shaped));

        assert!(session_hash_from_body(&json!({})).is_none());
    }
}
