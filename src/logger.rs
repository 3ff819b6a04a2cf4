//! Structured logging
//!
//! Thin wrappers over `tracing` macros that keep the call-site shape used
//! throughout this codebase (`logger::info("source", "message")`) so the
//! rest of the crate reads the same whether the sink underneath is a
//! terminal, a file appender, or a collector, configured once in
//! `main.rs` via `tracing-subscriber`.

pub fn debug(source: &str, message: &str) {
    tracing::debug!(target: "ccr_relay", source, "{}", message);
}

pub fn info(source: &str, message: &str) {
    tracing::info!(target: "ccr_relay", source, "{}", message);
}

pub fn warn(source: &str, message: &str) {
    tracing::warn!(target: "ccr_relay", source, "{}", message);
}

pub fn error(source: &str, message: &str) {
    tracing::error!(target: "ccr_relay", source, "{}", message);
}

/// Installs the global subscriber. Called once from `main`.
pub fn init() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
