//! # Structured Logging
//!
//! Environment-aware tracing setup. Development and test environments get
//! human-readable console output; production gets JSON lines suitable for
//! log shippers. `RUST_LOG` overrides the environment-derived filter.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber once. Safe to call from every
/// entry point; later calls and an already-installed subscriber are no-ops.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let registry = tracing_subscriber::registry().with(filter);
        let installed = if environment == "production" {
            registry
                .with(fmt::layer().json().with_target(true).with_ansi(false))
                .try_init()
        } else {
            registry
                .with(fmt::layer().with_target(true).with_level(true))
                .try_init()
        };
        if installed.is_err() {
            // An embedder already set a global subscriber; keep it.
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::debug!(environment = %environment, "Logging initialized");
    });
}

fn get_environment() -> String {
    std::env::var("ATTRIBUTION_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}
