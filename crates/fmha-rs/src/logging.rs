//! Tracing subscriber setup.
//!
//! The filter comes from `FMHA_RS_LOG`, then `RUST_LOG`, then defaults to `warn`.

use std::env;
use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "FMHA_RS_LOG";
const FALLBACK_LOG_ENV: &str = "RUST_LOG";
const DEFAULT_FILTER: &str = "warn";

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
}

/// Installs a global fmt subscriber. Calling it again is a no-op.
///
/// A subscriber installed elsewhere first is left in place.
pub fn init_logging() -> Result<(), LoggingError> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }
    let filter = resolve_filter(
        env::var(LOG_ENV).ok().as_deref(),
        env::var(FALLBACK_LOG_ENV).ok().as_deref(),
    );
    let env_filter =
        EnvFilter::try_new(&filter).map_err(|err| LoggingError::InvalidFilter {
            filter: filter.clone(),
            reason: err.to_string(),
        })?;
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init();
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

fn resolve_filter(primary: Option<&str>, fallback: Option<&str>) -> String {
    [primary, fallback]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}
