//! Small helpers shared across the crate.

use crate::config::LoggingConfig;
use crate::error::{PoolError, PoolResult};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Longest delay [`calculate_backoff`] returns, in milliseconds
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff with up to 10% jitter, in milliseconds.
///
/// `attempt` starts at 1; attempt 1 waits roughly `base_ms`, and every
/// further attempt doubles the delay up to [`MAX_BACKOFF_MS`].
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1 << exponent).min(MAX_BACKOFF_MS);
    let jitter = if delay >= 10 {
        rand::rng().random_range(0..=delay / 10)
    } else {
        0
    };
    (delay + jitter).min(MAX_BACKOFF_MS)
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Convert a duration to whole milliseconds, saturating.
pub(crate) fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Install a global `tracing` subscriber from the logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// returns a configuration error.
pub fn init_tracing(config: &LoggingConfig) -> PoolResult<()> {
    let level: tracing::Level = config.level.into();
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.include_targets)
                    .with_thread_names(true),
            )
            .try_init()
    } else if config.include_timestamps {
        registry
            .with(
                fmt::layer()
                    .with_ansi(config.colored)
                    .with_target(config.include_targets)
                    .with_thread_names(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .without_time()
                    .with_ansi(config.colored)
                    .with_target(config.include_targets)
                    .with_thread_names(true),
            )
            .try_init()
    };

    installed.map_err(|e| PoolError::config(format!("failed to install tracing subscriber: {e}")))
}
