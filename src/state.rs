//! Shared application state for Axum handlers.
//!
//! - **Configuration**: Runtime configuration access
//! - **Logger**: Per-request structured logging
//! - **Limiter registry**: The per-client token buckets, shared between the
//!   rate limit middleware and the admin limiter endpoint
//!
//! # Structured Concurrency
//!
//! The optional idle-bucket sweeper is managed using
//! `tokio_util::task::TaskTracker` and `CancellationToken`. Call `shutdown()`
//! to stop it before application exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::ServerError;
use crate::logging::Logger;
use crate::metrics;
use crate::middleware::LimiterRegistry;

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// Background tasks are spawned when the state is created. Call `shutdown()`
/// before dropping to ensure clean task termination:
///
/// ```rust,ignore
/// let state = AppState::new(config, Logger::tracing())?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Logger handed to middleware and handlers
    pub logger: Logger,
    /// Per-client buckets; `None` when rate limiting is disabled
    pub limiter: Option<Arc<LimiterRegistry>>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// # Background Tasks
    ///
    /// When `RATE_LIMIT_IDLE_EVICT_SECS` is non-zero this spawns the idle
    /// bucket sweeper, so it must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if the rate limit parameters are invalid.
    pub fn new(config: Config, logger: Logger) -> Result<Self, ServerError> {
        let limiter = if config.rate_limiting_enabled() {
            let registry = LimiterRegistry::new(config.rate_limit_rps, config.rate_limit_burst)
                .map_err(|e| ServerError::Config(e.to_string()))?;
            Some(Arc::new(registry))
        } else {
            None
        };

        let state = Self {
            config: Arc::new(config),
            logger,
            limiter,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        if state.config.idle_eviction_enabled()
            && let Some(registry) = &state.limiter
        {
            state.spawn_eviction_task(registry.clone(), state.config.rate_limit_idle_evict);
        }

        Ok(state)
    }

    /// Spawn the idle bucket sweeper.
    ///
    /// Sweeps every `max_idle / 2` (at least once a second) and removes
    /// buckets that are full and have been unused for `max_idle`.
    fn spawn_eviction_task(&self, registry: Arc<LimiterRegistry>, max_idle: Duration) {
        let cancel = self.cancellation_token.clone();
        let period = (max_idle / 2).max(Duration::from_secs(1));

        info!(max_idle = ?max_idle, period = ?period, "Idle limiter eviction enabled");

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Limiter eviction task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = registry.evict_idle(max_idle);
                        let remaining = registry.len();
                        metrics::set_rate_limiter_keys(remaining);
                        if removed > 0 {
                            debug!(removed, remaining, "Evicted idle rate limiter keys");
                        } else {
                            trace!(remaining, "No idle rate limiter keys to evict");
                        }
                    }
                }
            }

            debug!("Limiter eviction task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals the tasks, closes the tracker and waits for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Number of background tasks still running.
    pub fn background_tasks(&self) -> usize {
        self.task_tracker.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::logging::CaptureSink;

    fn logger() -> Logger {
        Logger::new(CaptureSink::new())
    }

    #[tokio::test]
    async fn test_limiter_present_by_default() {
        let state = AppState::new(Config::default(), logger()).unwrap();
        let limiter = state.limiter.as_ref().unwrap();
        assert_eq!(limiter.rate(), 10.0);
        assert_eq!(limiter.burst(), 20);
        assert_eq!(state.background_tasks(), 0);
    }

    #[tokio::test]
    async fn test_limiter_absent_when_disabled() {
        let config = Config {
            rate_limit_rps: 0.0,
            ..Config::default()
        };
        let state = AppState::new(config, logger()).unwrap();
        assert!(state.limiter.is_none());
    }

    #[tokio::test]
    async fn test_invalid_limiter_config_is_rejected() {
        let config = Config {
            rate_limit_burst: 0,
            ..Config::default()
        };
        assert!(matches!(
            AppState::new(config, logger()),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_sweeps_and_stops() {
        let config = Config {
            rate_limit_idle_evict: Duration::from_secs(4),
            ..Config::default()
        };
        let state = AppState::new(config, logger()).unwrap();
        assert_eq!(state.background_tasks(), 1);

        let registry = state.limiter.clone().unwrap();
        registry.get_limiter("203.0.113.9");
        assert_eq!(registry.len(), 1);

        // Sweeps run every 2s; the bucket is idle enough by the 4s sweep.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(registry.is_empty());

        state.shutdown().await;
        assert_eq!(state.background_tasks(), 0);
    }
}
