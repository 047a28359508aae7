//! Rate limiting logic and state management.

mod backend;
mod clock;
mod key;
mod memory;
mod policy;
mod redis;
mod window;

pub use backend::Limiter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::ClientKey;
pub use memory::InMemoryLimiter;
pub use policy::{Policy, PolicyClass, PolicyTable};
pub use self::redis::{RedisLimiter, StoreKeys, DEFAULT_KEY_PREFIX};
pub use window::{
    Decision, Escalation, WindowState, DEFAULT_BLOCK_DURATION_SECS, DEFAULT_ESCALATION_MULTIPLIER,
};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{BackendKind, RateLimitingConfig};
use crate::error::Result;

/// An explicitly constructed limiter plus whatever background work it owns.
///
/// Dropping the handle stops the background work; the limiter itself lives
/// as long as any clone of [`LimiterHandle::limiter`].
pub struct LimiterHandle {
    limiter: Arc<dyn Limiter>,
    sweeper: Option<JoinHandle<()>>,
}

impl LimiterHandle {
    /// The shared limiter.
    pub fn limiter(&self) -> Arc<dyn Limiter> {
        self.limiter.clone()
    }

    /// Stop background work.
    pub fn shutdown(mut self) {
        self.stop_sweeper();
    }

    fn stop_sweeper(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl Drop for LimiterHandle {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Build the limiter selected by configuration.
///
/// Must be called inside a tokio runtime when the in-process backend is
/// selected, since it starts the idle-window sweeper.
pub fn build_limiter(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Result<LimiterHandle> {
    let escalation = config.escalation();

    match config.backend {
        BackendKind::Memory => {
            let limiter = Arc::new(InMemoryLimiter::with_escalation(escalation));
            let sweeper = limiter.clone().spawn_sweeper(clock, config.sweep_interval());
            info!(
                backend = "memory",
                block_duration_secs = escalation.block_duration_secs,
                escalation_multiplier = escalation.multiplier,
                "Rate limiter initialized"
            );
            Ok(LimiterHandle {
                limiter,
                sweeper: Some(sweeper),
            })
        }
        BackendKind::Redis => {
            let limiter = RedisLimiter::new(&config.redis.url, escalation)?
                .with_key_prefix(config.redis.key_prefix.clone())
                .with_timeout(config.redis_timeout())
                .with_reconnect_backoff(config.redis_reconnect_backoff());
            info!(
                backend = "redis",
                key_prefix = %config.redis.key_prefix,
                timeout_ms = config.redis.timeout_ms,
                block_duration_secs = escalation.block_duration_secs,
                escalation_multiplier = escalation.multiplier,
                "Rate limiter initialized"
            );
            Ok(LimiterHandle {
                limiter: Arc::new(limiter),
                sweeper: None,
            })
        }
    }
}
