//! Limiter trait for abstracting in-process and shared-store implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::key::ClientKey;
use super::policy::Policy;
use super::window::Decision;
use crate::error::Result;

/// Trait for limiter implementations.
///
/// This trait abstracts over both the [`InMemoryLimiter`](super::InMemoryLimiter)
/// and the [`RedisLimiter`](super::RedisLimiter) so the HTTP layer can work
/// with either. Implementations must make the block check, the window
/// prune, the count and the append a single atomic step per key.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide admission for `key` under `policy` at instant `now`.
    ///
    /// An `Err` means the backend could not answer; it is never a rejection.
    async fn decide(&self, key: &ClientKey, policy: &Policy, now: DateTime<Utc>)
        -> Result<Decision>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
