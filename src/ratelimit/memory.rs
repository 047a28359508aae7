//! In-process limiter backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::clock::Clock;
use super::key::ClientKey;
use super::policy::Policy;
use super::window::{Decision, Escalation, WindowState};
use crate::error::Result;

/// Volatile limiter state held in this process.
///
/// Each key's [`WindowState`] lives in a sharded [`DashMap`]; a decision
/// holds the key's entry for its whole duration, so concurrent requests for
/// one key are serialized while other keys proceed on other shards.
pub struct InMemoryLimiter {
    /// Per-key admission state
    windows: DashMap<String, WindowState>,
    /// Block policy applied on repeated violations
    escalation: Escalation,
}

impl InMemoryLimiter {
    /// Create a limiter with the default escalation policy.
    pub fn new() -> Self {
        Self::with_escalation(Escalation::default())
    }

    /// Create a limiter with a custom escalation policy.
    pub fn with_escalation(escalation: Escalation) -> Self {
        Self {
            windows: DashMap::new(),
            escalation,
        }
    }

    /// Decide admission synchronously.
    pub fn decide_now(&self, key: &ClientKey, policy: &Policy, now: DateTime<Utc>) -> Decision {
        let storage_key = key.to_string_key();

        trace!(key = %storage_key, "Checking rate limit");

        let mut state = self.windows.entry(storage_key.clone()).or_insert_with(|| {
            debug!(
                key = %storage_key,
                limit = policy.limit,
                window_secs = policy.window_secs,
                "Creating new window"
            );
            WindowState::new()
        });
        state.decide(now, policy, &self.escalation)
    }

    /// Drop every key whose window and block have fully expired.
    ///
    /// Returns the number of keys removed.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| !state.is_idle(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed = removed, "Purged idle windows");
        }
        removed
    }

    /// Run [`purge_idle`](Self::purge_idle) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.purge_idle(clock.now());
            }
        })
    }

    /// Get the number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Get the admitted count recorded for a key, if it is tracked.
    pub fn admitted_count(&self, key: &ClientKey) -> Option<usize> {
        self.windows
            .get(&key.to_string_key())
            .map(|state| state.admitted_count())
    }

    /// Clear all state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Default for InMemoryLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Limiter for InMemoryLimiter {
    async fn decide(
        &self,
        key: &ClientKey,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        Ok(self.decide_now(key, policy, now))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
