//! Sliding-window admission with escalating blocks.
//!
//! A [`WindowState`] holds everything known about one client key: the
//! timestamps of admitted requests, the timestamps of rejected attempts,
//! and an optional block expiry. All three are mutated together by
//! [`WindowState::decide`], so whoever owns the state only has to make
//! that one call atomic per key.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use super::policy::Policy;

/// Default block length once a client escalates.
pub const DEFAULT_BLOCK_DURATION_SECS: u64 = 900;
/// Default multiple of the limit at which a client escalates.
pub const DEFAULT_ESCALATION_MULTIPLIER: u32 = 2;

/// Converts sustained abuse into a flat temporary deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// How long a block lasts, in seconds
    pub block_duration_secs: u64,
    /// Observed requests per window, as a multiple of the limit, that trigger a block
    pub multiplier: u32,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            block_duration_secs: DEFAULT_BLOCK_DURATION_SECS,
            multiplier: DEFAULT_ESCALATION_MULTIPLIER,
        }
    }
}

impl Escalation {
    /// Create an escalation policy.
    pub fn new(block_duration_secs: u64, multiplier: u32) -> Self {
        Self {
            block_duration_secs,
            multiplier,
        }
    }

    /// Observed count at which a rejection turns into a block.
    pub fn threshold(&self, limit: u32) -> u64 {
        u64::from(limit).saturating_mul(u64::from(self.multiplier))
    }

    /// Block length as a signed duration.
    pub fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.block_duration_secs as i64)
    }
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The limit of the policy that was applied
    pub limit: u32,
    /// Admissions left in the current window
    pub remaining: u32,
    /// When the client regains quota (or the block lifts)
    pub reset_time: DateTime<Utc>,
    /// How long the client should wait; zero when allowed
    pub retry_after: chrono::Duration,
    /// Whether the denial comes from an escalation block
    pub blocked: bool,
}

impl Decision {
    /// An admitted request.
    pub fn admitted(limit: u32, remaining: u32, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_time,
            retry_after: chrono::Duration::zero(),
            blocked: false,
        }
    }

    /// A request rejected by the window check.
    pub fn rejected(limit: u32, reset_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time,
            retry_after: (reset_time - now).max(chrono::Duration::zero()),
            blocked: false,
        }
    }

    /// A request denied because the key is blocked until `until`.
    pub fn blocked(limit: u32, until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            blocked: true,
            ..Self::rejected(limit, until, now)
        }
    }

    /// `retry_after` floored to whole seconds, for headers and bodies.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.num_seconds().max(0) as u64
    }

    /// `reset_time` as epoch seconds.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_time.timestamp()
    }
}

/// Per-key admission state.
#[derive(Debug, Clone)]
pub struct WindowState {
    /// Admitted request timestamps, oldest first
    admitted: VecDeque<DateTime<Utc>>,
    /// Rejected attempt timestamps, oldest first
    rejected: VecDeque<DateTime<Utc>>,
    /// Block expiry, if the key escalated
    blocked_until: Option<DateTime<Utc>>,
    /// Window of the policy last applied to this key
    window: chrono::Duration,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            admitted: VecDeque::new(),
            rejected: VecDeque::new(),
            blocked_until: None,
            window: chrono::Duration::zero(),
        }
    }
}

impl WindowState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a request arriving at `now` is admitted.
    pub fn decide(
        &mut self,
        now: DateTime<Utc>,
        policy: &Policy,
        escalation: &Escalation,
    ) -> Decision {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Decision::blocked(policy.limit, until, now);
            }
            self.blocked_until = None;
        }

        self.window = policy.window();
        self.prune(now);

        let admitted = self.admitted.len() as u64;
        if admitted >= u64::from(policy.limit) {
            let observed = admitted + self.rejected.len() as u64;
            if observed >= escalation.threshold(policy.limit) {
                let until = now + escalation.block_duration();
                self.blocked_until = Some(until);
                return Decision::blocked(policy.limit, until, now);
            }

            self.rejected.push_back(now);
            // admitted >= limit > 0, so there is an oldest entry
            let oldest = self.admitted.front().copied().unwrap_or(now);
            return Decision::rejected(policy.limit, oldest + self.window, now);
        }

        self.admitted.push_back(now);
        let remaining = policy.limit - self.admitted.len() as u32;
        Decision::admitted(policy.limit, remaining, now + self.window)
    }

    /// Drop entries whose age is at least one window.
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.admitted.front().is_some_and(|ts| *ts <= cutoff) {
            self.admitted.pop_front();
        }
        while self.rejected.front().is_some_and(|ts| *ts <= cutoff) {
            self.rejected.pop_front();
        }
    }

    /// Whether nothing in this state can affect a future decision.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let block_over = self.blocked_until.map_or(true, |until| until <= now);
        let cutoff = now - self.window;
        let window_over = self
            .admitted
            .back()
            .into_iter()
            .chain(self.rejected.back())
            .all(|ts| *ts <= cutoff);
        block_over && window_over
    }

    /// Number of admitted requests currently recorded.
    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    /// Block expiry, if any.
    pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        self.blocked_until
    }
}
