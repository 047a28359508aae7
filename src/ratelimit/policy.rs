//! Policy classes and the policy table.
//!
//! Every rate-limited endpoint belongs to exactly one policy class. Each
//! class carries a `{limit, window}` pair; the built-in table can be
//! overridden per class from configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, TollgateError};

/// Named category of endpoints sharing one limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    /// The login endpoint itself.
    AuthLogin,
    /// Everything else under the auth namespace.
    AuthGeneral,
    /// Password reset flows.
    PasswordReset,
    /// File uploads.
    Upload,
    /// Sensitive API resources (admin, users, invitations).
    ApiStrict,
    /// Remaining API traffic.
    ApiGeneral,
}

impl PolicyClass {
    /// All classes, in classifier precedence order.
    pub const ALL: [PolicyClass; 6] = [
        PolicyClass::AuthLogin,
        PolicyClass::AuthGeneral,
        PolicyClass::PasswordReset,
        PolicyClass::Upload,
        PolicyClass::ApiStrict,
        PolicyClass::ApiGeneral,
    ];

    /// Stable name used in keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyClass::AuthLogin => "auth_login",
            PolicyClass::AuthGeneral => "auth_general",
            PolicyClass::PasswordReset => "password_reset",
            PolicyClass::Upload => "upload",
            PolicyClass::ApiStrict => "api_strict",
            PolicyClass::ApiGeneral => "api_general",
        }
    }

    /// The built-in limit for this class.
    pub fn default_policy(&self) -> Policy {
        match self {
            PolicyClass::AuthLogin => Policy::new(5, 900),
            PolicyClass::AuthGeneral => Policy::new(20, 60),
            PolicyClass::PasswordReset => Policy::new(3, 3600),
            PolicyClass::Upload => Policy::new(10, 300),
            PolicyClass::ApiStrict => Policy::new(30, 60),
            PolicyClass::ApiGeneral => Policy::new(100, 60),
        }
    }
}

impl fmt::Display for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limit and the trailing window it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum admitted requests inside the window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Policy {
    /// Create a policy. Use [`Policy::validate`] before trusting user input.
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// Window length as a signed duration for timestamp arithmetic.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }

    /// Reject non-positive limits and windows.
    pub fn validate(&self, class: PolicyClass) -> Result<()> {
        if self.limit == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must have a positive limit",
                class
            )));
        }
        if self.window_secs == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must have a positive window",
                class
            )));
        }
        // Keeps window arithmetic (and redis microsecond scores) in range.
        if self.window_secs > i32::MAX as u64 {
            return Err(TollgateError::Config(format!(
                "policy '{}' window of {}s is too large",
                class, self.window_secs
            )));
        }
        Ok(())
    }
}

/// Immutable mapping of policy class to its limit.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<PolicyClass, Policy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = PolicyClass::ALL
            .iter()
            .map(|class| (*class, class.default_policy()))
            .collect();
        Self { policies }
    }
}

impl PolicyTable {
    /// Build a table from the defaults with the given per-class overrides.
    ///
    /// Fails if any resulting policy has a zero limit or window.
    pub fn with_overrides(overrides: &HashMap<PolicyClass, Policy>) -> Result<Self> {
        let mut table = Self::default();
        for (class, policy) in overrides {
            policy.validate(*class)?;
            table.policies.insert(*class, *policy);
        }
        Ok(table)
    }

    /// Look up the policy for a class.
    pub fn get(&self, class: PolicyClass) -> Policy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }
}
