//! Per-request enforcement.
//!
//! Wires classification, identity resolution and the limiter into a single
//! [`Verdict`]. Backend faults never escape from here: they resolve to
//! [`Verdict::FailOpen`] with a warning.

use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::classify::EndpointClassifier;
use super::identity::resolve_client;
use crate::ratelimit::{Clock, ClientKey, Decision, Limiter, PolicyTable, SystemClock};

/// Messages returned to denied callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialMessages {
    /// Body text for an ordinary window rejection
    #[serde(default = "default_throttled")]
    pub throttled: String,

    /// Body text while the client is blocked
    #[serde(default = "default_blocked")]
    pub blocked: String,
}

impl Default for DenialMessages {
    fn default() -> Self {
        Self {
            throttled: default_throttled(),
            blocked: default_blocked(),
        }
    }
}

fn default_throttled() -> String {
    "Demasiadas solicitudes. Intenta de nuevo más tarde.".to_string()
}

fn default_blocked() -> String {
    "IP temporalmente bloqueada por exceso de solicitudes.".to_string()
}

impl DenialMessages {
    /// Pick the message for a denial.
    pub fn for_decision(&self, decision: &Decision) -> &str {
        if decision.blocked {
            &self.blocked
        } else {
            &self.throttled
        }
    }
}

/// What to do with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not subject to limiting; forward untouched.
    Exempt,
    /// Forward and annotate the response.
    Allow(Decision),
    /// Answer 429 without forwarding.
    Deny(Decision),
    /// The backend failed; forward untouched.
    FailOpen,
}

/// The enforcement orchestrator.
pub struct Enforcer {
    limiter: Arc<dyn Limiter>,
    policies: PolicyTable,
    classifier: EndpointClassifier,
    messages: DenialMessages,
    clock: Arc<dyn Clock>,
}

impl Enforcer {
    /// Create an enforcer with default policies, routes and messages.
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        Self {
            limiter,
            policies: PolicyTable::default(),
            classifier: EndpointClassifier::default(),
            messages: DenialMessages::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the policy table.
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Replace the classifier.
    pub fn with_classifier(mut self, classifier: EndpointClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the denial messages.
    pub fn with_messages(mut self, messages: DenialMessages) -> Self {
        self.messages = messages;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configured denial messages.
    pub fn messages(&self) -> &DenialMessages {
        &self.messages
    }

    /// Decide what happens to a request.
    pub async fn evaluate(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Verdict {
        let Some(class) = self.classifier.classify(method, path) else {
            return Verdict::Exempt;
        };

        let client = resolve_client(headers, peer);
        let key = ClientKey::new(class, client);
        let policy = self.policies.get(class);

        match self.limiter.decide(&key, &policy, self.clock.now()).await {
            Ok(decision) if decision.allowed => {
                debug!(
                    key = %key,
                    remaining = decision.remaining,
                    "Request admitted"
                );
                Verdict::Allow(decision)
            }
            Ok(decision) => {
                warn!(
                    client = %key.client,
                    endpoint = %path,
                    policy = %class,
                    blocked = decision.blocked,
                    retry_after = decision.retry_after_secs(),
                    "Rate limit exceeded"
                );
                Verdict::Deny(decision)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    backend = self.limiter.name(),
                    endpoint = %path,
                    "Rate limit backend unavailable, allowing request"
                );
                Verdict::FailOpen
            }
        }
    }
}
