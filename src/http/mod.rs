//! HTTP enforcement layer.

pub mod classify;
pub mod enforce;
pub mod identity;
pub mod middleware;
mod server;

pub use classify::{EndpointClassifier, RouteConfig};
pub use enforce::{DenialMessages, Enforcer, Verdict};
pub use identity::resolve_client;
pub use middleware::{DenialBody, RateLimitLayer, RateLimitService};
pub use server::{router, HttpServer};
