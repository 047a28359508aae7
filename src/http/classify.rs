//! Endpoint classification.
//!
//! Maps a method and path to at most one policy class. Rules are ordered
//! and the first match wins; paths matching no rule are exempt.

use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::ratelimit::PolicyClass;

/// Path layout the classifier matches against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Exact path of the login endpoint
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Prefix of the auth namespace
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,

    /// Prefix of the API namespace
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Path fragments that mark sensitive resources
    #[serde(default = "default_sensitive_segments")]
    pub sensitive_segments: Vec<String>,

    /// Paths that are never limited
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            auth_prefix: default_auth_prefix(),
            api_prefix: default_api_prefix(),
            sensitive_segments: default_sensitive_segments(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

fn default_login_path() -> String {
    "/api/auth/token".to_string()
}

fn default_auth_prefix() -> String {
    "/api/auth/".to_string()
}

fn default_api_prefix() -> String {
    "/api/".to_string()
}

fn default_sensitive_segments() -> Vec<String> {
    ["/admin/", "/users/", "/invitations/"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_exempt_paths() -> Vec<String> {
    ["/health", "/", "/docs", "/openapi.json"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Assigns requests to policy classes.
#[derive(Debug, Clone, Default)]
pub struct EndpointClassifier {
    routes: RouteConfig,
}

impl EndpointClassifier {
    /// Create a classifier over the given route layout.
    pub fn new(routes: RouteConfig) -> Self {
        Self { routes }
    }

    /// Classify a request. `None` means the request is exempt.
    pub fn classify(&self, method: &Method, path: &str) -> Option<PolicyClass> {
        let routes = &self.routes;

        if routes.exempt_paths.iter().any(|p| p == path) {
            return None;
        }

        if path == routes.login_path {
            Some(PolicyClass::AuthLogin)
        } else if path.starts_with(&routes.auth_prefix) {
            Some(PolicyClass::AuthGeneral)
        } else if path.contains("password") && path.contains("reset") {
            Some(PolicyClass::PasswordReset)
        } else if *method == Method::POST && (path.contains("upload") || path.contains("file")) {
            Some(PolicyClass::Upload)
        } else if routes
            .sensitive_segments
            .iter()
            .any(|segment| path.contains(segment.as_str()))
        {
            Some(PolicyClass::ApiStrict)
        } else if path.starts_with(&routes.api_prefix) {
            Some(PolicyClass::ApiGeneral)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(method: Method, path: &str) -> Option<PolicyClass> {
        EndpointClassifier::default().classify(&method, path)
    }

    #[test]
    fn test_login_path() {
        assert_eq!(classify(Method::POST, "/api/auth/token"), Some(PolicyClass::AuthLogin));
    }

    #[test]
    fn test_auth_namespace() {
        assert_eq!(classify(Method::GET, "/api/auth/me"), Some(PolicyClass::AuthGeneral));
        // The auth rule wins over password reset
        assert_eq!(
            classify(Method::POST, "/api/auth/password/reset"),
            Some(PolicyClass::AuthGeneral)
        );
    }

    #[test]
    fn test_password_reset() {
        assert_eq!(
            classify(Method::POST, "/api/users/password-reset"),
            Some(PolicyClass::PasswordReset)
        );
        assert_eq!(classify(Method::GET, "/reset/password"), Some(PolicyClass::PasswordReset));
    }

    #[test]
    fn test_upload_requires_post() {
        assert_eq!(classify(Method::POST, "/api/students/upload"), Some(PolicyClass::Upload));
        assert_eq!(classify(Method::POST, "/api/files"), Some(PolicyClass::Upload));
        assert_eq!(classify(Method::GET, "/api/files"), Some(PolicyClass::ApiGeneral));
    }

    #[test]
    fn test_sensitive_segments() {
        assert_eq!(classify(Method::GET, "/api/admin/settings"), Some(PolicyClass::ApiStrict));
        assert_eq!(classify(Method::DELETE, "/api/users/42"), Some(PolicyClass::ApiStrict));
        assert_eq!(classify(Method::GET, "/api/invitations/abc"), Some(PolicyClass::ApiStrict));
        assert_eq!(classify(Method::POST, "/api/users/upload"), Some(PolicyClass::Upload));
    }

    #[test]
    fn test_general_api() {
        assert_eq!(classify(Method::GET, "/api/students"), Some(PolicyClass::ApiGeneral));
    }

    #[test]
    fn test_exempt_paths() {
        assert_eq!(classify(Method::GET, "/health"), None);
        assert_eq!(classify(Method::GET, "/"), None);
        assert_eq!(classify(Method::GET, "/docs"), None);
        assert_eq!(classify(Method::GET, "/openapi.json"), None);
        assert_eq!(classify(Method::GET, "/static/app.js"), None);
    }

    #[test]
    fn test_custom_routes() {
        let classifier = EndpointClassifier::new(RouteConfig {
            login_path: "/v2/login".to_string(),
            auth_prefix: "/v2/session/".to_string(),
            api_prefix: "/v2/".to_string(),
            sensitive_segments: vec!["/billing/".to_string()],
            exempt_paths: vec!["/v2/ping".to_string()],
        });

        assert_eq!(classifier.classify(&Method::POST, "/v2/login"), Some(PolicyClass::AuthLogin));
        assert_eq!(classifier.classify(&Method::GET, "/v2/billing/x"), Some(PolicyClass::ApiStrict));
        assert_eq!(classifier.classify(&Method::GET, "/v2/ping"), None);
        assert_eq!(classifier.classify(&Method::GET, "/api/students"), None);
    }
}
