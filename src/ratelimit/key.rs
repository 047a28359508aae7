//! Client key generation.

use std::fmt;

use super::policy::PolicyClass;

/// A key that uniquely identifies one client within one policy class.
///
/// Counts for the same client under different classes never interact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// The policy class the request was classified into
    pub class: PolicyClass,
    /// Resolved client identity (usually an IP address)
    pub client: String,
}

impl ClientKey {
    /// Create a new client key.
    pub fn new(class: PolicyClass, client: impl Into<String>) -> Self {
        Self {
            class,
            client: client.into(),
        }
    }

    /// Convert the key to its storage form, `"{class}:{client}"`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.class, self.client)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_key_to_string() {
        let key = ClientKey::new(PolicyClass::AuthLogin, "10.0.0.1");
        assert_eq!(key.to_string_key(), "auth_login:10.0.0.1");
        assert_eq!(key.to_string(), key.to_string_key());
    }

    #[test]
    fn test_client_key_equality() {
        let key1 = ClientKey::new(PolicyClass::ApiGeneral, "10.0.0.1");
        let key2 = ClientKey::new(PolicyClass::ApiGeneral, "10.0.0.1");
        let key3 = ClientKey::new(PolicyClass::ApiStrict, "10.0.0.1");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }
}
