//! Identity verification seam.
//!
//! Token validation is an external collaborator: the server calls
//! [`TokenVerifier::verify`] exactly once per upgrade request and treats
//! the returned [`Identity`] as opaque from then on. Real deployments
//! plug in their own verifier; [`StaticTokenVerifier`] covers local
//! development and tests.

use std::collections::HashSet;

use async_trait::async_trait;

use parley_core::ids::Identity;

/// Identity verification failure. Always terminal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token was missing or empty.
    #[error("missing token")]
    Missing,
    /// The token was present but rejected.
    #[error("token rejected")]
    Rejected,
}

/// Verifies an upgrade-request token and produces the principal.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a token, returning the authenticated identity.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Development verifier: any non-empty token is its own identity,
/// optionally restricted to an allow-list.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    allowed: Option<HashSet<String>>,
}

impl StaticTokenVerifier {
    /// Accept every non-empty token.
    #[must_use]
    pub fn accept_any() -> Self {
        Self { allowed: None }
    }

    /// Accept only the listed tokens.
    #[must_use]
    pub fn allow_list(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: Some(tokens.into_iter().collect()),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(token) {
                return Err(AuthError::Rejected);
            }
        }
        Ok(Identity::from(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_any_maps_token_to_identity() {
        let verifier = StaticTokenVerifier::accept_any();
        let identity = verifier.verify("alice-token").await.unwrap();
        assert_eq!(identity.as_str(), "alice-token");
    }

    #[tokio::test]
    async fn empty_token_is_missing() {
        let verifier = StaticTokenVerifier::accept_any();
        assert!(matches!(
            verifier.verify("").await.unwrap_err(),
            AuthError::Missing
        ));
    }

    #[tokio::test]
    async fn allow_list_rejects_unknown() {
        let verifier = StaticTokenVerifier::allow_list(["good".to_string()]);
        assert!(verifier.verify("good").await.is_ok());
        assert!(matches!(
            verifier.verify("bad").await.unwrap_err(),
            AuthError::Rejected
        ));
    }

    #[tokio::test]
    async fn default_accepts_any() {
        let verifier = StaticTokenVerifier::default();
        assert!(verifier.verify("anything").await.is_ok());
    }
}
