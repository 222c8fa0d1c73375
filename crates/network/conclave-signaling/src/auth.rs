//! Token validation seam
//!
//! Tokens are consumed, never minted: the relay hands the opaque credential
//! to a validator and gets back the user id it vouches for.

use async_trait::async_trait;
use conclave_core::types::UserId;

/// Validates bearer credentials presented on `Join`.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// The user id the token authenticates, or `None` for an invalid token
    async fn validate(&self, token: &str) -> Option<UserId>;
}

/// Reference validator accepting `user-<userId>` bearer strings.
///
/// A deployment substitutes a validator backed by a real token service.
#[derive(Debug, Default, Clone)]
pub struct BearerTokenValidator;

#[async_trait]
impl TokenValidator for BearerTokenValidator {
    async fn validate(&self, token: &str) -> Option<UserId> {
        let user_id = token.strip_prefix("user-")?;
        if user_id.is_empty() {
            return None;
        }
        Some(user_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_user_prefixed_tokens() {
        let validator = BearerTokenValidator;
        assert_eq!(validator.validate("user-u2").await.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn rejects_malformed_tokens() {
        let validator = BearerTokenValidator;
        assert_eq!(validator.validate("bogus").await, None);
        assert_eq!(validator.validate("user-").await, None);
    }
}
