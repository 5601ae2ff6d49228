//! Identity provider: maps bearer tokens to trusted [`UserIdentity`] claims.
//!
//! The server never issues tokens itself. A deployment configures the
//! provider; the bundled [`StaticIdentityProvider`] reads a fixed user table
//! from the `[[users]]` section of the config file.

use std::collections::HashMap;

use rundown_proto::auth::{Role, UserIdentity};

/// Errors that can occur during authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token was empty.
    #[error("missing token")]
    MissingToken,
    /// The token is not known to the provider.
    #[error("invalid token")]
    InvalidToken,
}

/// Resolves a bearer token to an identity with a role claim.
pub trait IdentityProvider: Send + Sync {
    /// Authenticates `token`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the token is missing or unknown.
    fn authenticate(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// A configured user entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct UserEntry {
    /// Provider-issued user id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Role claim.
    pub role: Role,
    /// Bearer token presented by the client.
    pub token: String,
}

/// Identity provider backed by an in-memory token table.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    by_token: HashMap<String, UserIdentity>,
}

impl StaticIdentityProvider {
    /// Creates a provider with no users.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a provider from configured entries. Later entries win on
    /// duplicate tokens.
    #[must_use]
    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let mut provider = Self::new();
        for entry in entries {
            provider.insert(
                entry.token.clone(),
                UserIdentity::new(entry.id.clone(), entry.name.clone(), entry.role),
            );
        }
        provider
    }

    /// Registers `identity` under `token`.
    pub fn insert(&mut self, token: impl Into<String>, identity: UserIdentity) {
        self.by_token.insert(token.into(), identity);
    }

    /// Builder-style variant of [`Self::insert`].
    #[must_use]
    pub fn with_user(mut self, token: impl Into<String>, identity: UserIdentity) -> Self {
        self.insert(token, identity);
        self
    }

    /// Number of configured tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Whether no users are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn authenticate(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.by_token
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}
