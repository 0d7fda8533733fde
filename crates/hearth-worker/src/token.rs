//! Authorisation tokens handed to the worker by its environment.
//!
//! The worker only polls a [`TokenManager`]; refreshing, if any, happens on
//! the manager's own schedule. Managers are built through an explicit
//! [`TokenManagerRegistry`] rather than global state, so tests can run
//! several workers with different setups side by side.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors raised while building a token manager.
#[derive(Error, Debug)]
pub enum TokenError {
    /// The factory for this token type failed.
    #[error("failed to create {ty} token manager: {reason}")]
    Factory {
        /// Token type the factory was registered for.
        ty: String,
        /// What went wrong.
        reason: String,
    },
}

/// A typed token, such as a ticket for an authorisation service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token type. Empty when no token is configured.
    #[serde(default)]
    pub ty: String,
    /// Token body.
    #[serde(default)]
    pub body: String,
}

impl Token {
    /// Creates a token.
    pub fn new(ty: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            body: body.into(),
        }
    }

    /// Checks whether no token is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ty.is_empty() && self.body.is_empty()
    }
}

/// Source of the current token.
pub trait TokenManager: Send + Sync {
    /// Most recently seen token.
    fn token(&self) -> Token;

    /// Stops any background refresh. Called once when the worker shuts down.
    fn stop(&self);
}

/// Manager for deployments without tokens. Always returns the empty token.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTokenManager;

impl TokenManager for NullTokenManager {
    fn token(&self) -> Token {
        Token::default()
    }

    fn stop(&self) {}
}

/// Manager that hands out the token it was created with.
#[derive(Debug, Clone)]
pub struct StaticTokenManager {
    token: Token,
}

impl StaticTokenManager {
    /// Wraps a fixed token.
    #[must_use]
    pub const fn new(token: Token) -> Self {
        Self { token }
    }
}

impl TokenManager for StaticTokenManager {
    fn token(&self) -> Token {
        self.token.clone()
    }

    fn stop(&self) {}
}

type Factory = Box<dyn Fn(&str, Token) -> Result<Box<dyn TokenManager>, TokenError> + Send + Sync>;

/// Maps token types to manager factories.
///
/// Types without a factory get a [`NullTokenManager`].
#[derive(Default)]
pub struct TokenManagerRegistry {
    factories: HashMap<String, Factory>,
}

impl TokenManagerRegistry {
    /// Creates a registry with no factories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `ty`. The factory gets the application name
    /// and the configured token.
    #[must_use]
    pub fn register<F>(mut self, ty: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str, Token) -> Result<Box<dyn TokenManager>, TokenError> + Send + Sync + 'static,
    {
        self.factories.insert(ty.into(), Box::new(factory));
        self
    }

    /// Builds the manager for `token`.
    pub fn create(&self, app: &str, token: Token) -> Result<Box<dyn TokenManager>, TokenError> {
        match self.factories.get(&token.ty) {
            Some(factory) => {
                debug!(app, ty = %token.ty, "creating token manager");
                factory(app, token)
            }
            None => Ok(Box::new(NullTokenManager)),
        }
    }

    /// Token types with a registered factory, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for TokenManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManagerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
