//! Name resolution for outbound services.
//!
//! A [`Resolver`] turns a logical service name into the endpoints it can be
//! reached on. The locator client plugs in here; [`StaticResolver`] covers
//! tests and fixed deployments.

mod local;

use async_trait::async_trait;
use thiserror::Error;

pub use local::StaticResolver;

use crate::transport::Endpoint;

/// Errors that can occur while resolving a service.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No service with this name is known.
    #[error("service not found: {0}")]
    NotFound(String),

    /// The service is known but lists no endpoints.
    #[error("service {0} has no endpoints")]
    NoEndpoints(String),

    /// The resolver backend failed.
    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Looks up where a named service listens.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Returns the endpoints for `name`, in preference order.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::NotFound`] if the name is unknown.
    async fn resolve(&self, name: &str) -> Result<Vec<Endpoint>>;
}
