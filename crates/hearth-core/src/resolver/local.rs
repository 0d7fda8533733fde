//! In-memory resolver backed by a fixed map.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{ResolveError, Resolver, Result};
use crate::transport::Endpoint;

/// Resolver that answers from a map filled in by the caller.
///
/// Entries live in memory only.
#[derive(Debug, Default)]
pub struct StaticResolver {
    services: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl StaticResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(self, name: &str, endpoints: Vec<Endpoint>) -> Self {
        self.register(name, endpoints);
        self
    }

    /// Sets the endpoints for `name`, replacing any previous entry.
    pub fn register(&self, name: &str, endpoints: Vec<Endpoint>) {
        info!(service = %name, endpoints = endpoints.len(), "service registered");
        self.services.write().insert(name.to_owned(), endpoints);
    }

    /// Forgets `name`. Unknown names are ignored.
    pub fn deregister(&self, name: &str) {
        if self.services.write().remove(name).is_some() {
            info!(service = %name, "service deregistered");
        } else {
            debug!(service = %name, "service not found for deregistration");
        }
    }

    /// Names of all registered services, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    /// Returns true if no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl FromIterator<(String, Vec<Endpoint>)> for StaticResolver {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Endpoint>)>>(iter: I) -> Self {
        Self {
            services: RwLock::new(iter.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<Endpoint>> {
        let endpoints = self
            .services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(name.to_owned()))?;
        if endpoints.is_empty() {
            return Err(ResolveError::NoEndpoints(name.to_owned()));
        }
        Ok(endpoints)
    }
}
