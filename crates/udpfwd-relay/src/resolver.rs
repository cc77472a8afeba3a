//! Backend name resolution

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("DNS resolution failed for {service}: {source}")]
    Lookup {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No IP address found for {service}")]
    NoAddress { service: String },
}

/// Resolves a backend service name to a single address
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, service: &str) -> Result<IpAddr, ResolveError>;
}

/// Resolver backed by the host's resolver (`getaddrinfo`)
///
/// Returns the first address of the answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, service: &str) -> Result<IpAddr, ResolveError> {
        let mut addrs = tokio::net::lookup_host((service, 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                service: service.to_string(),
                source,
            })?;

        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| ResolveError::NoAddress {
                service: service.to_string(),
            })
    }
}
