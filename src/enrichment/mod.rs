//! Metadata provider enrichment: credentials, throttling, rate-limit breaker,
//! retries and the response cache.

pub mod credentials;
pub mod detail;
pub mod rate_limit;
pub mod response_cache;
#[cfg(test)]
pub(crate) mod testing;
pub mod tmdb_client;
pub mod transport;

use thiserror::Error;

pub use credentials::{Credential, CredentialResolver, KeyringTokenStore, NoTokenStore, TokenStore};
pub use detail::ProviderDetail;
pub use tmdb_client::{DetailFetch, EnrichmentClient, FetchOptions};
pub use transport::{AbortSignal, HttpTransport, UreqTransport};

/// Why an enrichment lookup produced no payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrichmentError {
    /// No usable credential, enrichment switched off, or the credential was rejected.
    #[error("enrichment disabled: {0}")]
    Disabled(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned HTTP {status}")]
    Http { status: u16 },
    #[error("no matching provider record")]
    NotFound,
    #[error("invalid provider payload: {0}")]
    Parse(String),
    #[error("provider rate limit active, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: i64 },
    #[error("enrichment aborted")]
    Aborted,
}

impl EnrichmentError {
    /// Errors that say nothing about the item itself.
    pub fn is_item_neutral(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Disabled(_) | Self::RateLimited { .. }
        )
    }

    /// Errors that end a lookup chain early.
    pub fn stops_lookup_chain(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Aborted | Self::Disabled(_)
        )
    }
}
