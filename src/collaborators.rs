//! Optional collaborator traits for concerns the core deliberately does not
//! own: TLS certificate provisioning and externally reachable URL discovery.
//! Default implementations are no-ops so the daemon runs standalone without
//! them; a deployment that needs either wires in its own implementation.

use async_trait::async_trait;

#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Returns the PEM-encoded (certificate chain, private key) pair to
    /// terminate TLS with, or `None` if this provider has nothing to offer
    /// (plaintext HTTP is used in that case).
    async fn certificate(&self) -> Option<(Vec<u8>, Vec<u8>)>;
}

pub struct NoCertificateProvider;

#[async_trait]
impl CertificateProvider for NoCertificateProvider {
    async fn certificate(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        None
    }
}

#[async_trait]
pub trait ExternalUrlProvider: Send + Sync {
    /// Returns the externally reachable base URL for this daemon, if one is
    /// known (e.g. from a tunnel or reverse-proxy registration). Used only
    /// for informational display; routing never depends on it.
    async fn external_url(&self) -> Option<String>;
}

pub struct NoExternalUrlProvider;

#[async_trait]
impl ExternalUrlProvider for NoExternalUrlProvider {
    async fn external_url(&self) -> Option<String> {
        None
    }
}
