//! TLS termination for hosts that need path visibility.
//!
//! This module provides:
//! - Certificate caching to avoid regeneration overhead
//! - Dynamic certificate resolution using SNI
//! - TLS acceptor for client connections (proxy as server)
//! - TLS connector for upstream connections (proxy as client)
//!
//! # ALPN
//!
//! The acceptor only offers HTTP/1.1. Terminated connections are served by
//! hyper's HTTP/1 server so each request line can be checked against the
//! URL patterns; an H2 client would otherwise fail after the handshake.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::proxy::tls::{CertificateCache, create_tls_acceptor, create_tls_connector};
//! use egress_warden::sandbox::SessionCa;
//! use std::sync::Arc;
//!
//! let ca = Arc::new(SessionCa::load(&workspace.join("ca"))?);
//! let cache = Arc::new(CertificateCache::new(ca));
//!
//! let acceptor = create_tls_acceptor(cache.clone(), Some("api.github.com".into()))?;
//! let connector = create_tls_connector()?;
//! ```

use super::error::ProxyError;
use crate::sandbox::SessionCa;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace};

/// Leaf certificates issued by the session CA, by lowercase host name.
pub struct CertificateCache {
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    ca: Arc<SessionCa>,
}

impl CertificateCache {
    /// Create a new certificate cache with the given CA.
    pub fn new(ca: Arc<SessionCa>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
        }
    }

    /// Get or generate a certificate for the given domain.
    pub fn get_or_generate(&self, domain: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        let domain_lower = domain.to_lowercase();

        {
            let cache = self.cache.read().unwrap();
            if let Some(key) = cache.get(&domain_lower) {
                trace!("Certificate cache hit for {}", domain);
                return Ok(key.clone());
            }
        }

        debug!("Issuing leaf certificate for {}", domain_lower);

        let domain_cert = self.ca.generate_cert(&domain_lower)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut domain_cert.cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("No certificates found in PEM".into()));
        }

        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut domain_cert.key_pem.as_bytes())
                .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
                .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

        let certified_key = Arc::new(CertifiedKey::new(cert_chain, signing_key));

        // Two tasks racing on the same host both issue; the last insert wins
        // and both keys are valid.
        self.cache
            .write()
            .unwrap()
            .insert(domain_lower, certified_key.clone());

        Ok(certified_key)
    }

    /// Get the number of cached certificates.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }
}

/// Certificate resolver that issues certificates on demand.
///
/// The name comes from the ClientHello SNI, falling back to the host the
/// connection was admitted for.
pub struct DynamicCertResolver {
    cache: Arc<CertificateCache>,
    domain_hint: Option<String>,
}

impl DynamicCertResolver {
    /// Resolver driven by SNI only.
    pub fn new(cache: Arc<CertificateCache>) -> Self {
        Self {
            cache,
            domain_hint: None,
        }
    }

    /// Resolver with a fallback name for SNI-less clients.
    pub fn with_domain_hint(cache: Arc<CertificateCache>, domain: String) -> Self {
        Self {
            cache,
            domain_hint: Some(domain),
        }
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello
            .server_name()
            .map(|s| s.to_string())
            .or_else(|| self.domain_hint.clone())?;

        trace!("Resolving certificate for: {}", domain);

        match self.cache.get_or_generate(&domain) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to generate certificate for {}: {}", domain, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("domain_hint", &self.domain_hint)
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

/// Create a TLS acceptor presenting session CA leaf certificates.
///
/// Only `http/1.1` is offered via ALPN.
pub fn create_tls_acceptor(
    cert_cache: Arc<CertificateCache>,
    domain_hint: Option<String>,
) -> Result<TlsAcceptor, ProxyError> {
    let resolver: Arc<dyn ResolvesServerCert> = match domain_hint {
        Some(domain) => Arc::new(DynamicCertResolver::with_domain_hint(cert_cache, domain)),
        None => Arc::new(DynamicCertResolver::new(cert_cache)),
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create a TLS connector for upstream connections.
///
/// Upstream certificates are verified against the system roots. Inside the
/// proxy container these come from `SSL_CERT_FILE`, which points at the
/// host bundle mounted by the orchestrator.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> (TempDir, CertificateCache) {
        let root = TempDir::new().unwrap();
        let ca = Arc::new(SessionCa::generate(&root.path().join("ca")).unwrap());
        (root, CertificateCache::new(ca))
    }

    #[test]
    fn test_certificate_generation_and_caching() {
        let (_root, cache) = cache();
        assert!(cache.is_empty());

        let key1 = cache.get_or_generate("api.github.com").unwrap();
        let key2 = cache.get_or_generate("API.GitHub.com").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&key1, &key2));

        cache.get_or_generate("pypi.org").unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_tls_acceptor_creation() {
        let (_root, cache) = cache();
        let acceptor = create_tls_acceptor(Arc::new(cache), Some("api.github.com".into()));
        assert!(acceptor.is_ok());
    }

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("").is_err());
    }
}
