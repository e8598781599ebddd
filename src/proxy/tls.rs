//! TLS contexts for interception.
//!
//! This module provides:
//! - A bounded, LRU-evicting cache of per-host server contexts, each built
//!   around a leaf certificate minted by the local root
//! - A TLS connector for upstream connections (proxy as client)
//!
//! # Critical ALPN Note
//!
//! Client-facing contexts **must** force HTTP/1.1 via ALPN. If we allow
//! HTTP/2 negotiation, modern clients (curl, browsers, SDKs) will upgrade to
//! H2 after the TLS handshake. Our simple bidirectional copy loop doesn't
//! understand H2 framing (multiplexed streams, binary protocol), causing
//! connection failures or data corruption.
//!
//! # Example
//!
//! ```ignore
//! use lensproxy::proxy::tls::ContextCache;
//!
//! let cache = ContextCache::new(128);
//! let server_config = cache.get("api.example.com")?;
//! let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
//! ```

use super::error::ProxyError;
use crate::ca::{CertAuthority, KeyProfile, DEFAULT_LEAF_VALIDITY_DAYS};
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Bounded cache of per-host TLS server contexts.
///
/// Key: lowercase hostname. Value: a ready-to-use `ServerConfig` presenting
/// a leaf for that host, chained to the cache's root. The root is generated
/// lazily on the first miss unless one was installed via [`set_root`].
///
/// Lookup and issuance happen under one lock with no await point, so
/// concurrent misses for the same host cannot mint two certificates.
/// Eviction is strict least-recently-used; it only prevents future reuse,
/// connections already holding the Arc are unaffected.
///
/// [`set_root`]: ContextCache::set_root
pub struct ContextCache {
    inner: Mutex<CacheState>,
    capacity: usize,
    leaf_validity_days: u32,
    key_profile: KeyProfile,
}

struct CacheState {
    root: Option<Arc<CertAuthority>>,
    contexts: HashMap<String, Arc<ServerConfig>>,
    /// Recency order, least recently used at the front.
    recency: VecDeque<String>,
}

impl ContextCache {
    /// Create a cache holding at most `capacity` contexts, with default
    /// issuance settings.
    pub fn new(capacity: usize) -> Self {
        Self::with_settings(capacity, DEFAULT_LEAF_VALIDITY_DAYS, KeyProfile::default())
    }

    /// Create a cache with explicit leaf validity and key profile.
    ///
    /// A zero capacity is treated as one.
    pub fn with_settings(capacity: usize, leaf_validity_days: u32, key_profile: KeyProfile) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                root: None,
                contexts: HashMap::new(),
                recency: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            leaf_validity_days,
            key_profile,
        }
    }

    /// Install an externally provisioned root.
    ///
    /// Clears all cached contexts: a hostname maps to exactly one context
    /// until it is evicted or the root changes.
    pub fn set_root(&self, root: CertAuthority) {
        let mut state = self.inner.lock().unwrap();
        state.root = Some(Arc::new(root));
        state.contexts.clear();
        state.recency.clear();
        debug!("Root installed, context cache cleared");
    }

    /// The root certificate as PEM, generating the root if none exists yet.
    ///
    /// Clients import this into their trust store to accept intercepted
    /// sessions.
    pub fn root_cert_pem(&self) -> Result<String, ProxyError> {
        let mut state = self.inner.lock().unwrap();
        let root = ensure_root(&mut state, self.key_profile)?;
        Ok(root.cert_pem().to_string())
    }

    /// Get or build the server context for a hostname.
    pub fn get(&self, hostname: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let key = hostname.to_lowercase();
        let mut state = self.inner.lock().unwrap();

        if let Some(context) = state.contexts.get(&key).cloned() {
            trace!("Context cache hit for {}", hostname);
            touch_lru(&mut state.recency, &key);
            return Ok(context);
        }

        debug!("Context cache miss for {}, issuing certificate", hostname);

        let root = ensure_root(&mut state, self.key_profile)?;
        let alt_names = [key.clone()];
        let leaf = root.issue(&key, self.leaf_validity_days, Some(&alt_names))?;
        let context = build_server_config(&leaf.cert_pem, &leaf.key_pem, root.cert_pem())?;

        if state.contexts.len() >= self.capacity {
            if let Some(oldest) = state.recency.pop_front() {
                state.contexts.remove(&oldest);
                debug!("Evicted context for {} (capacity {})", oldest, self.capacity);
            }
        }
        state.contexts.insert(key.clone(), context.clone());
        touch_lru(&mut state.recency, &key);

        Ok(context)
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().contexts.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().contexts.is_empty()
    }

    /// Maximum number of contexts held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn ensure_root(
    state: &mut CacheState,
    profile: KeyProfile,
) -> Result<Arc<CertAuthority>, ProxyError> {
    if let Some(root) = &state.root {
        return Ok(root.clone());
    }
    let root = Arc::new(CertAuthority::generate_with(profile)?);
    state.root = Some(root.clone());
    Ok(root)
}

/// Move `key` to the most-recently-used end of the deque.
fn touch_lru(recency: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = recency.iter().position(|k| k == key) {
        recency.remove(pos);
    }
    recency.push_back(key.to_string());
}

/// Build a rustls server config from a leaf PEM pair, chaining the root.
fn build_server_config(
    cert_pem: &str,
    key_pem: &str,
    root_pem: &str,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let mut chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

    if chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".into()));
    }

    chain.extend(
        rustls_pemfile::certs(&mut root_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse root PEM: {}", e)))?,
    );

    let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to build server config: {}", e)))?;

    // CRITICAL: Force HTTP/1.1 to prevent HTTP/2 negotiation.
    // Without this, clients that support H2 will upgrade after TLS handshake,
    // and our proxy's bidirectional copy won't understand H2 framing.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Create a TLS connector for upstream connections.
///
/// This is used to connect to origin servers. The proxy acts as a client,
/// verifying the upstream server's certificate against system root CAs.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    // Load system root certificates
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
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

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a hostname to a ServerName for an upstream TLS connection.
pub fn host_to_server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_starts_empty() {
        let cache = ContextCache::new(8);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 8);
    }

    #[test]
    fn test_hit_returns_same_context() {
        let cache = ContextCache::new(8);

        let first = cache.get("example.com").unwrap();
        assert_eq!(cache.len(), 1);

        let second = cache.get("example.com").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cache_key_is_case_insensitive() {
        let cache = ContextCache::new(8);
        let first = cache.get("example.com").unwrap();
        let second = cache.get("EXAMPLE.COM").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_lru_eviction_at_capacity_one() {
        let cache = ContextCache::new(1);

        let x1 = cache.get("x.com").unwrap();
        let _y = cache.get("y.com").unwrap();
        assert_eq!(cache.len(), 1);

        // x.com was evicted, so this is a fresh issuance.
        let x2 = cache.get("x.com").unwrap();
        assert!(!Arc::ptr_eq(&x1, &x2));
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = ContextCache::new(2);

        let a1 = cache.get("a.com").unwrap();
        let _b = cache.get("b.com").unwrap();

        // Touch a.com so b.com becomes the eviction candidate.
        let a2 = cache.get("a.com").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        let _c = cache.get("c.com").unwrap();
        assert_eq!(cache.len(), 2);

        // a.com must have survived.
        let a3 = cache.get("a.com").unwrap();
        assert!(Arc::ptr_eq(&a1, &a3));
    }

    #[test]
    fn test_set_root_clears_contexts() {
        let cache = ContextCache::new(8);
        cache.get("example.com").unwrap();
        assert_eq!(cache.len(), 1);

        cache.set_root(CertAuthority::generate().unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_root_pem_is_stable() {
        let cache = ContextCache::new(8);
        let first = cache.root_cert_pem().unwrap();
        cache.get("example.com").unwrap();
        let second = cache.root_cert_pem().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_host_to_server_name() {
        assert!(host_to_server_name("example.com").is_ok());
        assert!(host_to_server_name("127.0.0.1").is_ok());
        assert!(host_to_server_name("").is_err());
    }
}
