//! The intercepting proxy: frontend, dispatcher, classifier, and TLS cache.
//!
//! This module provides an interactive MITM proxy with:
//! - HTTP CONNECT handling for tunneled traffic
//! - Protocol sniffing on the first tunneled bytes (HTTP / TLS / opaque)
//! - Dynamic per-host certificate contexts, LRU-bounded
//! - A decrypt policy selecting which targets are intercepted
//! - Opaque relay for everything the proxy cannot or should not decrypt
//!
//! # Architecture
//!
//! ```text
//! client ──CONNECT──▶ server ──▶ tunnel dispatcher
//!                                   │ sniff first chunk
//!                     ┌─────────────┼──────────────┐
//!                     ▼             ▼              ▼
//!                HTTP route    TLS decrypt      relay
//!               (clear fwd)  (terminate+redo) (byte copy)
//!                     └─────────────┴──────────────┘
//!                                   ▼
//!                                origin
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lensproxy::proxy::{ContextCache, DecryptPolicy, ProxyConfig, ProxyServer};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(ContextCache::new(128));
//! let policy = Arc::new(DecryptPolicy::exclude(["*.internal".to_string()]));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::bind(&ProxyConfig::default(), policy, cache, shutdown_rx).await?;
//! server.run().await?;
//! ```

pub mod error;
pub mod policy;
mod rewind;
pub mod server;
pub mod sniff;
pub mod tls;
pub mod tunnel;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use policy::{DecryptPolicy, FilterMode};
pub use server::{ProxyConfig, ProxyServer};
pub use sniff::{classify, Classification, HttpVersion, TlsVersion};
pub use tls::{create_tls_connector, ContextCache};
pub use tunnel::{
    parse_target, run_tunnel, Connector, DecryptRoutes, DirectConnector, TunnelDeps, TunnelRoutes,
    TunnelTarget, ESTABLISHED_RESPONSE,
};
