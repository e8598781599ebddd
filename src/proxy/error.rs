//! Error types for proxy operations.
//!
//! This module defines structured error types for the intercepting proxy:
//! - Server errors (binding, accept)
//! - TLS errors (certificate issuance, handshake)
//! - Connection errors (request parsing, upstream connect)

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported proxy request.
    #[error("Invalid proxy request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or context construction.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate issuance failed.
    #[error("Certificate issuance failed: {0}")]
    Cert(#[from] crate::ca::CaError),

    /// Failed to connect to the upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
