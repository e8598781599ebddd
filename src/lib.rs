//! lensproxy: interactive TLS-intercepting proxy
//!
//! This crate implements a forward proxy that accepts HTTP CONNECT tunnels,
//! classifies the first bytes the client sends, and, for TLS traffic the
//! decrypt policy selects, terminates the session with a certificate minted
//! on the fly for the destination host, signed by a locally generated root.
//! Traffic it cannot or should not decrypt is relayed byte-for-byte.
//!
//! # Architecture
//!
//! - **ca**: root authority and per-host leaf certificate synthesis
//! - **proxy::sniff**: pure protocol classifier (HTTP / TLS ClientHello / opaque)
//! - **proxy::tls**: LRU-bounded cache of per-host rustls server contexts
//! - **proxy::policy**: include/exclude host patterns selecting decrypt targets
//! - **proxy::tunnel**: CONNECT dispatcher driving each tunnel to one route
//! - **proxy::server**: the TCP frontend
//! - **config** / **cli**: TOML configuration with CLI overrides

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod proxy;
