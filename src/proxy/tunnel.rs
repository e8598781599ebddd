//! CONNECT tunnel dispatch.
//!
//! This module drives a tunnel from the accepted CONNECT request to its end:
//!
//! 1. Parse the `host[:port]` target (port defaults to 443)
//! 2. Connect upstream; on failure answer `502 Server Unreachable` and stop
//! 3. Answer `200 Connection Established`
//! 4. If the decrypt policy selects the target, sniff the first client chunk
//!    and route it: plaintext HTTP is forwarded as-is, a ClientHello
//!    negotiating HTTP/1.1 (or nothing) goes to TLS interception, and
//!    anything else is relayed opaquely
//! 5. Targets the policy skips are relayed without sniffing
//!
//! Whatever was sniffed is replayed to exactly one path, first, in order.
//! Both response lines are byte-exact on the wire; clients parse them with
//! their own HTTP stacks.
//!
//! Upstream connections and the post-sniff routes are collaborator traits so
//! tests can substitute fixed endpoints and canned TLS configurations.

use super::error::{ProxyError, ProxyResult};
use super::policy::DecryptPolicy;
use super::rewind::Rewind;
use super::sniff::{classify, Classification};
use super::tls::{create_tls_connector, host_to_server_name, ContextCache};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

/// Response line sent once the upstream socket is open. Byte-exact.
pub const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Size of the single sniff read taken after the 200 response.
const SNIFF_BUFFER_SIZE: usize = 16 * 1024;

/// A parsed CONNECT target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Destination hostname (or IP literal), lowercased.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

/// Parse a CONNECT authority of the form `host[:port]`.
///
/// Port defaults to 443. IPv6 literals in brackets are accepted.
pub fn parse_target(authority: &str) -> ProxyResult<TunnelTarget> {
    parse_authority(authority, 443)
}

/// Parse `host[:port]` with an explicit default port.
///
/// Examples:
/// - `api.example.com:8443` -> ("api.example.com", 8443)
/// - `api.example.com` -> ("api.example.com", default)
/// - `[::1]:443` -> ("::1", 443)
pub fn parse_authority(authority: &str, default_port: u16) -> ProxyResult<TunnelTarget> {
    if authority.is_empty() {
        return Err(ProxyError::InvalidRequest("empty authority".into()));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        // IPv6 literal without a port, like [::1] or a bare ::1
        if host.contains(':') && !host.starts_with('[') {
            return Ok(TunnelTarget {
                host: authority.to_lowercase(),
                port: default_port,
            });
        }

        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", port_str)))?;
            return Ok(TunnelTarget {
                host: host[1..host.len() - 1].to_lowercase(),
                port,
            });
        }

        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", port_str)))?;
        Ok(TunnelTarget {
            host: host.to_lowercase(),
            port,
        })
    } else {
        Ok(TunnelTarget {
            host: authority.to_lowercase(),
            port: default_port,
        })
    }
}

/// Write the byte-exact `502 Server Unreachable` response and close the
/// write side.
pub async fn write_unreachable<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 502 Server Unreachable\r\nContent-Length: {}\r\n\r\n{}",
        message.len(),
        message
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}

/// Opens the upstream socket for a tunnel.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream>;
}

/// Default connector: a plain TCP connection to the requested target.
pub struct DirectConnector;

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}

/// Destinations a sniffed tunnel can be handed to.
#[async_trait]
pub trait TunnelRoutes: Send + Sync {
    /// Handle a tunnel whose first bytes were a plaintext HTTP request.
    /// `prefix` holds the sniffed bytes and must reach the origin first.
    async fn route_http(
        &self,
        client: TcpStream,
        remote: TcpStream,
        prefix: Bytes,
    ) -> ProxyResult<()>;

    /// Handle a tunnel whose first bytes were a decryptable ClientHello.
    /// `prefix` holds the sniffed handshake bytes; the client-side TLS
    /// acceptor must see them before anything else from the socket.
    async fn route_tls(
        &self,
        client: TcpStream,
        remote: TcpStream,
        host: String,
        prefix: Bytes,
    ) -> ProxyResult<()>;
}

/// Everything a tunnel needs besides its sockets.
#[derive(Clone)]
pub struct TunnelDeps {
    /// Opens upstream connections.
    pub connector: Arc<dyn Connector>,
    /// Selects targets for interception.
    pub policy: Arc<DecryptPolicy>,
    /// Post-sniff destinations.
    pub routes: Arc<dyn TunnelRoutes>,
}

/// Drive one CONNECT tunnel to completion.
///
/// `head` carries any bytes the client sent after the request head in the
/// same packets; they are treated as the sniffed prefix when present.
pub async fn run_tunnel(
    mut client: TcpStream,
    target: TunnelTarget,
    head: Bytes,
    deps: &TunnelDeps,
) -> ProxyResult<()> {
    let remote = match deps.connector.connect(&target.host, target.port).await {
        Ok(stream) => stream,
        Err(e) => {
            let addr = format!("{}:{}", target.host, target.port);
            debug!("Upstream connect to {} failed: {}", addr, e);
            write_unreachable(&mut client, &e.to_string()).await?;
            return Err(ProxyError::UpstreamConnect {
                addr,
                message: e.to_string(),
            });
        }
    };

    client.write_all(ESTABLISHED_RESPONSE).await?;

    if !deps.policy.should_decrypt(&target.host, target.port) {
        trace!("Policy skips {}:{}, relaying", target.host, target.port);
        return relay(client, remote, head).await;
    }

    // One read decides the route. Bytes that rode in with the CONNECT head
    // stand in for it.
    let prefix = if head.is_empty() {
        let mut buf = vec![0u8; SNIFF_BUFFER_SIZE];
        let n = client.read(&mut buf).await?;
        if n == 0 {
            debug!("Client closed before sending data to {}", target.host);
            return Ok(());
        }
        buf.truncate(n);
        Bytes::from(buf)
    } else {
        head
    };

    match classify(&prefix) {
        Classification::Http { method, version } => {
            debug!(
                "Tunnel to {}:{} carries HTTP/{} {}, forwarding in the clear",
                target.host, target.port, version, method
            );
            deps.routes.route_http(client, remote, prefix).await
        }
        Classification::Tls { version, ref alpn } if decryptable_alpn(alpn) => {
            debug!(
                "Tunnel to {}:{} carries {} (alpn {:?}), intercepting",
                target.host, target.port, version, alpn
            );
            deps.routes
                .route_tls(client, remote, target.host.clone(), prefix)
                .await
        }
        other => {
            debug!(
                "Tunnel to {}:{} carries {:?}, relaying",
                target.host, target.port, other
            );
            relay(client, remote, prefix).await
        }
    }
}

/// A ClientHello is decryptable when it offers `http/1.1` or no ALPN at all.
/// Anything committed to another protocol (h2-only, custom) is relayed.
fn decryptable_alpn(alpn: &[String]) -> bool {
    alpn.is_empty() || alpn.iter().any(|p| p == "http/1.1")
}

/// Replay `prefix` to the remote, then splice bytes both ways until either
/// side closes or errors. An error on one side tears down both.
pub async fn relay(mut client: TcpStream, mut remote: TcpStream, prefix: Bytes) -> ProxyResult<()> {
    if !prefix.is_empty() {
        remote.write_all(&prefix).await?;
    }

    match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
        Ok((to_remote, to_client)) => {
            debug!(
                "Relay closed ({} bytes up, {} bytes down)",
                to_remote, to_client
            );
        }
        Err(e) => {
            // Resets at teardown are routine, not failures.
            debug!("Relay ended: {}", e);
        }
    }
    Ok(())
}

/// Splice two already-established streams until one side finishes.
async fn splice<A, B>(client: A, upstream: B) -> ProxyResult<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async { tokio::io::copy(&mut client_read, &mut upstream_write).await };
    let upstream_to_client = async { tokio::io::copy(&mut upstream_read, &mut client_write).await };

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("Client->upstream copy ended: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("Upstream->client copy ended: {}", e);
            }
        }
    }

    Ok(())
}

/// Default routes: terminate client TLS with a minted certificate and open
/// real TLS to the origin over the already-connected socket.
pub struct DecryptRoutes {
    cache: Arc<ContextCache>,
    upstream: TlsConnector,
}

impl DecryptRoutes {
    /// Build routes that verify origins against the system trust store.
    pub fn new(cache: Arc<ContextCache>) -> ProxyResult<Self> {
        let upstream = create_tls_connector()?;
        Ok(Self { cache, upstream })
    }

    /// Build routes with an explicit upstream client configuration.
    ///
    /// Used by tests that stand up their own origin with a private root.
    pub fn with_upstream_config(cache: Arc<ContextCache>, config: Arc<ClientConfig>) -> Self {
        Self {
            cache,
            upstream: TlsConnector::from(config),
        }
    }
}

#[async_trait]
impl TunnelRoutes for DecryptRoutes {
    async fn route_http(
        &self,
        client: TcpStream,
        remote: TcpStream,
        prefix: Bytes,
    ) -> ProxyResult<()> {
        // HTTP inside a tunnel is forwarded transparently; no
        // re-serialization, no tampering.
        relay(client, remote, prefix).await
    }

    async fn route_tls(
        &self,
        client: TcpStream,
        remote: TcpStream,
        host: String,
        prefix: Bytes,
    ) -> ProxyResult<()> {
        // Upstream handshake first: fail before presenting our certificate
        // if the origin is not actually speaking TLS.
        let server_name = host_to_server_name(&host)?;
        let upstream_tls = self
            .upstream
            .connect(server_name, remote)
            .await
            .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;

        debug!("TLS established with upstream {}", host);

        let context = self.cache.get(&host)?;
        let acceptor = TlsAcceptor::from(context);

        // The sniffed ClientHello is replayed into the acceptor.
        let client_tls = acceptor
            .accept(Rewind::new(client, prefix))
            .await
            .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

        debug!("TLS established with client for {}", host);

        splice(client_tls, upstream_tls).await
    }
}
