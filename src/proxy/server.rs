//! Proxy frontend.
//!
//! A single TCP listener accepts proxy clients and reads one request head
//! per connection:
//!
//! - `CONNECT host:port` requests become tunnels handled by the dispatcher,
//!   with any bytes that followed the head carried along as the sniff prefix
//! - absolute-URI requests (`GET http://host/...`) take the plain path: the
//!   origin is dialed directly (default port 80) and the buffered request is
//!   forwarded through the HTTP route
//!
//! Response lines the proxy itself emits are written raw, because the
//! `Connection Established` and `Server Unreachable` replies are byte-exact
//! contracts with proxy clients.
//!
//! Shutdown is a `watch` flag: flipping it stops the accept loop while
//! connections already in flight drain on their own tasks.
//!
//! # Example
//!
//! ```ignore
//! use lensproxy::proxy::{ProxyConfig, ProxyServer};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::bind(&config, policy, cache, shutdown_rx).await?;
//! println!("listening on {}", server.local_addr()?);
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::error::{ProxyError, ProxyResult};
use super::policy::DecryptPolicy;
use super::tls::ContextCache;
use super::tunnel::{
    parse_authority, parse_target, run_tunnel, write_unreachable, Connector, DecryptRoutes,
    DirectConnector, TunnelDeps, TunnelRoutes,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on a buffered request head.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Listener configuration for the proxy frontend.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen_host: String,
    /// Port to listen on; 0 asks the OS for a free port.
    pub listen_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

/// The proxy frontend: listener plus the shared pieces every tunnel needs.
pub struct ProxyServer {
    listener: TcpListener,
    deps: TunnelDeps,
    cache: Arc<ContextCache>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener and wire up default collaborators.
    ///
    /// The default routes intercept with `cache` and verify origins against
    /// the system trust store; the default connector dials targets directly.
    pub async fn bind(
        config: &ProxyConfig,
        policy: Arc<DecryptPolicy>,
        cache: Arc<ContextCache>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        let listener =
            TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
        let routes = Arc::new(DecryptRoutes::new(cache.clone())?);

        Ok(Self {
            listener,
            deps: TunnelDeps {
                connector: Arc::new(DirectConnector),
                policy,
                routes,
            },
            cache,
            shutdown_rx,
        })
    }

    /// Replace the upstream connector (tests use fixed endpoints).
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.deps.connector = connector;
        self
    }

    /// Replace the post-sniff routes.
    pub fn with_routes(mut self, routes: Arc<dyn TunnelRoutes>) -> Self {
        self.deps.routes = routes;
        self
    }

    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The certificate context cache backing interception.
    pub fn cache(&self) -> Arc<ContextCache> {
        self.cache.clone()
    }

    /// Accept connections until the shutdown flag flips.
    pub async fn run(self) -> ProxyResult<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, stream: TcpStream) {
        let deps = self.deps.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, deps).await {
                // Don't log connection resets as errors - they're common
                let err_str = e.to_string();
                if err_str.contains("connection reset")
                    || err_str.contains("broken pipe")
                    || err_str.contains("Connection reset")
                {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }
}

/// Handle a single client connection.
async fn handle_connection(mut stream: TcpStream, deps: TunnelDeps) -> ProxyResult<()> {
    let (buffer, head_end) = read_request_head(&mut stream).await?;

    let line_end = buffer
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head_end);
    let request_line = std::str::from_utf8(&buffer[..line_end])
        .map_err(|_| ProxyError::InvalidRequest("request line is not valid UTF-8".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::InvalidRequest("empty request line".into()))?;
    let request_target = parts
        .next()
        .ok_or_else(|| ProxyError::InvalidRequest("request line has no target".into()))?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = parse_target(request_target)?;
        // Bytes past the head arrived with the request; the dispatcher
        // treats them as the sniff prefix.
        let head = Bytes::copy_from_slice(&buffer[head_end..]);
        return run_tunnel(stream, target, head, &deps).await;
    }

    // Plain path: absolute-URI request, forwarded in the clear.
    let target = parse_plain_target(request_target)?;
    debug!("Plain HTTP request to {}:{}", target.host, target.port);

    match deps.connector.connect(&target.host, target.port).await {
        Ok(remote) => {
            deps.routes
                .route_http(stream, remote, Bytes::from(buffer))
                .await
        }
        Err(e) => {
            let addr = format!("{}:{}", target.host, target.port);
            debug!("Upstream connect to {} failed: {}", addr, e);
            write_unreachable(&mut stream, &e.to_string()).await?;
            Err(ProxyError::UpstreamConnect {
                addr,
                message: e.to_string(),
            })
        }
    }
}

/// Read until the blank line ending the request head.
///
/// Returns the full buffer read so far and the index just past the
/// `\r\n\r\n` terminator; bytes beyond it belong to the tunneled protocol.
async fn read_request_head(stream: &mut TcpStream) -> ProxyResult<(Vec<u8>, usize)> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&buffer) {
            return Ok((buffer, end));
        }
        if buffer.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::InvalidRequest("request head too large".into()));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::InvalidRequest(
                "connection closed before request head".into(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Index just past the `\r\n\r\n` head terminator, if present.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Extract `host:port` from an absolute-URI request target, port 80 default.
fn parse_plain_target(request_target: &str) -> ProxyResult<super::tunnel::TunnelTarget> {
    let rest = request_target.strip_prefix("http://").ok_or_else(|| {
        ProxyError::InvalidRequest(format!("unsupported request target: {}", request_target))
    })?;
    let authority = rest.split('/').next().unwrap_or(rest);
    parse_authority(authority, 80)
}
