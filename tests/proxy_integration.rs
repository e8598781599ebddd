//! End-to-end tests over real sockets.
//!
//! Each test stands up the proxy frontend on an ephemeral port, plus a local
//! origin server playing the upstream. The decrypt path uses a second,
//! independent root for the origin so the proxy's upstream verification is
//! exercised for real.

use async_trait::async_trait;
use bytes::Bytes;
use lensproxy::ca::{CertAuthority, LeafIdentity};
use lensproxy::proxy::{
    Connector, ContextCache, DecryptPolicy, DecryptRoutes, ProxyConfig, ProxyServer,
    ESTABLISHED_RESPONSE,
};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::*;

/// Connector that ignores the CONNECT target and dials a fixed address.
struct FixedConnector(SocketAddr);

#[async_trait]
impl Connector for FixedConnector {
    async fn connect(&self, _host: &str, _port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.0).await
    }
}

async fn bind_proxy(
    policy: DecryptPolicy,
) -> (ProxyServer, Arc<ContextCache>, watch::Sender<bool>) {
    let cache = Arc::new(ContextCache::new(8));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = ProxyConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
    };
    let server = ProxyServer::bind(&config, Arc::new(policy), cache.clone(), shutdown_rx)
        .await
        .unwrap();
    (server, cache, shutdown_tx)
}

fn start(server: ProxyServer) -> SocketAddr {
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// Plain TCP origin that echoes everything it receives.
async fn spawn_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn connect_and_establish(proxy: SocketAddr, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; ESTABLISHED_RESPONSE.len()];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response, ESTABLISHED_RESPONSE, "200 line must be byte-exact");
    stream
}

fn origin_server_config(leaf: &LeafIdentity, root_pem: &str) -> Arc<ServerConfig> {
    let mut chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
    chain.extend(
        rustls_pemfile::certs(&mut root_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap(),
    );
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
        .unwrap()
        .unwrap();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

fn client_config_trusting(root_pem: &str) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[tokio::test]
async fn connect_relay_is_byte_exact() {
    let origin = spawn_echo_origin().await;
    let (server, _cache, _shutdown) = bind_proxy(DecryptPolicy::disabled()).await;
    let server = server.with_connector(Arc::new(FixedConnector(origin)));
    let proxy = start(server);

    let mut stream = connect_and_establish(proxy, "opaque.test:443").await;

    // Arbitrary binary payload, including bytes that look like TLS and HTTP.
    let mut payload = Vec::new();
    for i in 0..1024u32 {
        payload.push((i % 251) as u8);
    }
    payload.splice(0..0, *b"\x16\x03\x01GET ");

    stream.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn sniffed_unknown_traffic_relays_with_prefix() {
    let origin = spawn_echo_origin().await;
    // Policy selects everything, so the tunnel is sniffed; the garbage
    // classifies as unknown and must be relayed, prefix first.
    let (server, _cache, _shutdown) = bind_proxy(DecryptPolicy::include(["*".to_string()])).await;
    let server = server.with_connector(Arc::new(FixedConnector(origin)));
    let proxy = start(server);

    let mut stream = connect_and_establish(proxy, "opaque.test:443").await;

    let first = b"\xde\xad\xbe\xef not a protocol";
    stream.write_all(first).await.unwrap();
    let second = b" second chunk";
    stream.write_all(second).await.unwrap();

    let mut echoed = vec![0u8; first.len() + second.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed[..first.len()], first);
    assert_eq!(&echoed[first.len()..], second);
}

#[tokio::test]
async fn http_inside_tunnel_is_forwarded_in_the_clear() {
    let origin = spawn_echo_origin().await;
    let (server, _cache, _shutdown) = bind_proxy(DecryptPolicy::include(["*".to_string()])).await;
    let server = server.with_connector(Arc::new(FixedConnector(origin)));
    let proxy = start(server);

    let mut stream = connect_and_establish(proxy, "plain.test:80").await;

    let request = b"GET /resource HTTP/1.1\r\nHost: plain.test\r\n\r\n";
    stream.write_all(request).await.unwrap();

    // The echo origin hands the request straight back, proving it arrived
    // unmodified through the HTTP route.
    let mut echoed = vec![0u8; request.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, request);
}

#[tokio::test]
async fn unreachable_upstream_gets_byte_exact_502() {
    let (server, _cache, _shutdown) = bind_proxy(DecryptPolicy::disabled()).await;
    // Default direct connector; port 1 refuses immediately.
    let proxy = start(server);

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(
        text.starts_with("HTTP/1.1 502 Server Unreachable\r\n"),
        "got: {text}"
    );
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(content_length, body.len());
    assert!(!body.is_empty());
}

#[tokio::test]
async fn tls_decrypt_presents_minted_certificate() {
    // Independent root for the origin, so upstream verification is real.
    let origin_root = CertAuthority::generate().unwrap();
    let origin_leaf = origin_root.issue("intercept.test", 7, None).unwrap();
    let origin_config = origin_server_config(&origin_leaf, origin_root.cert_pem());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(origin_config);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = tls.read(&mut buf).await.unwrap();
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\n\r\nhello from origin")
            .await
            .unwrap();
        tls.shutdown().await.unwrap();
    });

    let (server, cache, _shutdown) =
        bind_proxy(DecryptPolicy::include(["intercept.test".to_string()])).await;
    let routes = DecryptRoutes::with_upstream_config(
        cache.clone(),
        client_config_trusting(origin_root.cert_pem()),
    );
    let server = server
        .with_connector(Arc::new(FixedConnector(origin_addr)))
        .with_routes(Arc::new(routes));
    let proxy = start(server);

    // The client trusts the proxy's root, exported before any issuance.
    let proxy_root_pem = cache.root_cert_pem().unwrap();
    let connector = TlsConnector::from(client_config_trusting(&proxy_root_pem));

    let stream = connect_and_establish(proxy, "intercept.test:443").await;
    let server_name = ServerName::try_from("intercept.test".to_string()).unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    // The proxy must present a leaf minted for the CONNECT hostname.
    let (_, connection) = tls.get_ref();
    let presented = connection.peer_certificates().unwrap();
    let (_, cert) = parse_x509_certificate(presented[0].as_ref()).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .unwrap()
        .as_str()
        .unwrap();
    assert_eq!(cn, "intercept.test");
    assert_eq!(connection.alpn_protocol(), Some(b"http/1.1".as_slice()));

    tls.write_all(b"GET / HTTP/1.1\r\nHost: intercept.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.ends_with("hello from origin"), "got: {text}");
}

#[tokio::test]
async fn excluded_tls_target_is_relayed_not_decrypted() {
    // The origin uses its own root; the client trusts only that root. If
    // the proxy tried to intercept, this handshake would fail.
    let origin_root = CertAuthority::generate().unwrap();
    let origin_leaf = origin_root.issue("passthrough.test", 7, None).unwrap();
    let origin_config = origin_server_config(&origin_leaf, origin_root.cert_pem());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(origin_config);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = tls.read(&mut buf).await.unwrap();
        tls.write_all(b"untouched").await.unwrap();
        tls.shutdown().await.unwrap();
    });

    let policy = DecryptPolicy::exclude(["passthrough.test".to_string()]);
    let (server, _cache, _shutdown) = bind_proxy(policy).await;
    let server = server.with_connector(Arc::new(FixedConnector(origin_addr)));
    let proxy = start(server);

    let connector = TlsConnector::from(client_config_trusting(origin_root.cert_pem()));
    let stream = connect_and_establish(proxy, "passthrough.test:443").await;
    let server_name = ServerName::try_from("passthrough.test".to_string()).unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    tls.write_all(b"ping").await.unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"untouched");
}

#[tokio::test]
async fn absolute_uri_request_takes_plain_path() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    let (head_tx, head_rx) = oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                break;
            }
        }
        let _ = head_tx.send(head);
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
    });

    let (server, _cache, _shutdown) = bind_proxy(DecryptPolicy::disabled()).await;
    let proxy = start(server);

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://{origin_addr}/status HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 204 No Content"), "got: {text}");

    // The buffered request reached the origin verbatim.
    let received = head_rx.await.unwrap();
    assert!(received.starts_with(b"GET http://"));
}

#[tokio::test]
async fn shutdown_drains_in_flight_tunnels() {
    let origin = spawn_echo_origin().await;
    let (server, _cache, shutdown_tx) = bind_proxy(DecryptPolicy::disabled()).await;
    let server = server.with_connector(Arc::new(FixedConnector(origin)));
    let proxy = start(server);

    let mut stream = connect_and_establish(proxy, "opaque.test:443").await;

    // Stop accepting; the established tunnel must keep flowing.
    shutdown_tx.send(true).unwrap();
    tokio::task::yield_now().await;

    stream.write_all(b"still alive").await.unwrap();
    let mut echoed = [0u8; 11];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still alive");
}

#[tokio::test]
async fn connect_head_trailing_bytes_are_replayed() {
    let origin = spawn_echo_origin().await;
    let (server, _cache, _shutdown) = bind_proxy(DecryptPolicy::include(["*".to_string()])).await;
    let server = server.with_connector(Arc::new(FixedConnector(origin)));
    let proxy = start(server);

    // Send payload bytes in the same write as the CONNECT head. They must
    // be used as the sniff prefix and reach the origin first.
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let head = Bytes::from_static(b"CONNECT eager.test:443 HTTP/1.1\r\n\r\n\x01\x02\x03early");
    stream.write_all(&head).await.unwrap();

    let mut response = vec![0u8; ESTABLISHED_RESPONSE.len()];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response, ESTABLISHED_RESPONSE);

    let mut echoed = [0u8; 8];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"\x01\x02\x03early");
}
