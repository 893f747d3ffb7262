//! Whole server over loopback: listener, tunnel inbound, dispatcher and the
//! direct outbound

use proxy_relay::business::{DefaultDispatcher, StatsManager, SystemDialer, UserStore};
use proxy_relay::config::ConnConfig;
use proxy_relay::core::conn::{ConnIo, Connection, TcpConnection};
use proxy_relay::core::net::Destination;
use proxy_relay::core::relay::{Relay, RelayPolicy};
use proxy_relay::core::unwrap::Side;
use proxy_relay::core::{Counter, MemoryUser, Server, SessionManager, UserManager};
use proxy_relay::proxy::{Freedom, Timeouts, Tunnel};
use proxy_relay::error::ProxyError;
use proxy_relay::server_runner::{bind_listener, serve, tls_handshake};
use proxy_relay::transport::{load_server_config, TlsConnection};

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

const REQUEST: &[u8] = b"GET /\r\n";
const RESPONSE_LEN: usize = 1024;

/// Destination that reads one request and answers with a fixed body
async fn destination() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut request = [0u8; REQUEST.len()];
                stream.read_exact(&mut request).await.unwrap();
                assert_eq!(&request, REQUEST);
                stream.write_all(&[b'x'; RESPONSE_LEN]).await.unwrap();
                stream.shutdown().await.unwrap();
            });
        }
    });
    addr
}

struct Harness {
    addr: SocketAddr,
    stats: Arc<StatsManager>,
    sessions: SessionManager,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(policy: RelayPolicy, tls: Option<TlsAcceptor>) -> Self {
        Self::start_owned(policy, tls, None).await
    }

    async fn start_owned(policy: RelayPolicy, tls: Option<TlsAcceptor>, owner: Option<(&str, UserStore)>) -> Self {
        let target = destination().await;
        let conn_config = ConnConfig::default();
        let shutdown = CancellationToken::new();
        let stats = Arc::new(StatsManager::new());
        let sessions = SessionManager::with_parent(shutdown.clone());
        let relay = Arc::new(Relay::new(policy));
        let timeouts = Timeouts::from(&conn_config);

        let dialer = SystemDialer::from_config(&conn_config).with_traffic(stats.traffic_counters("outbound", "direct"));
        let dispatcher = DefaultDispatcher::new(Arc::new(Freedom::new(Arc::clone(&relay), timeouts)), Arc::new(dialer))
            .with_stats(Arc::clone(&stats));
        let mut tunnel = Tunnel::new(Destination::from(target), relay, timeouts);
        if let Some((email, users)) = owner {
            tunnel = tunnel.with_owner(email, users);
        }
        let server = Arc::new(
            Server::builder()
                .tag("tunnel-in")
                .inbound(Arc::new(tunnel))
                .dispatcher(Arc::new(dispatcher))
                .sessions(sessions.clone())
                .conn_config(conn_config)
                .traffic(stats.traffic_counters("inbound", "tunnel-in"))
                .build(),
        );

        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(serve(server, listener, tls, shutdown.clone()));

        Self {
            addr,
            stats,
            sessions,
            shutdown,
            task,
        }
    }

    fn counter(&self, name: &str) -> u64 {
        self.stats.get_counter(name).map(|c| c.value()).unwrap_or_default()
    }

    async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.sessions.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions did not finish");
    }

    fn assert_traffic(&self) {
        assert_eq!(self.counter("inbound>>>tunnel-in>>>traffic>>>uplink"), REQUEST.len() as u64);
        assert_eq!(self.counter("inbound>>>tunnel-in>>>traffic>>>downlink"), RESPONSE_LEN as u64);
        assert_eq!(self.counter("outbound>>>direct>>>traffic>>>uplink"), REQUEST.len() as u64);
        assert_eq!(self.counter("outbound>>>direct>>>traffic>>>downlink"), RESPONSE_LEN as u64);
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

/// Send the request and read the whole response
async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Vec<u8> {
    stream.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

struct TestCert {
    cert: rcgen::CertifiedKey,
    cert_file: tempfile::NamedTempFile,
    key_file: tempfile::NamedTempFile,
}

fn test_cert() -> TestCert {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(cert.key_pair.serialize_pem().as_bytes()).unwrap();

    TestCert {
        cert,
        cert_file,
        key_file,
    }
}

impl TestCert {
    fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(load_server_config(self.cert_file.path(), self.key_file.path()).unwrap())
    }

    fn connector(&self) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert.cert.der().clone()).unwrap();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

fn server_name() -> rustls::pki_types::ServerName<'static> {
    rustls::pki_types::ServerName::try_from("localhost").unwrap()
}

#[tokio::test]
async fn test_plain_exchange_buffered() {
    let harness = Harness::start(RelayPolicy::buffered_only(), None).await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    let response = exchange(&mut client).await;
    assert_eq!(response, vec![b'x'; RESPONSE_LEN]);
    drop(client);

    harness.wait_idle().await;
    harness.assert_traffic();
    harness.stop().await;
}

#[tokio::test]
async fn test_plain_exchange_default_policy() {
    let harness = Harness::start(RelayPolicy::default(), None).await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    let response = exchange(&mut client).await;
    assert_eq!(response.len(), RESPONSE_LEN);
    drop(client);

    harness.wait_idle().await;
    harness.assert_traffic();
    harness.stop().await;
}

#[tokio::test]
async fn test_tls_exchange() {
    let cert = test_cert();
    let harness = Harness::start(RelayPolicy::default(), Some(cert.acceptor())).await;

    let tcp: Arc<dyn Connection> = Arc::new(TcpConnection::connect(harness.addr).await.unwrap());
    let client = TlsConnection::connect(&cert.connector(), server_name(), tcp).await.unwrap();
    let response = exchange(&mut ConnIo::new(&client)).await;
    assert_eq!(response, vec![b'x'; RESPONSE_LEN]);
    client.close();

    harness.wait_idle().await;
    // The inbound counts plaintext
    harness.assert_traffic();
    harness.stop().await;
}

#[tokio::test]
async fn test_tls_connection_unwraps_to_socket() {
    let cert = test_cert();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connector = cert.connector();
    let client = tokio::spawn(async move {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector.connect(server_name(), tcp).await.unwrap();
        tls.write_all(b"hello").await.unwrap();
        tls.shutdown().await.unwrap();
        // Wait for the server to finish before closing
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
    });

    let (stream, _) = listener.accept().await.unwrap();
    let raw: Arc<dyn Connection> = Arc::new(TcpConnection::new(stream));
    let tls = TlsConnection::accept(&cert.acceptor(), raw).await.unwrap();

    let relay = Relay::default();
    let unwrapped = relay.unwrapper().unwrap(&tls, Side::Read);
    assert!(unwrapped.socket().is_some());
    assert!(unwrapped.secured);

    let mut io = ConnIo::new(&tls);
    let mut plain = Vec::new();
    io.read_to_end(&mut plain).await.unwrap();
    assert_eq!(plain, b"hello");

    io.shutdown().await.unwrap();
    client.await.unwrap();
}

#[tokio::test]
async fn test_serve_stops_on_cancel() {
    let harness = Harness::start(RelayPolicy::default(), None).await;
    let addr = harness.addr;
    tokio::time::timeout(Duration::from_secs(5), harness.stop())
        .await
        .expect("serve did not stop");

    // The listener is gone once serve returns
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_cancel_ends_open_sessions() {
    let harness = Harness::start(RelayPolicy::default(), None).await;

    // Connected but silent; the destination never answers
    let client = TcpStream::connect(harness.addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.sessions.session_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    harness.sessions.cancel_all();
    harness.wait_idle().await;
    drop(client);
    harness.stop().await;
}

#[tokio::test]
async fn test_owner_traffic_and_removal() {
    let users = UserStore::new();
    users.add_user(MemoryUser::new("ops@example.com")).await.unwrap();
    let harness = Harness::start_owned(
        RelayPolicy::default(),
        None,
        Some(("ops@example.com", users.clone())),
    )
    .await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    assert_eq!(exchange(&mut client).await.len(), RESPONSE_LEN);
    drop(client);
    harness.wait_idle().await;
    harness.assert_traffic();
    // Sessions with a user stay on the link, so user counters see both directions
    assert_eq!(harness.counter("user>>>ops@example.com>>>traffic>>>uplink"), REQUEST.len() as u64);
    assert_eq!(harness.counter("user>>>ops@example.com>>>traffic>>>downlink"), RESPONSE_LEN as u64);

    users.remove_user("ops@example.com").await.unwrap();
    let mut refused = TcpStream::connect(harness.addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), refused.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    harness.wait_idle().await;
    harness.stop().await;
}

async fn accepted_conn() -> (Arc<dyn Connection>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (Arc::new(TcpConnection::new(accepted.unwrap().0)), client.unwrap())
}

#[tokio::test]
async fn test_tls_handshake_rejects_plaintext() {
    let cert = test_cert();
    let (conn, mut client) = accepted_conn().await;
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let err = tls_handshake(&cert.acceptor(), conn, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(&err, ProxyError::Tls(msg) if msg.starts_with("handshake failed")), "{err}");

    // The server side is closed after the failure
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_tls_handshake_timeout() {
    let cert = test_cert();
    let (conn, _client) = accepted_conn().await;

    let err = tls_handshake(&cert.acceptor(), conn, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(&err, ProxyError::Tls(msg) if msg == "handshake timeout"), "{err}");
}
