/// QUIC link layer
///
/// One QuicLink is a listener/dialer bound to a UDP socket; each accepted or
/// dialed connection becomes a LinkSession after an RC handshake. Messages
/// travel as length-prefixed frames over unidirectional streams.

use super::session::{
    CompletionHandler, DeliveryStatus, LinkSession, SessionDirection, SessionState, SessionStats,
};
use super::{Link, LinkError};
use crate::identity::{Identity, RouterId};
use crate::router::contact::RouterContact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use veilnet_common::config::link::{MAX_LINK_MSG_SIZE, MAX_SEND_QUEUE_SIZE};
use veilnet_common::TransportKind;

/// Receives every message arriving on any session of a link
pub type MessageSink = Arc<dyn Fn(RouterId, Vec<u8>) + Send + Sync>;

/// Hello exchanged when a connection opens, both directions
#[derive(Debug, Serialize, Deserialize)]
struct LinkHello {
    rc: RouterContact,
}

pub struct QuicLink {
    name: String,
    identity: Identity,

    /// Our own RC, presented during the handshake
    local_rc: RouterContact,

    /// Whether this link accepts inbound connections
    accepts_inbound: bool,

    endpoint: quinn::Endpoint,
    sessions: Arc<RwLock<HashMap<RouterId, Arc<QuicSession>>>>,
    pending: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    message_sink: MessageSink,
    accept_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QuicLink {
    pub fn new(
        name: impl Into<String>,
        bind_addr: SocketAddr,
        identity: Identity,
        local_rc: RouterContact,
        accepts_inbound: bool,
        message_sink: MessageSink,
    ) -> Result<Self, LinkError> {
        let name = name.into();
        let server_config = Self::server_config().map_err(|reason| LinkError::StartFailed {
            name: name.clone(),
            reason,
        })?;
        let client_config = Self::client_config().map_err(|reason| LinkError::StartFailed {
            name: name.clone(),
            reason,
        })?;

        let mut endpoint = quinn::Endpoint::server(server_config, bind_addr).map_err(|e| {
            LinkError::StartFailed {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            name,
            identity,
            local_rc,
            accepts_inbound,
            endpoint,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(AtomicUsize::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            message_sink,
            accept_task: StdMutex::new(None),
        })
    }

    pub fn router_id(&self) -> RouterId {
        self.identity.router_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        let mut addr = self
            .endpoint
            .local_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr"));
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        }
        addr
    }

    /// Server configuration with a self-signed certificate
    ///
    /// Channel identity comes from the RC handshake, not the TLS layer.
    fn server_config() -> Result<quinn::ServerConfig, String> {
        let cert = rcgen::generate_simple_self_signed(vec!["veilnet.local".to_string()])
            .map_err(|e| e.to_string())?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
            .map_err(|e| format!("invalid key: {:?}", e))?;

        let server_crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| e.to_string())?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| e.to_string())?,
        ));

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(
            veilnet_common::config::link::DEFAULT_SESSION_LIFETIME
                .try_into()
                .map_err(|_| "bad idle timeout".to_string())?,
        ));
        transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(5)));
        server_config.transport_config(Arc::new(transport_config));

        Ok(server_config)
    }

    /// Client configuration accepting any certificate
    fn client_config() -> Result<quinn::ClientConfig, String> {
        let crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(|e| e.to_string())?,
        ));

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(
            veilnet_common::config::link::DEFAULT_SESSION_LIFETIME
                .try_into()
                .map_err(|_| "bad idle timeout".to_string())?,
        ));
        transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(5)));
        client_config.transport_config(Arc::new(transport_config));

        Ok(client_config)
    }

    /// Dial a remote router at `addr` and run the RC handshake
    pub async fn connect(
        &self,
        addr: SocketAddr,
        expected: &RouterContact,
    ) -> Result<Arc<dyn LinkSession>, LinkError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(LinkError::Stopped);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let result = self.connect_inner(addr, expected).await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn connect_inner(
        &self,
        addr: SocketAddr,
        expected: &RouterContact,
    ) -> Result<Arc<dyn LinkSession>, LinkError> {
        let connection = self
            .endpoint
            .connect(addr, "veilnet.local")
            .map_err(|e| LinkError::HandshakeFailed(expected.router_id, e.to_string()))?
            .await
            .map_err(|e| LinkError::HandshakeFailed(expected.router_id, e.to_string()))?;

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| LinkError::HandshakeFailed(expected.router_id, e.to_string()))?;

        write_frame(
            &mut send,
            &LinkHello {
                rc: self.local_rc.clone(),
            },
        )
        .await
        .map_err(|e| LinkError::HandshakeFailed(expected.router_id, e))?;

        let hello: LinkHello = read_frame(&mut recv)
            .await
            .map_err(|e| LinkError::HandshakeFailed(expected.router_id, e))?;

        if hello.rc.router_id != expected.router_id {
            return Err(LinkError::HandshakeFailed(
                expected.router_id,
                "remote presented a different identity".to_string(),
            ));
        }
        if !hello.rc.verify() {
            return Err(LinkError::HandshakeFailed(
                expected.router_id,
                "remote RC signature invalid".to_string(),
            ));
        }

        debug!(remote = %hello.rc.router_id, "outbound link session established");
        let session = self
            .register_session(connection, hello.rc, SessionDirection::Outbound)
            .await;
        Ok(session)
    }

    async fn register_session(
        &self,
        connection: quinn::Connection,
        rc: RouterContact,
        direction: SessionDirection,
    ) -> Arc<QuicSession> {
        let session = Arc::new(QuicSession {
            connection: connection.clone(),
            rc: rc.clone(),
            direction,
            state: StdMutex::new(SessionState::Established),
            stats: StdMutex::new(StatsWindow::new()),
        });

        self.sessions
            .write()
            .await
            .insert(rc.router_id, session.clone());

        // per-session receive loop
        let sink = self.message_sink.clone();
        let sessions = self.sessions.clone();
        let recv_session = session.clone();
        tokio::spawn(async move {
            recv_session.receive_loop(sink).await;
            sessions.write().await.remove(&recv_session.rc.router_id);
        });

        session
    }

    async fn accept_loop(
        endpoint: quinn::Endpoint,
        link: Arc<QuicLinkShared>,
    ) {
        while let Some(connecting) = endpoint.accept().await {
            if link.stopping.load(Ordering::SeqCst) {
                break;
            }
            let link = link.clone();
            link.pending.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_incoming(connecting, &link).await {
                    debug!("inbound session rejected: {}", e);
                }
                link.pending.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn handle_incoming(
        connecting: quinn::Incoming,
        link: &QuicLinkShared,
    ) -> Result<(), String> {
        let connection = connecting.await.map_err(|e| e.to_string())?;
        let (mut send, mut recv) = connection.accept_bi().await.map_err(|e| e.to_string())?;

        let hello: LinkHello = read_frame(&mut recv).await?;
        if !hello.rc.verify() {
            return Err("remote RC signature invalid".to_string());
        }

        write_frame(
            &mut send,
            &LinkHello {
                rc: link.local_rc.clone(),
            },
        )
        .await?;

        info!(remote = %hello.rc.router_id, "inbound link session established");
        let session = Arc::new(QuicSession {
            connection: connection.clone(),
            rc: hello.rc.clone(),
            direction: SessionDirection::Inbound,
            state: StdMutex::new(SessionState::Established),
            stats: StdMutex::new(StatsWindow::new()),
        });
        link.sessions
            .write()
            .await
            .insert(hello.rc.router_id, session.clone());

        let sink = link.message_sink.clone();
        let sessions = link.sessions.clone();
        tokio::spawn(async move {
            session.receive_loop(sink).await;
            sessions.write().await.remove(&session.rc.router_id);
        });
        Ok(())
    }

    fn shared(&self) -> Arc<QuicLinkShared> {
        Arc::new(QuicLinkShared {
            local_rc: self.local_rc.clone(),
            sessions: self.sessions.clone(),
            pending: self.pending.clone(),
            stopping: self.stopping.clone(),
            message_sink: self.message_sink.clone(),
        })
    }
}

/// State shared with the accept loop task
struct QuicLinkShared {
    local_rc: RouterContact,
    sessions: Arc<RwLock<HashMap<RouterId, Arc<QuicSession>>>>,
    pending: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    message_sink: MessageSink,
}

#[async_trait]
impl Link for QuicLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Quic
    }

    fn is_compatible(&self, rc: &RouterContact) -> bool {
        rc.transports.contains(&TransportKind::Quic)
            && rc.addresses.iter().any(|a| a.socket_addr().is_some())
    }

    async fn start(&self) -> Result<(), LinkError> {
        if self.accepts_inbound {
            let endpoint = self.endpoint.clone();
            let shared = self.shared();
            let handle = tokio::spawn(async move {
                Self::accept_loop(endpoint, shared).await;
            });
            *self.accept_task.lock().expect("accept task lock") = Some(handle);
        }
        info!(link = %self.name, addr = %self.local_addr(), "link started");
        Ok(())
    }

    async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_task.lock().expect("accept task lock").take() {
            handle.abort();
        }

        let sessions: Vec<Arc<QuicSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    async fn pump(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.roll_rate_window();
        }
    }

    async fn session_to(&self, remote: &RouterId) -> Option<Arc<dyn LinkSession>> {
        self.sessions
            .read()
            .await
            .get(remote)
            .cloned()
            .map(|s| s as Arc<dyn LinkSession>)
    }

    async fn sessions(&self) -> Vec<Arc<dyn LinkSession>> {
        self.sessions
            .read()
            .await
            .values()
            .cloned()
            .map(|s| s as Arc<dyn LinkSession>)
            .collect()
    }

    async fn close_session_to(&self, remote: &RouterId) {
        if let Some(session) = self.sessions.write().await.remove(remote) {
            session.close().await;
        }
    }

    async fn num_pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// One live QUIC connection to a remote router
struct QuicSession {
    connection: quinn::Connection,
    rc: RouterContact,
    direction: SessionDirection,
    state: StdMutex<SessionState>,
    stats: StdMutex<StatsWindow>,
}

/// Counters plus the rolling one-second rate window
struct StatsWindow {
    stats: SessionStats,
    window_start: Instant,
    window_rx_bytes: u64,
    window_tx_bytes: u64,
}

impl StatsWindow {
    fn new() -> Self {
        Self {
            stats: SessionStats::default(),
            window_start: Instant::now(),
            window_rx_bytes: 0,
            window_tx_bytes: 0,
        }
    }
}

impl QuicSession {
    async fn receive_loop(&self, sink: MessageSink) {
        loop {
            let mut recv = match self.connection.accept_uni().await {
                Ok(recv) => recv,
                Err(e) => {
                    debug!(remote = %self.rc.router_id, "session receive loop ended: {}", e);
                    *self.state.lock().expect("state lock") = SessionState::Closed;
                    return;
                }
            };

            match read_raw_frame(&mut recv).await {
                Ok(data) => {
                    {
                        let mut window = self.stats.lock().expect("stats lock");
                        window.stats.rx_packets += 1;
                        window.window_rx_bytes += data.len() as u64;
                    }
                    sink(self.rc.router_id, data);
                }
                Err(e) => {
                    debug!(remote = %self.rc.router_id, "bad frame: {}", e);
                }
            }
        }
    }

    fn roll_rate_window(&self) {
        let mut window = self.stats.lock().expect("stats lock");
        let elapsed = window.window_start.elapsed();
        if elapsed.as_millis() >= 1000 {
            let secs = elapsed.as_secs_f64();
            window.stats.rx_rate = (window.window_rx_bytes as f64 / secs) as u64;
            window.stats.tx_rate = (window.window_tx_bytes as f64 / secs) as u64;
            window.window_rx_bytes = 0;
            window.window_tx_bytes = 0;
            window.window_start = Instant::now();
        }
    }
}

#[async_trait]
impl LinkSession for QuicSession {
    fn remote_id(&self) -> RouterId {
        self.rc.router_id
    }

    fn remote_rc(&self) -> RouterContact {
        self.rc.clone()
    }

    fn direction(&self) -> SessionDirection {
        self.direction
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    fn is_relay(&self) -> bool {
        self.rc.public_router
    }

    fn stats(&self) -> SessionStats {
        self.stats.lock().expect("stats lock").stats
    }

    async fn send(&self, buf: Vec<u8>, completed: Option<CompletionHandler>) -> bool {
        let oversize = buf.len() > MAX_LINK_MSG_SIZE;
        let backlogged = {
            let window = self.stats.lock().expect("stats lock");
            window.stats.in_flight_tx as usize >= MAX_SEND_QUEUE_SIZE
        };
        if oversize || backlogged || !self.is_established() {
            let mut window = self.stats.lock().expect("stats lock");
            window.stats.dropped_tx += 1;
            drop(window);
            if let Some(cb) = completed {
                cb(DeliveryStatus::Dropped);
            }
            return false;
        }

        {
            let mut window = self.stats.lock().expect("stats lock");
            window.stats.in_flight_tx += 1;
        }

        let result = self.send_inner(&buf).await;

        let mut window = self.stats.lock().expect("stats lock");
        window.stats.in_flight_tx = window.stats.in_flight_tx.saturating_sub(1);
        match result {
            Ok(()) => {
                window.stats.acked_tx += 1;
                window.window_tx_bytes += buf.len() as u64;
                drop(window);
                if let Some(cb) = completed {
                    cb(DeliveryStatus::Delivered);
                }
                true
            }
            Err(e) => {
                window.stats.dropped_tx += 1;
                drop(window);
                warn!(remote = %self.rc.router_id, "send failed: {}", e);
                if let Some(cb) = completed {
                    cb(DeliveryStatus::Dropped);
                }
                false
            }
        }
    }

    async fn send_keepalive(&self) -> bool {
        self.connection
            .send_datagram(bytes::Bytes::from_static(&[0u8]))
            .is_ok()
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().expect("state lock");
            *state = SessionState::Closing;
        }
        self.connection.close(0u32.into(), b"close");
        *self.state.lock().expect("state lock") = SessionState::Closed;
    }
}

impl QuicSession {
    async fn send_inner(&self, buf: &[u8]) -> Result<(), String> {
        let mut send = self
            .connection
            .open_uni()
            .await
            .map_err(|e| e.to_string())?;
        let len = buf.len() as u32;
        send.write_all(&len.to_le_bytes())
            .await
            .map_err(|e| e.to_string())?;
        send.write_all(buf).await.map_err(|e| e.to_string())?;
        send.finish().map_err(|e| e.to_string())?;
        Ok(())
    }
}

async fn write_frame<T: Serialize>(
    send: &mut quinn::SendStream,
    value: &T,
) -> Result<(), String> {
    let data = bincode::serialize(value).map_err(|e| e.to_string())?;
    let len = data.len() as u32;
    send.write_all(&len.to_le_bytes())
        .await
        .map_err(|e| e.to_string())?;
    send.write_all(&data).await.map_err(|e| e.to_string())?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(
    recv: &mut quinn::RecvStream,
) -> Result<T, String> {
    let data = read_raw_frame(recv).await?;
    bincode::deserialize(&data).map_err(|e| e.to_string())
}

async fn read_raw_frame(recv: &mut quinn::RecvStream) -> Result<Vec<u8>, String> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| e.to_string())?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_LINK_MSG_SIZE {
        return Err(format!("frame too large: {} bytes", len));
    }
    let mut data = vec![0u8; len];
    recv.read_exact(&mut data)
        .await
        .map_err(|e| e.to_string())?;
    Ok(data)
}

/// Skip certificate verification; session identity is the RC handshake
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as TestMutex;
    use veilnet_common::{NetworkAddress, Timestamp};

    fn make_link(
        name: &str,
        accepts_inbound: bool,
        sink: MessageSink,
    ) -> (QuicLink, RouterContact) {
        let identity = Identity::generate();
        let rc = RouterContact::create(
            &identity,
            vec![NetworkAddress::from_socket("127.0.0.1:0".parse().unwrap())],
            vec![TransportKind::Quic],
            true,
            Timestamp::now(),
        );
        let link = QuicLink::new(
            name,
            "127.0.0.1:0".parse().unwrap(),
            identity,
            rc.clone(),
            accepts_inbound,
            sink,
        )
        .unwrap();
        (link, rc)
    }

    #[tokio::test]
    async fn test_handshake_and_message_delivery() {
        let received: Arc<TestMutex<Vec<(RouterId, Vec<u8>)>>> =
            Arc::new(TestMutex::new(Vec::new()));
        let received2 = received.clone();
        let server_sink: MessageSink = Arc::new(move |remote, data| {
            received2.lock().unwrap().push((remote, data));
        });
        let client_sink: MessageSink = Arc::new(|_, _| {});

        let (server, server_rc) = make_link("in0", true, server_sink);
        server.start().await.unwrap();
        let server_addr = server.local_addr();

        let (client, client_rc) = make_link("out0", false, client_sink);
        client.start().await.unwrap();

        let mut expected = server_rc.clone();
        expected.addresses = vec![NetworkAddress::from_socket(server_addr)];
        let session = client.connect(server_addr, &server_rc).await.unwrap();
        assert!(session.is_established());
        assert_eq!(session.remote_id(), server_rc.router_id);

        assert!(session.send(b"across the mesh".to_vec(), None).await);

        // wait for the frame to land on the server sink
        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, client_rc.router_id);
        assert_eq!(got[0].1, b"across the mesh".to_vec());
        drop(got);

        // the server registered a session for the client too
        assert!(server.session_to(&client_rc.router_id).await.is_some());
        assert_eq!(expected.router_id, server_rc.router_id);
    }

    #[tokio::test]
    async fn test_oversize_message_dropped() {
        let sink: MessageSink = Arc::new(|_, _| {});
        let (server, server_rc) = make_link("in0", true, sink.clone());
        server.start().await.unwrap();

        let (client, _) = make_link("out0", false, sink);
        client.start().await.unwrap();

        let session = client
            .connect(server.local_addr(), &server_rc)
            .await
            .unwrap();

        let drops = Arc::new(AtomicUsize::new(0));
        let drops2 = drops.clone();
        let huge = vec![0u8; MAX_LINK_MSG_SIZE + 1];
        let ok = session
            .send(
                huge,
                Some(Box::new(move |status| {
                    assert_eq!(status, DeliveryStatus::Dropped);
                    drops2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;
        assert!(!ok);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(session.stats().dropped_tx, 1);
    }

    #[tokio::test]
    async fn test_stop_closes_sessions() {
        let sink: MessageSink = Arc::new(|_, _| {});
        let (server, server_rc) = make_link("in0", true, sink.clone());
        server.start().await.unwrap();

        let (client, _) = make_link("out0", false, sink);
        client.start().await.unwrap();
        client
            .connect(server.local_addr(), &server_rc)
            .await
            .unwrap();

        client.stop().await;
        assert!(client.session_to(&server_rc.router_id).await.is_none());
        assert!(client.connect(server.local_addr(), &server_rc).await.is_err());
    }
}
