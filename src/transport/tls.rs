use crate::{
    transport::{
        conn_state::{ConnState, ConnectionCore, Directive, Notice, Step},
        connection::{TransportEvent, TransportSender},
        framing::{Frame, StreamFramer, KEEPALIVE_RESPONSE},
        sip_addr::SipAddr,
        tcp::{classify_io_error, merge, notice_to_event, ConnCommand, OorParkHook},
        SipConnection,
    },
    Error, Result,
};
use bytes::Bytes;
use rsip::transport::Transport;
use std::{fmt, sync::Arc, sync::Mutex};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    sync::Mutex as AsyncMutex,
};
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector,
};
use tracing::{debug, info, warn};

/// TLS configuration, PEM encoded.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Server certificate chain.
    pub cert: Option<Vec<u8>>,
    /// Server private key.
    pub key: Option<Vec<u8>>,
    /// Root CA certificates trusted for outgoing connections.
    pub ca_certs: Option<Vec<u8>>,
}

type TlsIo = tokio_rustls::TlsStream<TcpStream>;

pub(super) struct TlsInner {
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub(super) core: Mutex<ConnectionCore>,
    read_half: Mutex<Option<ReadHalf<TlsIo>>>,
    write_half: AsyncMutex<Option<WriteHalf<TlsIo>>>,
    cmd_tx: UnboundedSender<ConnCommand>,
    cmd_rx: Mutex<Option<UnboundedReceiver<ConnCommand>>>,
    sender: Mutex<Option<TransportSender>>,
    oor_park: Mutex<Option<OorParkHook>>,
}

#[derive(Clone)]
pub struct TlsConnection {
    pub(super) inner: Arc<TlsInner>,
}

impl TlsConnection {
    /// Connect to a remote TLS server and run the handshake. The remote is
    /// a resolved candidate, so its host is an IP; the textual host is
    /// still what goes into SNI.
    pub async fn connect(remote: &SipAddr, config: &TlsConfig) -> Result<Self> {
        let socket_addr = remote.get_socketaddr()?;
        let mut core = ConnectionCore::new_client(Transport::Tls);
        core.open_client()?;

        let stream = match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                core.on_connect_event(false)?;
                stream
            }
            Err(e) => {
                let _ = core.on_connect_event(true);
                return Err(Error::ConnectFailed(format!("{}: {}", socket_addr, e)));
            }
        };
        let local_addr = SipAddr {
            r#type: Some(Transport::Tls),
            addr: stream.local_addr()?.into(),
        };

        let domain_string = match &remote.addr.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        let server_name = pki_types::ServerName::try_from(domain_string.as_str())
            .map_err(|_| Error::Error(format!("Invalid DNS name: {}", domain_string)))?
            .to_owned();

        core.tls_handshake_started()?;
        let connector = Self::create_connector(config)?;
        let tls_stream = match connector.connect(server_name, stream).await {
            Ok(tls_stream) => {
                core.on_tls_handshake_done(true)?;
                tls_stream
            }
            Err(e) => {
                let _ = core.on_tls_handshake_done(false);
                return Err(Error::ConnectFailed(format!("tls handshake: {}", e)));
            }
        };

        let connection =
            Self::from_parts(core, tls_stream.into(), local_addr, remote.clone());
        info!(
            "Created TLS client connection: {} -> {}",
            connection.get_addr(),
            remote
        );
        Ok(connection)
    }

    /// Wrap a server-side stream whose handshake the acceptor already
    /// completed. Stays unregistered until [`accept_confirmed`].
    ///
    /// [`accept_confirmed`]: TlsConnection::accept_confirmed
    pub fn from_server_stream(stream: TlsIo, local_addr: SipAddr, remote_addr: SipAddr) -> Result<Self> {
        let mut core = ConnectionCore::new_server(Transport::Tls);
        core.start_accept()?;
        let connection = Self::from_parts(core, stream, local_addr, remote_addr.clone());
        info!(
            "Created TLS server connection: {} <- {}",
            connection.get_addr(),
            remote_addr
        );
        Ok(connection)
    }

    fn from_parts(
        core: ConnectionCore,
        stream: TlsIo,
        local_addr: SipAddr,
        remote_addr: SipAddr,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (cmd_tx, cmd_rx) = unbounded_channel();
        TlsConnection {
            inner: Arc::new(TlsInner {
                local_addr,
                remote_addr,
                core: Mutex::new(core),
                read_half: Mutex::new(Some(read_half)),
                write_half: AsyncMutex::new(Some(write_half)),
                cmd_tx,
                cmd_rx: Mutex::new(Some(cmd_rx)),
                sender: Mutex::new(None),
                oor_park: Mutex::new(None),
            }),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub fn state(&self) -> ConnState {
        self.inner.core.lock().unwrap().state()
    }

    pub fn set_graceful_timeout(&self, timeout: std::time::Duration) {
        self.inner.core.lock().unwrap().set_graceful_timeout(timeout);
    }

    /// Accept/reject decision for an accepted connection. Acceptance also
    /// records the already-finished server handshake on the TLS axis.
    pub fn accept_confirmed(&self, accepted: bool) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        let step = core.on_accept_decision(accepted)?;
        if accepted {
            core.tls_handshake_started()?;
            core.on_tls_handshake_done(true)?;
        }
        drop(core);
        self.emit_notices(step.notices);
        self.kick();
        Ok(())
    }

    pub async fn send_raw(&self, data: Bytes) -> Result<u64> {
        let id = self.inner.core.lock().unwrap().enqueue(data)?;
        self.kick();
        Ok(id)
    }

    pub async fn close(&self) -> Result<()> {
        self.inner
            .cmd_tx
            .send(ConnCommand::Close)
            .map_err(|_| Error::Error("connection serve loop is gone".into()))
    }

    pub fn retry_after_oor(&self) -> Result<()> {
        self.inner
            .cmd_tx
            .send(ConnCommand::RetryOor)
            .map_err(|_| Error::Error("connection serve loop is gone".into()))
    }

    pub(super) fn set_oor_park(&self, hook: OorParkHook) {
        *self.inner.oor_park.lock().unwrap() = Some(hook);
    }

    pub fn acquire(&self) {
        self.inner.core.lock().unwrap().acquire();
    }

    pub fn release(&self) {
        let step = self.inner.core.lock().unwrap().release();
        self.emit_notices(step.notices);
        self.kick();
    }

    fn kick(&self) {
        self.inner.cmd_tx.send(ConnCommand::Kick).ok();
    }

    fn emit_notices(&self, notices: Vec<Notice>) {
        let sender = self.inner.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let connection = SipConnection::Tls(self.clone());
            for notice in notices {
                sender.send(notice_to_event(notice, &connection)).ok();
            }
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = match self.inner.read_half.lock().unwrap().take() {
            Some(read_half) => read_half,
            None => {
                warn!("Connection already served or closed");
                return Ok(());
            }
        };
        let mut cmd_rx = match self.inner.cmd_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        *self.inner.sender.lock().unwrap() = Some(sender.clone());

        let connection = SipConnection::Tls(self.clone());
        let mut read_buf = vec![0u8; 4096];
        let mut socket_gone = false;

        loop {
            let step = tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ConnCommand::Close) => {
                            self.inner.core.lock().unwrap().close()?
                        }
                        Some(ConnCommand::Kick) => self.flush().await,
                        Some(ConnCommand::RetryOor) => {
                            self.inner.core.lock().unwrap().retry_after_oor();
                            self.flush().await
                        }
                        Some(ConnCommand::SafetyTimer(generation)) => {
                            self.inner.core.lock().unwrap().on_safety_timer(generation)
                        }
                    }
                }
                res = read_half.read(&mut read_buf), if !socket_gone => {
                    match res {
                        Ok(0) => self.inner.core.lock().unwrap().on_peer_closed(),
                        Ok(n) => self.on_read(&read_buf[..n], &sender, &connection),
                        Err(e) => self
                            .inner
                            .core
                            .lock()
                            .unwrap()
                            .on_socket_failure(classify_io_error(&e)),
                    }
                }
            };

            self.apply_step(step, &mut socket_gone, &sender, &connection)
                .await;

            if self.inner.core.lock().unwrap().state() == ConnState::Terminated {
                debug!("serve loop finished: {}", self.inner.remote_addr);
                return Ok(());
            }
        }
    }

    fn on_read(
        &self,
        data: &[u8],
        sender: &TransportSender,
        connection: &SipConnection,
    ) -> Step {
        let mut core = self.inner.core.lock().unwrap();
        if core.state() == ConnState::Closing {
            // leftovers after shutdown, discarded
            return Step::none();
        }
        core.on_received(data);
        let mut keepalive = false;
        loop {
            match framer_decode(core.recv_buf_mut()) {
                Ok(Some(Frame::Message(msg))) => {
                    sender
                        .send(TransportEvent::Incoming(
                            msg,
                            connection.clone(),
                            self.inner.remote_addr.clone(),
                        ))
                        .ok();
                }
                Ok(Some(Frame::KeepaliveRequest)) => {
                    core.enqueue(Bytes::from_static(KEEPALIVE_RESPONSE)).ok();
                    keepalive = true;
                }
                Ok(Some(Frame::KeepaliveResponse)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "Error decoding message from {}: {:?}",
                        self.inner.remote_addr, e
                    );
                    core.recv_buf_mut().clear();
                    break;
                }
            }
        }
        drop(core);
        if keepalive {
            self.kick();
        }
        Step::none()
    }

    /// Write queued messages through the TLS stream; short writes advance
    /// the head offset and continue.
    async fn flush(&self) -> Step {
        let mut step = Step::none();
        loop {
            let chunk = self.inner.core.lock().unwrap().sendable_chunk_bytes();
            let Some(chunk) = chunk else {
                return step;
            };
            let mut guard = self.inner.write_half.lock().await;
            let Some(write_half) = guard.as_mut() else {
                return step;
            };
            match write_half.write(&chunk).await {
                Ok(0) => {
                    merge(
                        &mut step,
                        self.inner.core.lock().unwrap().on_socket_failure(
                            crate::transport::conn_state::IoFailure::Hard(
                                "tls write returned zero".into(),
                            ),
                        ),
                    );
                    return step;
                }
                Ok(n) => {
                    merge(&mut step, self.inner.core.lock().unwrap().mark_sent(n));
                }
                Err(e) => {
                    merge(
                        &mut step,
                        self.inner
                            .core
                            .lock()
                            .unwrap()
                            .on_socket_failure(classify_io_error(&e)),
                    );
                    return step;
                }
            }
        }
    }

    async fn apply_step(
        &self,
        step: Step,
        socket_gone: &mut bool,
        sender: &TransportSender,
        connection: &SipConnection,
    ) {
        for directive in step.directives {
            match directive {
                Directive::ShutdownWrite => {
                    let mut guard = self.inner.write_half.lock().await;
                    if let Some(write_half) = guard.as_mut() {
                        if let Err(e) = write_half.shutdown().await {
                            debug!("shutdown-write failed: {}", e);
                        }
                    }
                }
                Directive::ArmSafetyTimer(generation, duration) => {
                    let cmd_tx = self.inner.cmd_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        cmd_tx.send(ConnCommand::SafetyTimer(generation)).ok();
                    });
                }
                Directive::DropSocket => {
                    *socket_gone = true;
                    *self.inner.write_half.lock().await = None;
                }
                Directive::ParkForRecovery => {
                    match self.inner.oor_park.lock().unwrap().as_ref() {
                        Some(park) => park(),
                        None => warn!(
                            "connection {} parked with no recovery list attached",
                            self.inner.remote_addr
                        ),
                    }
                }
            }
        }
        for notice in step.notices {
            sender.send(notice_to_event(notice, connection)).ok();
        }
    }

    /// Client connector trusting the configured roots. An empty root store
    /// is legal; every handshake against it will fail verification, which
    /// surfaces as a connect failure on the dialing path.
    fn create_connector(config: &TlsConfig) -> Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        if let Some(ca_pem) = config.ca_certs.as_deref() {
            for cert in read_cert_pem(ca_pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Error(format!("unusable trust root: {}", e)))?;
            }
        }
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(client_config)))
    }

    /// Acceptor for a TLS listener; requires the configured certificate
    /// chain and private key.
    pub fn create_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
        let cert_pem = config
            .cert
            .as_deref()
            .ok_or_else(|| Error::IllegalState("tls listener without a certificate".into()))?;
        let key_pem = config
            .key
            .as_deref()
            .ok_or_else(|| Error::IllegalState("tls listener without a private key".into()))?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(read_cert_pem(cert_pem)?, read_key_pem(key_pem)?)
            .map_err(|e| Error::Error(format!("tls server config rejected: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

fn read_cert_pem(pem: &[u8]) -> Result<Vec<pki_types::CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
        .map_err(|e| Error::Error(format!("bad certificate pem: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Error("no certificate in pem".into()));
    }
    Ok(certs)
}

/// First usable private key in the pem, PKCS#8 preferred over PKCS#1.
fn read_key_pem(pem: &[u8]) -> Result<pki_types::PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader).next() {
        let key = key.map_err(|e| Error::Error(format!("bad pkcs8 key pem: {}", e)))?;
        return Ok(pki_types::PrivateKeyDer::Pkcs8(key));
    }
    let mut reader = std::io::BufReader::new(pem);
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader).next() {
        let key = key.map_err(|e| Error::Error(format!("bad rsa key pem: {}", e)))?;
        return Ok(pki_types::PrivateKeyDer::Pkcs1(key));
    }
    Err(Error::Error("no usable private key in pem".into()))
}

fn framer_decode(buf: &mut bytes::BytesMut) -> Result<Option<Frame>> {
    let mut framer = StreamFramer::new();
    framer.decode(buf)
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.inner.local_addr, self.inner.remote_addr
        )
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
