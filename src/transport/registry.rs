use super::{
    connection::{TransportEvent, TransportSender},
    dns::ResolutionPolicy,
    sip_addr::SipAddr,
    tcp::TcpConnection,
    tls::{TlsConfig, TlsConnection},
    SipConnection,
};
use crate::{Error, Result};
use rsip::transport::Transport;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transport-layer wide configuration.
#[derive(Clone)]
pub struct TransportConfig {
    /// Cap per resolution-list tier, bounding hostile DNS responses.
    pub max_dns_elements: usize,
    /// How long a locally closed connection waits for the peer's close.
    pub graceful_close_timeout: Duration,
    /// Transports local addresses are configured for.
    pub supported_transports: Vec<Transport>,
    /// Accept only TLS resolution results.
    pub secure_only: bool,
    pub tls: TlsConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_dns_elements: 16,
            graceful_close_timeout: Duration::from_secs(5),
            supported_transports: vec![Transport::Tcp, Transport::Tls],
            secure_only: false,
            tls: TlsConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn resolution_policy(&self) -> ResolutionPolicy {
        ResolutionPolicy {
            max_elements: self.max_dns_elements,
            supported: self.supported_transports.clone(),
            secure_only: self.secure_only,
        }
    }
}

/// Accept or reject an inbound connection before it is registered for any
/// read/close events.
pub trait AcceptPolicy: Send + Sync {
    fn accept(&self, remote: &SipAddr) -> bool;
}

pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
    fn accept(&self, _remote: &SipAddr) -> bool {
        true
    }
}

/// Registry key: one connection per remote address and transport. The local
/// binding is OS-chosen for dialed sockets and the listener address for
/// accepted ones, so it carries no discriminating power here; per-local-
/// address connection sets are not supported.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub remote: SocketAddr,
    pub transport: Transport,
}

impl ConnKey {
    pub fn from_remote(remote: &SipAddr) -> Result<Self> {
        Ok(ConnKey {
            remote: remote.get_socketaddr()?,
            transport: remote.r#type.unwrap_or(Transport::Tcp),
        })
    }
}

struct ConnectionRegistryInner {
    cancel_token: CancellationToken,
    config: TransportConfig,
    sender: TransportSender,
    accept_policy: Box<dyn AcceptPolicy>,
    connections: Mutex<HashMap<ConnKey, SipConnection>>,
    // connections parked after resource exhaustion, waiting for recovery
    oor: Mutex<Vec<ConnKey>>,
}

/// Keyed ownership of all live connections.
///
/// The map lock is held for insert/lookup/remove only, never across socket
/// I/O. Each connection's serve loop runs on its own task under a child
/// cancellation token.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<ConnectionRegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(cancel_token: CancellationToken, sender: TransportSender) -> Self {
        Self::with_config(cancel_token, sender, TransportConfig::default())
    }

    pub fn with_config(
        cancel_token: CancellationToken,
        sender: TransportSender,
        config: TransportConfig,
    ) -> Self {
        Self::with_accept_policy(cancel_token, sender, config, Box::new(AcceptAll))
    }

    pub fn with_accept_policy(
        cancel_token: CancellationToken,
        sender: TransportSender,
        config: TransportConfig,
        accept_policy: Box<dyn AcceptPolicy>,
    ) -> Self {
        let inner = ConnectionRegistryInner {
            cancel_token,
            config,
            sender,
            accept_policy,
            connections: Mutex::new(HashMap::new()),
            oor: Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn add_connection(&self, key: ConnKey, connection: SipConnection) {
        self.inner
            .connections
            .lock()
            .unwrap()
            .insert(key, connection);
    }

    /// Remove a connection as a lookup target. No new owners may attach
    /// after this; the connection object itself lives until terminated.
    pub fn del_connection(&self, key: &ConnKey) {
        self.inner.connections.lock().unwrap().remove(key);
    }

    pub fn lookup(&self, key: &ConnKey) -> Option<SipConnection> {
        self.inner.connections.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the connection for a resolved candidate, dialing a new one if
    /// none exists yet.
    pub async fn get_or_create(&self, remote: &SipAddr) -> Result<SipConnection> {
        let key = ConnKey::from_remote(remote)?;
        if let Some(connection) = self.lookup(&key) {
            debug!("reusing connection for {}", remote);
            return Ok(connection);
        }

        info!("dialing {} over {:?}", remote, key.transport);
        let connection: SipConnection = match key.transport {
            Transport::Tcp => TcpConnection::connect(remote).await?.into(),
            Transport::Tls => TlsConnection::connect(remote, &self.inner.config.tls)
                .await?
                .into(),
            other => {
                return Err(Error::Error(format!(
                    "unsupported transport type: {}",
                    other
                )))
            }
        };

        // a racing dial may have won; keep the registered one
        if let Some(existing) = self.lookup(&key) {
            connection.close().await.ok();
            return Ok(existing);
        }
        connection.set_graceful_timeout(self.inner.config.graceful_close_timeout);
        self.add_connection(key.clone(), connection.clone());
        self.serve_connection(key, connection.clone());
        // a fresh socket means resources are available again
        self.recover_oor();
        Ok(connection)
    }

    /// Run a connection's serve loop on its own task; on exit the
    /// connection stops being a lookup target.
    pub fn serve_connection(&self, key: ConnKey, connection: SipConnection) {
        let park_registry = self.clone();
        let park_key = key.clone();
        connection.set_oor_park(Box::new(move || park_registry.park_oor(park_key.clone())));

        let sub_token = self.inner.cancel_token.child_token();
        let sender = self.inner.sender.clone();
        let registry = self.clone();
        tokio::spawn(async move {
            select! {
                _ = sub_token.cancelled() => { }
                _ = connection.serve_loop(sender) => { }
            }
            registry.del_connection(&key);
            debug!("connection serve loop exited: {}", connection.remote_addr());
        });
    }

    /// Ask a connection to close; it is removed as a lookup target first so
    /// nothing new attaches during the graceful shutdown.
    pub async fn close_connection(&self, key: &ConnKey) -> Result<()> {
        let connection = {
            let mut connections = self.inner.connections.lock().unwrap();
            connections.remove(key)
        };
        match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    /// Park a connection that hit local resource exhaustion.
    pub fn park_oor(&self, key: ConnKey) {
        let mut oor = self.inner.oor.lock().unwrap();
        if !oor.contains(&key) {
            warn!("parking connection on OOR recovery list: {:?}", key.remote);
            oor.push(key);
        }
    }

    pub fn oor_count(&self) -> usize {
        self.inner.oor.lock().unwrap().len()
    }

    /// Resources freed up; re-kick every parked connection.
    pub fn recover_oor(&self) {
        let keys: Vec<ConnKey> = self.inner.oor.lock().unwrap().drain(..).collect();
        for key in keys {
            if let Some(connection) = self.lookup(&key) {
                info!("recovering parked connection: {:?}", key.remote);
                connection.retry_after_oor().ok();
            }
        }
    }

    /// Bind a TCP listener and serve inbound connections from it.
    pub async fn add_tcp_listener(&self, local: SocketAddr) -> Result<SipAddr> {
        let listener = TcpListener::bind(local).await?;
        let local_addr = SipAddr {
            r#type: Some(Transport::Tcp),
            addr: listener.local_addr()?.into(),
        };
        info!("Created TCP listener on {}", local_addr);

        let registry = self.clone();
        let listen_addr = local_addr.clone();
        let token = self.inner.cancel_token.child_token();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => { }
                _ = registry.serve_tcp_listener(listener, listen_addr) => { }
            }
        });
        Ok(local_addr)
    }

    async fn serve_tcp_listener(&self, listener: TcpListener, local_addr: SipAddr) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Error accepting TCP connection: {}", e);
                    continue;
                }
            };
            debug!("New TCP connection from {}", remote);
            let connection = match TcpConnection::from_stream(stream, local_addr.clone()) {
                Ok(connection) => connection,
                Err(e) => {
                    error!("Error wrapping accepted connection: {}", e);
                    continue;
                }
            };
            self.register_accepted(connection.into());
        }
    }

    /// Bind a TLS listener; the acceptor runs the handshake before the
    /// connection is offered for acceptance.
    pub async fn add_tls_listener(&self, local: SocketAddr) -> Result<SipAddr> {
        let acceptor = TlsConnection::create_acceptor(&self.inner.config.tls)?;
        let listener = TcpListener::bind(local).await?;
        let local_addr = SipAddr {
            r#type: Some(Transport::Tls),
            addr: listener.local_addr()?.into(),
        };
        info!("Created TLS listener on {}", local_addr);

        let registry = self.clone();
        let listen_addr = local_addr.clone();
        let token = self.inner.cancel_token.child_token();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => { }
                _ = registry.serve_tls_listener(listener, acceptor, listen_addr) => { }
            }
        });
        Ok(local_addr)
    }

    async fn serve_tls_listener(
        &self,
        listener: TcpListener,
        acceptor: tokio_rustls::TlsAcceptor,
        local_addr: SipAddr,
    ) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Error accepting TLS connection: {}", e);
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let registry = self.clone();
            let local_addr = local_addr.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        error!("TLS handshake failed: {}", e);
                        return;
                    }
                };
                let remote_addr = SipAddr {
                    r#type: Some(Transport::Tls),
                    addr: remote.into(),
                };
                let connection = match TlsConnection::from_server_stream(
                    tls_stream.into(),
                    local_addr,
                    remote_addr,
                ) {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("Error wrapping accepted TLS connection: {}", e);
                        return;
                    }
                };
                registry.register_accepted(connection.into());
            });
        }
    }

    /// Offer an accepted connection to the accept policy; only a confirmed
    /// connection is registered for events and joins the lookup map.
    fn register_accepted(&self, connection: SipConnection) {
        let remote = connection.remote_addr().clone();
        let accepted = self.inner.accept_policy.accept(&remote);
        let confirm = match &connection {
            SipConnection::Tcp(c) => c.accept_confirmed(accepted),
            SipConnection::Tls(c) => c.accept_confirmed(accepted),
        };
        if let Err(e) = confirm {
            error!("accept decision failed for {}: {}", remote, e);
            return;
        }
        if !accepted {
            info!("connection from {} rejected by accept policy", remote);
            return;
        }
        let key = match ConnKey::from_remote(&remote) {
            Ok(key) => key,
            Err(e) => {
                error!("accepted connection has no usable key: {}", e);
                return;
            }
        };
        connection.set_graceful_timeout(self.inner.config.graceful_close_timeout);
        self.inner
            .sender
            .send(TransportEvent::New(connection.clone()))
            .ok();
        self.add_connection(key.clone(), connection.clone());
        self.serve_connection(key, connection);
        // a successfully accepted socket means resources are available again
        self.recover_oor();
    }
}
