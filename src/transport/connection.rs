use super::{tcp::TcpConnection, tls::TlsConnection, SipAddr};
use crate::Result;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Everything a connection reports to its owners. Each logical event is
/// delivered at most once.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A complete inbound message frame.
    Incoming(Bytes, SipConnection, SipAddr),
    /// A new (accepted) connection joined the registry.
    New(SipConnection),
    /// The queued message with this id was fully written out.
    MessageSent { id: u64, remote: SipAddr },
    /// The non-blocking connect completed with an error.
    ConnectFailed { remote: SipAddr, reason: String },
    /// A hard socket failure; the connection is being torn down.
    Error { remote: SipAddr, reason: String },
    /// The connection is fully gone.
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

#[derive(Clone)]
pub enum SipConnection {
    Tcp(TcpConnection),
    Tls(TlsConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        true
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, SipConnection::Tls(_))
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Tcp(transport) => transport.get_addr(),
            SipConnection::Tls(transport) => transport.get_addr(),
        }
    }

    pub fn remote_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Tcp(transport) => transport.remote_addr(),
            SipConnection::Tls(transport) => transport.remote_addr(),
        }
    }

    /// Queue raw bytes; returns the message id reported back via
    /// [`TransportEvent::MessageSent`].
    pub async fn send_raw(&self, data: Bytes) -> Result<u64> {
        match self {
            SipConnection::Tcp(transport) => transport.send_raw(data).await,
            SipConnection::Tls(transport) => transport.send_raw(data).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.serve_loop(sender).await,
            SipConnection::Tls(transport) => transport.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.close().await,
            SipConnection::Tls(transport) => transport.close().await,
        }
    }

    /// Resume a connection parked after resource exhaustion.
    pub fn retry_after_oor(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.retry_after_oor(),
            SipConnection::Tls(transport) => transport.retry_after_oor(),
        }
    }

    /// Install the recovery-list hook the connection invokes when it parks
    /// itself after resource exhaustion.
    pub(super) fn set_oor_park(&self, hook: super::tcp::OorParkHook) {
        match self {
            SipConnection::Tcp(transport) => transport.set_oor_park(hook),
            SipConnection::Tls(transport) => transport.set_oor_park(hook),
        }
    }

    pub fn set_graceful_timeout(&self, timeout: std::time::Duration) {
        match self {
            SipConnection::Tcp(transport) => transport.set_graceful_timeout(timeout),
            SipConnection::Tls(transport) => transport.set_graceful_timeout(timeout),
        }
    }

    /// Count an in-flight reference to this connection; termination is
    /// deferred until the matching [`release`].
    ///
    /// [`release`]: SipConnection::release
    pub fn acquire(&self) {
        match self {
            SipConnection::Tcp(transport) => transport.acquire(),
            SipConnection::Tls(transport) => transport.acquire(),
        }
    }

    pub fn release(&self) {
        match self {
            SipConnection::Tcp(transport) => transport.release(),
            SipConnection::Tls(transport) => transport.release(),
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Tcp(t) => write!(f, "TCP {}", t),
            SipConnection::Tls(t) => write!(f, "TLS {}", t),
        }
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TlsConnection> for SipConnection {
    fn from(connection: TlsConnection) -> Self {
        SipConnection::Tls(connection)
    }
}
