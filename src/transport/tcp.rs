use crate::{
    transport::{
        conn_state::{ConnState, ConnectionCore, Directive, IoFailure, Notice, Step},
        connection::{TransportEvent, TransportSender},
        framing::{Frame, StreamFramer, KEEPALIVE_RESPONSE},
        sip_addr::SipAddr,
        SipConnection,
    },
    Error, Result,
};
use bytes::Bytes;
use rsip::transport::Transport;
use std::{fmt, io, sync::Arc, sync::Mutex};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};

/// Commands delivered to a connection's serve loop from other tasks.
#[derive(Debug)]
pub(super) enum ConnCommand {
    /// Something was queued or state changed; re-evaluate interest.
    Kick,
    Close,
    SafetyTimer(u64),
    RetryOor,
}

/// Installed by the registry; called when the connection parks itself after
/// resource exhaustion so it lands on the recovery list.
pub(super) type OorParkHook = Box<dyn Fn() + Send + Sync>;

pub(super) struct TcpInner {
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub(super) core: Mutex<ConnectionCore>,
    stream: Mutex<Option<TcpStream>>,
    cmd_tx: UnboundedSender<ConnCommand>,
    cmd_rx: Mutex<Option<UnboundedReceiver<ConnCommand>>>,
    sender: Mutex<Option<TransportSender>>,
    oor_park: Mutex<Option<OorParkHook>>,
}

#[derive(Clone)]
pub struct TcpConnection {
    pub(super) inner: Arc<TcpInner>,
}

/// Map an I/O error onto the three failure classes the state machine keeps
/// apart. Allocation-style failures are recoverable and must not tear the
/// connection down.
pub(super) fn classify_io_error(e: &io::Error) -> IoFailure {
    match e.kind() {
        io::ErrorKind::WouldBlock => IoFailure::WouldBlock,
        io::ErrorKind::OutOfMemory => IoFailure::OutOfResources,
        _ => IoFailure::Hard(e.to_string()),
    }
}

impl TcpConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let socket_addr = remote.get_socketaddr()?;
        let mut core = ConnectionCore::new_client(Transport::Tcp);
        core.open_client()?;

        let stream = match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                core.on_connect_event(false)?;
                stream
            }
            Err(e) => {
                // notices are dropped here; the caller reports the failure
                let _ = core.on_connect_event(true);
                return Err(Error::ConnectFailed(format!("{}: {}", socket_addr, e)));
            }
        };

        let local_addr = SipAddr {
            r#type: Some(Transport::Tcp),
            addr: stream.local_addr()?.into(),
        };

        let connection = Self::from_parts(core, stream, local_addr, remote.clone());
        info!(
            "Created TCP client connection: {} -> {}",
            connection.get_addr(),
            remote
        );
        Ok(connection)
    }

    /// Wrap an accepted socket. The connection stays in the accepting state,
    /// unregistered for events, until [`accept_confirmed`] is called.
    ///
    /// [`accept_confirmed`]: TcpConnection::accept_confirmed
    pub fn from_stream(stream: TcpStream, local_addr: SipAddr) -> Result<Self> {
        let remote_addr = SipAddr {
            r#type: Some(Transport::Tcp),
            addr: stream.peer_addr()?.into(),
        };
        let mut core = ConnectionCore::new_server(Transport::Tcp);
        core.start_accept()?;

        let connection = Self::from_parts(core, stream, local_addr, remote_addr.clone());
        info!(
            "Created TCP server connection: {} <- {}",
            connection.get_addr(),
            remote_addr
        );
        Ok(connection)
    }

    fn from_parts(
        core: ConnectionCore,
        stream: TcpStream,
        local_addr: SipAddr,
        remote_addr: SipAddr,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        TcpConnection {
            inner: Arc::new(TcpInner {
                local_addr,
                remote_addr,
                core: Mutex::new(core),
                stream: Mutex::new(Some(stream)),
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

    /// The owner's accept/reject decision for an accepted connection.
    pub fn accept_confirmed(&self, accepted: bool) -> Result<()> {
        let step = self
            .inner
            .core
            .lock()
            .unwrap()
            .on_accept_decision(accepted)?;
        self.emit_notices(step.notices);
        self.kick();
        Ok(())
    }

    /// Queue raw bytes for sending. Actual writing happens on the serve
    /// loop's write readiness; the returned id comes back in a
    /// `MessageSent` event once the last byte went out.
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

    /// Count an in-flight reference; termination is deferred until release.
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
            let connection = SipConnection::Tcp(self.clone());
            for notice in notices {
                sender.send(notice_to_event(notice, &connection)).ok();
            }
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut stream = match self.inner.stream.lock().unwrap().take() {
            Some(stream) => Some(stream),
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

        let connection = SipConnection::Tcp(self.clone());
        let mut framer = StreamFramer::new();
        let mut read_buf = vec![0u8; 4096];

        loop {
            let interest = self.inner.core.lock().unwrap().interest();
            let has_socket = stream.is_some();
            let step = tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ConnCommand::Close) => {
                            self.inner.core.lock().unwrap().close()?
                        }
                        Some(ConnCommand::Kick) => Step::none(),
                        Some(ConnCommand::SafetyTimer(generation)) => {
                            self.inner.core.lock().unwrap().on_safety_timer(generation)
                        }
                        Some(ConnCommand::RetryOor) => {
                            self.inner.core.lock().unwrap().retry_after_oor()
                        }
                    }
                }
                ready = ready_on(&mut stream, interest), if !interest.is_empty() && has_socket => {
                    match ready {
                        Ok(ready) => {
                            let mut step = Step::none();
                            if ready.is_readable() {
                                merge(&mut step, self.drain_readable(
                                    &mut stream, &mut framer, &mut read_buf,
                                    &sender, &connection,
                                ));
                            }
                            if ready.is_writable() {
                                merge(&mut step, self.flush_writable(&mut stream));
                            }
                            step
                        }
                        Err(e) => self
                            .inner
                            .core
                            .lock()
                            .unwrap()
                            .on_socket_failure(classify_io_error(&e)),
                    }
                }
            };

            self.apply_step(step, &mut stream, &sender, &connection).await;

            if self.inner.core.lock().unwrap().state() == ConnState::Terminated {
                debug!("serve loop finished: {}", self.inner.remote_addr);
                return Ok(());
            }
        }
    }

    /// Read until the socket would block. In the closing state arriving
    /// bytes are drained and discarded; otherwise they feed the boundary
    /// detector and complete frames go out as events.
    fn drain_readable(
        &self,
        stream: &mut Option<TcpStream>,
        framer: &mut StreamFramer,
        read_buf: &mut [u8],
        sender: &TransportSender,
        connection: &SipConnection,
    ) -> Step {
        let mut step = Step::none();
        loop {
            let Some(socket) = stream.as_ref() else {
                return step;
            };
            match socket.try_read(read_buf) {
                Ok(0) => {
                    info!("Connection closed by peer: {}", self.inner.remote_addr);
                    merge(&mut step, self.inner.core.lock().unwrap().on_peer_closed());
                    return step;
                }
                Ok(n) => {
                    let mut core = self.inner.core.lock().unwrap();
                    if core.state() == ConnState::Closing {
                        // leftovers after shutdown, discarded
                        continue;
                    }
                    core.on_received(&read_buf[..n]);
                    loop {
                        match framer.decode(core.recv_buf_mut()) {
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
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return step,
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

    /// Write queued messages until done or the socket pushes back. Partial
    /// writes leave the remainder queued with its offset advanced.
    fn flush_writable(&self, stream: &mut Option<TcpStream>) -> Step {
        let mut step = Step::none();
        loop {
            let Some(socket) = stream.as_ref() else {
                return step;
            };
            let mut core = self.inner.core.lock().unwrap();
            let Some(chunk) = core.sendable_chunk() else {
                return step;
            };
            let wanted = chunk.len();
            match socket.try_write(chunk) {
                Ok(n) => {
                    merge(&mut step, core.mark_sent(n));
                    if n < wanted {
                        // partial write; wait for the next write event
                        return step;
                    }
                }
                Err(e) => {
                    merge(&mut step, core.on_socket_failure(classify_io_error(&e)));
                    return step;
                }
            }
        }
    }

    async fn apply_step(
        &self,
        step: Step,
        stream: &mut Option<TcpStream>,
        sender: &TransportSender,
        connection: &SipConnection,
    ) {
        for directive in step.directives {
            match directive {
                Directive::ShutdownWrite => {
                    if let Some(socket) = stream.as_mut() {
                        if let Err(e) = socket.shutdown().await {
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
                    *stream = None;
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
}

pub(super) fn merge(acc: &mut Step, step: Step) {
    acc.notices.extend(step.notices);
    acc.directives.extend(step.directives);
}

pub(super) fn notice_to_event(notice: Notice, connection: &SipConnection) -> TransportEvent {
    let remote = connection.remote_addr().clone();
    match notice {
        Notice::MessageSent(id) => TransportEvent::MessageSent { id, remote },
        Notice::ConnectFailed(reason) => TransportEvent::ConnectFailed { remote, reason },
        Notice::Error(reason) => TransportEvent::Error { remote, reason },
        Notice::Closed => TransportEvent::Closed(connection.clone()),
    }
}

async fn ready_on(
    stream: &mut Option<TcpStream>,
    interest: crate::transport::conn_state::Interest,
) -> io::Result<tokio::io::Ready> {
    let socket = stream
        .as_ref()
        .expect("ready_on called without socket");
    let mut tokio_interest = None;
    if interest.read {
        tokio_interest = Some(tokio::io::Interest::READABLE);
    }
    if interest.write {
        tokio_interest = Some(match tokio_interest {
            Some(i) => i | tokio::io::Interest::WRITABLE,
            None => tokio::io::Interest::WRITABLE,
        });
    }
    socket
        .ready(tokio_interest.expect("ready_on called without interest"))
        .await
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.inner.local_addr, self.inner.remote_addr
        )
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
