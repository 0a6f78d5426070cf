use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use rsip::transport::Transport;
use std::{collections::VecDeque, fmt, time::Duration};
use tracing::debug;

/// How long a locally closed connection waits for the peer's close before
/// the close event is synthesized.
pub const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP-level lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    /// Server side only: the socket was accepted but the owner has not
    /// confirmed the new connection yet.
    Accepting,
    Connected,
    Closing,
    Closed,
    Terminated,
}

/// TLS sub-state, tracked beside the TCP state for TLS connections only. A
/// TLS connection can be TCP-connected while its handshake is still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    HandshakeReady,
    HandshakeInProgress,
    HandshakeCompleted,
    HandshakeFailed,
    Connected,
    CloseSequenceStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Client,
    Server,
    Listening,
}

/// Classified outcome of a raw socket operation. The state machine depends
/// on the driver telling these three failure classes apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoFailure {
    WouldBlock,
    OutOfResources,
    Hard(String),
}

/// One queued outbound message and how much of it went out already.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub id: u64,
    pub buf: Bytes,
    pub sent: usize,
}

/// Owner notification. Delivered by the driver only after the state that
/// caused it is committed, and at most once per logical event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    MessageSent(u64),
    ConnectFailed(String),
    Error(String),
    Closed,
}

/// Side effect the driver must carry out after a transition committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Half-close the write side and best-effort drain whatever the peer is
    /// still sending.
    ShutdownWrite,
    /// Arm the bounded close-safety timer; the generation comes back with
    /// the fire event so stale timers can be ignored.
    ArmSafetyTimer(u64, Duration),
    /// Release the socket handle. The connection object stays alive.
    DropSocket,
    /// Put the connection on the process-wide recovery list. Event delivery
    /// stays off until the recovery sweep re-kicks it.
    ParkForRecovery,
}

/// What one transition produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    pub notices: Vec<Notice>,
    pub directives: Vec<Directive>,
}

impl Step {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Readiness interest the driver should keep registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// The lifecycle state machine of one stream connection.
///
/// All socket I/O lives in the driver; this type owns the state, the
/// outbound queue with per-message sent offsets, the partial-read buffer,
/// the usage counter and the safety-timer generation. Every input commits
/// the state first and then reports the notices and directives the driver
/// has to act on, so owner callbacks never observe a half-applied
/// transition.
pub struct ConnectionCore {
    kind: ConnKind,
    transport: Transport,
    state: ConnState,
    tls_state: Option<TlsState>,
    send_queue: VecDeque<PendingSend>,
    recv_buf: BytesMut,
    has_socket: bool,
    closed_by_local: bool,
    marked_deleted: bool,
    parked: bool,
    usage: usize,
    safety_generation: u64,
    safety_armed: bool,
    graceful_timeout: Duration,
    next_send_id: u64,
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("kind", &self.kind)
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("tls_state", &self.tls_state)
            .field("queued", &self.send_queue.len())
            .field("usage", &self.usage)
            .finish()
    }
}

impl ConnectionCore {
    pub fn new(kind: ConnKind, transport: Transport) -> Self {
        Self {
            kind,
            transport,
            state: ConnState::Idle,
            tls_state: None,
            send_queue: VecDeque::new(),
            recv_buf: BytesMut::new(),
            has_socket: false,
            closed_by_local: false,
            marked_deleted: false,
            parked: false,
            usage: 0,
            safety_generation: 0,
            safety_armed: false,
            graceful_timeout: GRACEFUL_CLOSE_TIMEOUT,
            next_send_id: 1,
        }
    }

    pub fn set_graceful_timeout(&mut self, timeout: Duration) {
        self.graceful_timeout = timeout;
    }

    pub fn new_client(transport: Transport) -> Self {
        Self::new(ConnKind::Client, transport)
    }

    pub fn new_server(transport: Transport) -> Self {
        Self::new(ConnKind::Server, transport)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn tls_state(&self) -> Option<TlsState> {
        self.tls_state
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn closed_by_local(&self) -> bool {
        self.closed_by_local
    }

    pub fn queued(&self) -> usize {
        self.send_queue.len()
    }

    /// The readiness events this connection currently wants.
    pub fn interest(&self) -> Interest {
        if self.parked || !self.has_socket {
            return Interest::default();
        }
        match self.state {
            ConnState::Connecting => Interest {
                read: false,
                write: true,
            },
            ConnState::Connected => Interest {
                read: true,
                write: self.can_send() && !self.send_queue.is_empty(),
            },
            // keep draining whatever the peer still sends
            ConnState::Closing => Interest {
                read: true,
                write: false,
            },
            _ => Interest::default(),
        }
    }

    fn can_send(&self) -> bool {
        if self.marked_deleted || self.state != ConnState::Connected {
            return false;
        }
        match self.transport {
            Transport::Tls => self.tls_state == Some(TlsState::Connected),
            _ => true,
        }
    }

    /// Count one more in-flight operation referencing this connection.
    /// Termination is deferred while the counter is non-zero.
    pub fn acquire(&mut self) {
        self.usage += 1;
    }

    /// Drop one reference; the last one over a deleted connection finalizes
    /// the termination.
    pub fn release(&mut self) -> Step {
        debug_assert!(self.usage > 0);
        self.usage = self.usage.saturating_sub(1);
        let mut step = Step::none();
        self.try_finalize(&mut step);
        step
    }

    /// Move to `Terminated` and emit the single `Closed` notice, once all
    /// preconditions hold: deleted, no in-flight references, coming from a
    /// closing state.
    fn try_finalize(&mut self, step: &mut Step) {
        if self.state == ConnState::Terminated {
            return;
        }
        if !self.marked_deleted || self.usage != 0 {
            return;
        }
        if !matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return;
        }
        debug!("connection terminated ({:?})", self.kind);
        self.state = ConnState::Terminated;
        step.notices.push(Notice::Closed);
    }

    fn drop_socket(&mut self, step: &mut Step) {
        if self.has_socket {
            self.has_socket = false;
            step.directives.push(Directive::DropSocket);
        }
    }

    fn cancel_safety_timer(&mut self) {
        if self.safety_armed {
            self.safety_armed = false;
        }
        // a fire already in flight compares against a newer generation
        self.safety_generation += 1;
    }

    /// Client side: construct the socket and issue the non-blocking connect.
    pub fn open_client(&mut self) -> Result<Step> {
        if self.state != ConnState::Idle {
            return Err(Error::IllegalState(format!(
                "open on {:?} connection",
                self.state
            )));
        }
        if self.kind != ConnKind::Client {
            return Err(Error::IllegalState("open on non-client connection".into()));
        }
        self.state = ConnState::Connecting;
        self.has_socket = true;
        Ok(Step::none())
    }

    /// Server side: an accepted socket exists but the owner has not
    /// confirmed it yet. No read/close registration happens before the
    /// decision.
    pub fn start_accept(&mut self) -> Result<Step> {
        if self.state != ConnState::Idle || self.kind != ConnKind::Server {
            return Err(Error::IllegalState(format!(
                "accept on {:?} {:?} connection",
                self.kind, self.state
            )));
        }
        self.state = ConnState::Accepting;
        self.has_socket = true;
        Ok(Step::none())
    }

    /// The owner confirmed or rejected an accepted connection.
    pub fn on_accept_decision(&mut self, accepted: bool) -> Result<Step> {
        if self.state != ConnState::Accepting {
            return Err(Error::IllegalState(format!(
                "accept decision on {:?} connection",
                self.state
            )));
        }
        if accepted {
            self.state = ConnState::Connected;
            if self.transport == Transport::Tls {
                self.tls_state = Some(TlsState::HandshakeReady);
            }
            return Ok(Step::none());
        }
        debug!("accepted connection rejected by owner, closing");
        let mut step = Step::none();
        self.state = ConnState::Closing;
        self.marked_deleted = true;
        self.drop_socket(&mut step);
        self.try_finalize(&mut step);
        Ok(step)
    }

    /// Completion of the non-blocking connect, successful or not.
    pub fn on_connect_event(&mut self, error: bool) -> Result<Step> {
        if self.state != ConnState::Connecting {
            return Err(Error::IllegalState(format!(
                "connect event on {:?} connection",
                self.state
            )));
        }
        let mut step = Step::none();
        if error {
            // owners hear about the failure before any teardown
            step.notices.push(Notice::ConnectFailed(
                "connect completion returned error".into(),
            ));
            self.state = ConnState::Closing;
            self.marked_deleted = true;
            self.drop_socket(&mut step);
            self.try_finalize(&mut step);
            return Ok(step);
        }
        self.state = ConnState::Connected;
        if self.transport == Transport::Tls {
            // TCP is up; sending stays blocked until the handshake is driven
            self.tls_state = Some(TlsState::HandshakeReady);
        }
        Ok(step)
    }

    pub fn tls_handshake_started(&mut self) -> Result<Step> {
        match self.tls_state {
            Some(TlsState::HandshakeReady) => {
                self.tls_state = Some(TlsState::HandshakeInProgress);
                Ok(Step::none())
            }
            other => Err(Error::IllegalState(format!(
                "handshake start in tls state {:?}",
                other
            ))),
        }
    }

    pub fn on_tls_handshake_done(&mut self, ok: bool) -> Result<Step> {
        match self.tls_state {
            Some(TlsState::HandshakeInProgress) => {}
            other => {
                return Err(Error::IllegalState(format!(
                    "handshake completion in tls state {:?}",
                    other
                )))
            }
        }
        let mut step = Step::none();
        if ok {
            // Completed is transient; the axis settles on Connected at once
            self.tls_state = Some(TlsState::Connected);
            return Ok(step);
        }
        self.tls_state = Some(TlsState::HandshakeFailed);
        step.notices
            .push(Notice::Error("tls handshake failed".into()));
        self.state = ConnState::Closing;
        self.marked_deleted = true;
        self.drop_socket(&mut step);
        self.try_finalize(&mut step);
        Ok(step)
    }

    /// Queue a message for sending. Sending happens from the driver's write
    /// readiness via [`sendable_chunk`]/[`mark_sent`].
    ///
    /// [`sendable_chunk`]: ConnectionCore::sendable_chunk
    /// [`mark_sent`]: ConnectionCore::mark_sent
    pub fn enqueue(&mut self, buf: Bytes) -> Result<u64> {
        match self.state {
            ConnState::Connecting | ConnState::Accepting | ConnState::Connected => {}
            other => {
                return Err(Error::IllegalState(format!(
                    "send on {:?} connection",
                    other
                )))
            }
        }
        if self.marked_deleted {
            return Err(Error::IllegalState("send on deleted connection".into()));
        }
        let id = self.next_send_id;
        self.next_send_id += 1;
        self.send_queue.push_back(PendingSend { id, buf, sent: 0 });
        Ok(id)
    }

    /// The not-yet-sent remainder of the head message, if sending is
    /// currently allowed.
    pub fn sendable_chunk(&self) -> Option<&[u8]> {
        if !self.can_send() {
            return None;
        }
        self.send_queue.front().map(|msg| &msg.buf[msg.sent..])
    }

    /// Like [`sendable_chunk`] but returns an owned, cheaply cloned slice of
    /// the head buffer, for drivers that cannot write under the state lock.
    ///
    /// [`sendable_chunk`]: ConnectionCore::sendable_chunk
    pub fn sendable_chunk_bytes(&self) -> Option<Bytes> {
        if !self.can_send() {
            return None;
        }
        self.send_queue
            .front()
            .map(|msg| msg.buf.slice(msg.sent..))
    }

    /// Account `n` bytes written to the socket. The head entry is removed,
    /// and its owner notified, only once the whole buffer went out.
    pub fn mark_sent(&mut self, n: usize) -> Step {
        let mut step = Step::none();
        if let Some(msg) = self.send_queue.front_mut() {
            msg.sent += n;
            debug_assert!(msg.sent <= msg.buf.len());
            if msg.sent >= msg.buf.len() {
                let done = self.send_queue.pop_front().expect("head entry");
                debug!("message {} fully sent ({} bytes)", done.id, done.buf.len());
                step.notices.push(Notice::MessageSent(done.id));
            }
        }
        step
    }

    /// A socket read or write failed. `WouldBlock` keeps everything queued
    /// for the next readiness event; resource exhaustion parks the
    /// connection; a hard failure disconnects it.
    pub fn on_socket_failure(&mut self, failure: IoFailure) -> Step {
        match failure {
            IoFailure::WouldBlock => Step::none(),
            IoFailure::OutOfResources => self.on_resource_exhausted(false),
            IoFailure::Hard(reason) => {
                let mut step = Step::none();
                step.notices.push(Notice::Error(reason));
                self.state = ConnState::Closing;
                self.marked_deleted = true;
                self.cancel_safety_timer();
                self.drop_socket(&mut step);
                self.try_finalize(&mut step);
                step
            }
        }
    }

    /// Bytes arrived from the socket. Partial messages stay buffered across
    /// wakeups; the driver runs the boundary detector over this buffer.
    pub fn on_received(&mut self, data: &[u8]) {
        self.recv_buf.extend_from_slice(data);
    }

    pub fn recv_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.recv_buf
    }

    /// Local close request.
    ///
    /// An established connection is shut down gracefully: deregistered as a
    /// lookup target by the caller, half-closed, and guarded by the bounded
    /// safety timer. A connection that never fully opened terminates
    /// immediately.
    pub fn close(&mut self) -> Result<Step> {
        let mut step = Step::none();
        match self.state {
            ConnState::Terminated => return Ok(step),
            ConnState::Closing | ConnState::Closed => {
                self.try_finalize(&mut step);
                return Ok(step);
            }
            ConnState::Connected if self.has_socket => {
                debug!("local close: shutting down gracefully");
                self.closed_by_local = true;
                self.state = ConnState::Closing;
                if self.transport == Transport::Tls {
                    self.tls_state = Some(TlsState::CloseSequenceStarted);
                }
                self.safety_generation += 1;
                self.safety_armed = true;
                step.directives.push(Directive::ShutdownWrite);
                step.directives.push(Directive::ArmSafetyTimer(
                    self.safety_generation,
                    self.graceful_timeout,
                ));
                Ok(step)
            }
            _ => {
                // no socket worth a graceful shutdown yet
                debug!("local close before fully open, terminating");
                self.closed_by_local = true;
                self.marked_deleted = true;
                self.drop_socket(&mut step);
                if self.usage == 0 {
                    self.state = ConnState::Terminated;
                    step.notices.push(Notice::Closed);
                } else {
                    self.state = ConnState::Closing;
                }
                Ok(step)
            }
        }
    }

    /// The peer closed the connection (read returned zero / close event).
    pub fn on_peer_closed(&mut self) -> Step {
        let mut step = Step::none();
        match self.state {
            ConnState::Closing => {
                // the close we were waiting for
                self.cancel_safety_timer();
                self.state = ConnState::Closed;
                self.marked_deleted = true;
                self.drop_socket(&mut step);
                self.try_finalize(&mut step);
            }
            ConnState::Connected | ConnState::Accepting => {
                debug!("connection closed by peer");
                self.state = ConnState::Closed;
                self.marked_deleted = true;
                self.cancel_safety_timer();
                self.drop_socket(&mut step);
                self.try_finalize(&mut step);
            }
            ConnState::Connecting => {
                step.notices
                    .push(Notice::Error("peer closed while connecting".into()));
                self.state = ConnState::Closing;
                self.marked_deleted = true;
                self.drop_socket(&mut step);
                self.try_finalize(&mut step);
            }
            _ => {}
        }
        step
    }

    /// The safety timer fired. A stale generation means the timer was
    /// cancelled or re-armed after this fire was scheduled; it must be
    /// ignored rather than double-processing the close.
    pub fn on_safety_timer(&mut self, generation: u64) -> Step {
        if !self.safety_armed || generation != self.safety_generation {
            debug!("safety timer fired but was already released, ignoring");
            return Step::none();
        }
        self.safety_armed = false;
        if self.state != ConnState::Closing {
            return Step::none();
        }
        debug!("safety timer expired, simulating close event");
        self.on_peer_closed()
    }

    /// A socket operation failed for lack of local resources. The
    /// connection is not torn down: event interest is cleared (or, if the
    /// peer is already gone, the socket handle dropped) and the driver is
    /// told to put it on the recovery list.
    pub fn on_resource_exhausted(&mut self, peer_closed: bool) -> Step {
        let mut step = Step::none();
        debug!("out of resources, parking connection for recovery");
        self.parked = true;
        if peer_closed {
            self.drop_socket(&mut step);
        }
        step.directives.push(Directive::ParkForRecovery);
        step
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// Resources freed up again; resume event delivery.
    pub fn retry_after_oor(&mut self) -> Step {
        self.parked = false;
        Step::none()
    }
}
