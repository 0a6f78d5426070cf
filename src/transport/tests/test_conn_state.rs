use crate::transport::conn_state::{
    ConnState, ConnectionCore, Directive, IoFailure, Notice, TlsState,
};
use crate::Error;
use bytes::Bytes;
use rsip::transport::Transport;

fn connected() -> ConnectionCore {
    let mut core = ConnectionCore::new_client(Transport::Tcp);
    core.open_client().expect("open");
    core.on_connect_event(false).expect("connect");
    core
}

fn count_closed(notices: &[Notice]) -> usize {
    notices.iter().filter(|n| **n == Notice::Closed).count()
}

#[test]
fn test_idle_reaches_only_connecting_or_terminated() {
    let mut core = ConnectionCore::new_client(Transport::Tcp);
    core.open_client().expect("open");
    assert_eq!(core.state(), ConnState::Connecting);

    let mut core = ConnectionCore::new_client(Transport::Tcp);
    let step = core.close().expect("close");
    assert_eq!(core.state(), ConnState::Terminated);
    assert_eq!(count_closed(&step.notices), 1);

    // nothing else is reachable in one step from idle
    let mut core = ConnectionCore::new_client(Transport::Tcp);
    assert!(matches!(
        core.enqueue(Bytes::from_static(b"x")),
        Err(Error::IllegalState(_))
    ));
    assert!(core.on_connect_event(false).is_err());
    core.on_peer_closed();
    assert_eq!(core.state(), ConnState::Idle);
}

#[test]
fn test_terminated_is_terminal() {
    let mut core = ConnectionCore::new_client(Transport::Tcp);
    core.close().expect("close");
    assert_eq!(core.state(), ConnState::Terminated);

    assert!(core.open_client().is_err());
    assert!(matches!(
        core.enqueue(Bytes::from_static(b"x")),
        Err(Error::IllegalState(_))
    ));
    let step = core.on_peer_closed();
    assert!(step.notices.is_empty());
    assert_eq!(core.state(), ConnState::Terminated);
    // repeated close requests on a terminated connection are harmless
    let step = core.close().expect("close");
    assert!(step.notices.is_empty());
}

#[test]
fn test_connect_error_notifies_once_and_releases_socket() {
    let mut core = ConnectionCore::new_client(Transport::Tcp);
    core.open_client().expect("open");

    let step = core.on_connect_event(true).expect("connect error");
    let connect_failures = step
        .notices
        .iter()
        .filter(|n| matches!(n, Notice::ConnectFailed(_)))
        .count();
    assert_eq!(connect_failures, 1);
    assert!(matches!(
        step.notices.first(),
        Some(Notice::ConnectFailed(_))
    ));
    assert!(step.directives.contains(&Directive::DropSocket));
    assert_eq!(core.state(), ConnState::Terminated);
}

#[test]
fn test_partial_write_resumption() {
    let mut core = connected();
    let id = core.enqueue(Bytes::from_static(b"0123456789")).expect("enqueue");

    assert_eq!(core.sendable_chunk().expect("chunk"), b"0123456789");
    let step = core.mark_sent(4);
    assert!(step.notices.is_empty(), "no notice before the last byte");
    assert_eq!(core.state(), ConnState::Connected);
    assert_eq!(core.sendable_chunk().expect("rest"), b"456789");
    assert!(core.interest().write, "unsent remainder keeps write interest");

    let step = core.mark_sent(6);
    assert_eq!(step.notices, vec![Notice::MessageSent(id)]);
    assert!(core.sendable_chunk().is_none());
    assert!(!core.interest().write, "drained queue drops write interest");
}

#[test]
fn test_queued_messages_sent_in_order() {
    let mut core = connected();
    core.enqueue(Bytes::from_static(b"aaaa")).expect("enqueue");
    let second = core.enqueue(Bytes::from_static(b"bb")).expect("enqueue");

    core.mark_sent(4);
    assert_eq!(core.sendable_chunk().expect("second message"), b"bb");
    let step = core.mark_sent(2);
    assert_eq!(step.notices, vec![Notice::MessageSent(second)]);
}

#[test]
fn test_safety_timer_and_real_close_handled_once() {
    // timer first, close event afterwards
    let mut core = connected();
    let step = core.close().expect("close");
    assert_eq!(core.state(), ConnState::Closing);
    let generation = step
        .directives
        .iter()
        .find_map(|d| match d {
            Directive::ArmSafetyTimer(generation, _) => Some(*generation),
            _ => None,
        })
        .expect("safety timer armed");
    assert!(step.directives.contains(&Directive::ShutdownWrite));

    let step = core.on_safety_timer(generation);
    assert_eq!(core.state(), ConnState::Terminated);
    assert_eq!(count_closed(&step.notices), 1);

    let late = core.on_peer_closed();
    assert_eq!(count_closed(&late.notices), 0, "teardown ran already");

    // close event first, stale timer afterwards
    let mut core = connected();
    let step = core.close().expect("close");
    let generation = step
        .directives
        .iter()
        .find_map(|d| match d {
            Directive::ArmSafetyTimer(generation, _) => Some(*generation),
            _ => None,
        })
        .expect("safety timer armed");
    let step = core.on_peer_closed();
    assert_eq!(core.state(), ConnState::Terminated);
    assert_eq!(count_closed(&step.notices), 1);

    let stale = core.on_safety_timer(generation);
    assert!(stale.notices.is_empty());
    assert!(stale.directives.is_empty());
}

#[test]
fn test_termination_deferred_while_referenced() {
    let mut core = connected();
    core.acquire();
    core.close().expect("close");
    let step = core.on_peer_closed();
    assert_eq!(core.state(), ConnState::Closed, "reference still held");
    assert_eq!(count_closed(&step.notices), 0);

    let step = core.release();
    assert_eq!(core.state(), ConnState::Terminated);
    assert_eq!(count_closed(&step.notices), 1);
}

#[test]
fn test_out_of_resources_parks_instead_of_teardown() {
    let mut core = connected();
    core.enqueue(Bytes::from_static(b"queued")).expect("enqueue");

    let step = core.on_socket_failure(IoFailure::OutOfResources);
    assert_eq!(core.state(), ConnState::Connected, "no teardown on OOR");
    assert!(core.is_parked());
    assert!(core.interest().is_empty(), "event interest cleared");
    assert!(step.directives.contains(&Directive::ParkForRecovery));
    assert!(step.notices.is_empty());

    core.retry_after_oor();
    assert!(!core.is_parked());
    assert!(core.interest().read);
    assert!(core.interest().write, "queued message still pending");
}

#[test]
fn test_oor_with_peer_gone_drops_socket_only() {
    let mut core = connected();
    let step = core.on_resource_exhausted(true);
    assert!(step.directives.contains(&Directive::DropSocket));
    assert!(step.directives.contains(&Directive::ParkForRecovery));
    assert_ne!(core.state(), ConnState::Terminated);
}

#[test]
fn test_hard_failure_disconnects_with_single_error() {
    let mut core = connected();
    let step = core.on_socket_failure(IoFailure::Hard("connection reset".into()));
    let errors = step
        .notices
        .iter()
        .filter(|n| matches!(n, Notice::Error(_)))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(core.state(), ConnState::Terminated);
    assert_eq!(count_closed(&step.notices), 1);
}

#[test]
fn test_would_block_changes_nothing() {
    let mut core = connected();
    core.enqueue(Bytes::from_static(b"pending")).expect("enqueue");
    let step = core.on_socket_failure(IoFailure::WouldBlock);
    assert!(step.notices.is_empty());
    assert!(step.directives.is_empty());
    assert_eq!(core.sendable_chunk().expect("still queued"), b"pending");
}

#[test]
fn test_accepted_connection_registers_only_after_confirmation() {
    let mut core = ConnectionCore::new_server(Transport::Tcp);
    core.start_accept().expect("accept");
    assert_eq!(core.state(), ConnState::Accepting);
    assert!(core.interest().is_empty(), "no events before confirmation");

    core.on_accept_decision(true).expect("confirm");
    assert_eq!(core.state(), ConnState::Connected);
    assert!(core.interest().read);
}

#[test]
fn test_rejected_connection_goes_straight_to_closing() {
    let mut core = ConnectionCore::new_server(Transport::Tcp);
    core.start_accept().expect("accept");
    let step = core.on_accept_decision(false).expect("reject");
    assert!(step.directives.contains(&Directive::DropSocket));
    assert_eq!(core.state(), ConnState::Terminated);
}

#[test]
fn test_tls_axis_blocks_sending_until_handshake() {
    let mut core = ConnectionCore::new_client(Transport::Tls);
    core.open_client().expect("open");
    core.on_connect_event(false).expect("connect");
    assert_eq!(core.state(), ConnState::Connected);
    assert_eq!(core.tls_state(), Some(TlsState::HandshakeReady));

    core.enqueue(Bytes::from_static(b"early")).expect("enqueue");
    assert!(
        core.sendable_chunk().is_none(),
        "TCP is up but the handshake is pending"
    );

    core.tls_handshake_started().expect("start");
    assert_eq!(core.tls_state(), Some(TlsState::HandshakeInProgress));
    core.on_tls_handshake_done(true).expect("done");
    assert_eq!(core.tls_state(), Some(TlsState::Connected));
    assert_eq!(core.sendable_chunk().expect("now sendable"), b"early");
}

#[test]
fn test_tls_handshake_failure_closes_connection() {
    let mut core = ConnectionCore::new_client(Transport::Tls);
    core.open_client().expect("open");
    core.on_connect_event(false).expect("connect");
    core.tls_handshake_started().expect("start");

    let step = core.on_tls_handshake_done(false).expect("failure handled");
    assert!(step.notices.iter().any(|n| matches!(n, Notice::Error(_))));
    assert_eq!(core.state(), ConnState::Terminated);
}

#[test]
fn test_local_close_of_established_tls_starts_close_sequence() {
    let mut core = ConnectionCore::new_client(Transport::Tls);
    core.open_client().expect("open");
    core.on_connect_event(false).expect("connect");
    core.tls_handshake_started().expect("start");
    core.on_tls_handshake_done(true).expect("done");

    core.close().expect("close");
    assert_eq!(core.state(), ConnState::Closing);
    assert_eq!(core.tls_state(), Some(TlsState::CloseSequenceStarted));
}
