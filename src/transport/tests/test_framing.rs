use crate::transport::framing::{Frame, StreamFramer, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use bytes::BytesMut;

const MESSAGE: &[u8] = b"REGISTER sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK-test\r\n\
Content-Length: 5\r\n\r\nhello";

#[test]
fn test_keepalive_exchange() {
    let mut framer = StreamFramer::new();
    let mut buf = BytesMut::from(&KEEPALIVE_REQUEST[..]);
    assert_eq!(
        framer.decode(&mut buf).expect("decode"),
        Some(Frame::KeepaliveRequest)
    );
    assert!(buf.is_empty());

    let mut buf = BytesMut::from(&KEEPALIVE_RESPONSE[..]);
    assert_eq!(
        framer.decode(&mut buf).expect("decode"),
        Some(Frame::KeepaliveResponse)
    );
    assert!(buf.is_empty());
}

#[test]
fn test_complete_message_with_body() {
    let mut framer = StreamFramer::new();
    let mut buf = BytesMut::from(MESSAGE);
    match framer.decode(&mut buf).expect("decode") {
        Some(Frame::Message(msg)) => assert_eq!(&msg[..], MESSAGE),
        other => panic!("expected a message frame, got {:?}", other),
    }
    assert!(buf.is_empty());
}

#[test]
fn test_partial_message_retained_across_feeds() {
    let mut framer = StreamFramer::new();
    let mut buf = BytesMut::new();

    // headers split mid-line
    buf.extend_from_slice(&MESSAGE[..40]);
    assert_eq!(framer.decode(&mut buf).expect("decode"), None);

    // headers complete, body still short
    buf.extend_from_slice(&MESSAGE[40..MESSAGE.len() - 2]);
    assert_eq!(framer.decode(&mut buf).expect("decode"), None);

    buf.extend_from_slice(&MESSAGE[MESSAGE.len() - 2..]);
    match framer.decode(&mut buf).expect("decode") {
        Some(Frame::Message(msg)) => assert_eq!(&msg[..], MESSAGE),
        other => panic!("expected a message frame, got {:?}", other),
    }
}

#[test]
fn test_two_messages_in_one_buffer() {
    let mut framer = StreamFramer::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(MESSAGE);
    buf.extend_from_slice(MESSAGE);

    for _ in 0..2 {
        match framer.decode(&mut buf).expect("decode") {
            Some(Frame::Message(msg)) => assert_eq!(&msg[..], MESSAGE),
            other => panic!("expected a message frame, got {:?}", other),
        }
    }
    assert!(buf.is_empty());
}

#[test]
fn test_content_length_header_is_case_insensitive() {
    let mut framer = StreamFramer::new();
    let raw = b"OPTIONS sip:example.com SIP/2.0\r\ncontent-length: 2\r\n\r\nok";
    let mut buf = BytesMut::from(&raw[..]);
    match framer.decode(&mut buf).expect("decode") {
        Some(Frame::Message(msg)) => assert_eq!(&msg[..], &raw[..]),
        other => panic!("expected a message frame, got {:?}", other),
    }
}

#[test]
fn test_oversized_buffer_is_rejected() {
    let mut framer = StreamFramer::with_max_size(32);
    let mut buf = BytesMut::from(&b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);
    assert!(framer.decode(&mut buf).is_err());
}

#[test]
fn test_oversized_declared_body_is_rejected() {
    let mut framer = StreamFramer::with_max_size(64);
    let raw = b"OPTIONS sip:example.com SIP/2.0\r\nContent-Length: 9999\r\n\r\n";
    let mut buf = BytesMut::from(&raw[..]);
    assert!(framer.decode(&mut buf).is_err());
}
