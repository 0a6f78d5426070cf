use crate::Result;
use bytes::{Buf, Bytes, BytesMut};

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

pub(super) const MAX_MESSAGE_SIZE: usize = 65535;

/// One unit recognized on a stream: a complete framed message, or one of the
/// CRLF keepalive exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Bytes),
    KeepaliveRequest,
    KeepaliveResponse,
}

/// Message-boundary detector for stream transports.
///
/// A frame is complete once the header block is terminated by CRLFCRLF and
/// `Content-Length` more bytes of body have arrived. Message syntax beyond
/// that single header is not this layer's business; frames come out as raw
/// bytes.
pub struct StreamFramer {
    max_size: usize,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Ok(Some(Frame::KeepaliveRequest));
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Ok(Some(Frame::KeepaliveResponse));
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = &src[..headers_end + 4];

            let headers_str = std::str::from_utf8(headers)
                .map_err(|e| crate::Error::Error(format!("Invalid UTF-8 in headers: {}", e)))?;
            let mut content_length = 0;
            for line in headers_str.lines() {
                if let Some((name, rest)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("Content-Length") {
                        content_length = rest.trim().parse::<usize>().map_err(|e| {
                            crate::Error::Error(format!("Invalid Content-Length: {}", e))
                        })?;
                        break;
                    }
                }
            }

            let total_len = headers_end + 4 + content_length;
            if total_len > self.max_size {
                return Err(crate::Error::Error("message too large".to_string()));
            }

            if src.len() >= total_len {
                let msg_data = src.split_to(total_len);
                return Ok(Some(Frame::Message(msg_data.freeze())));
            }
        }

        if src.len() > self.max_size {
            return Err(crate::Error::Error("message too large".to_string()));
        }
        Ok(None)
    }
}
