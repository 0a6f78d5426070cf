use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A resolution-list tier reached its configured element cap. The list
    /// stays usable, it is just truncated.
    CapacityExceeded(usize),
    /// A pop found the tier empty, the caller should fall back to the next
    /// tier or give up.
    NoCandidate,
    /// A socket operation failed from local resource pressure rather than
    /// peer or network behavior. The connection is parked for retry, never
    /// torn down for this.
    ResourceExhausted(String),
    ConnectFailed(String),
    SocketError(String),
    /// An operation was requested on a connection in a state that does not
    /// permit it.
    IllegalState(String),
    /// Every resolution candidate was tried and failed. Carries the number
    /// of attempts made.
    SendExhausted(u32),
    DnsError(String),
    Error(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CapacityExceeded(max) => write!(f, "resolution list is full (max {})", max),
            Error::NoCandidate => write!(f, "no candidate left"),
            Error::ResourceExhausted(e) => write!(f, "out of resources: {}", e),
            Error::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            Error::SocketError(e) => write!(f, "socket error: {}", e),
            Error::IllegalState(e) => write!(f, "illegal state: {}", e),
            Error::SendExhausted(attempts) => {
                write!(f, "all {} send attempts failed", attempts)
            }
            Error::DnsError(e) => write!(f, "dns error: {}", e),
            Error::Error(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::SocketError(e.to_string())
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
