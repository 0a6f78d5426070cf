// A SIP destination-resolution and transport-connection engine in Rust

pub mod error;
pub mod transmitter;
pub mod transport;

pub use error::Error;

pub type Result<T> = std::result::Result<T, error::Error>;
