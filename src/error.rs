//! Error types for the WebSocket endpoint

use std::fmt;
use std::io;

use crate::close::CloseReason;

/// Result type alias for endpoint operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket endpoint error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying stream
    Io(io::Error),
    /// Protocol violation (malformed header, bad masking, fragmentation order)
    Protocol(&'static str),
    /// Payload the peer is not allowed to send in the negotiated configuration
    IncorrectData(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Close frame carried a status code outside the transmittable ranges
    InvalidCloseCode(u16),
    /// Inbound frame exceeds the configured frame cap
    FrameTooLarge,
    /// Assembled message exceeds the configured message cap
    MessageTooLarge,
    /// Inbound event queue exceeded its soft cap
    QueueOverflow,
    /// Control frame payload over 125 bytes
    ControlTooLarge,
    /// Compression or decompression failure
    Compression(String),
    /// Operation invoked in a state that does not permit it
    InvalidState(&'static str),
    /// Application callback panicked
    Application(&'static str),
    /// The underlying stream is gone
    ConnectionClosed,
}

impl Error {
    /// Status code the receive loop uses when this error fails the connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) | Error::InvalidCloseCode(_) => CloseReason::PROTOCOL_ERROR,
            Error::IncorrectData(_) | Error::InvalidUtf8 | Error::Compression(_) => {
                CloseReason::INCORRECT_DATA
            }
            Error::FrameTooLarge | Error::MessageTooLarge | Error::QueueOverflow => {
                CloseReason::TOO_BIG
            }
            _ => CloseReason::ABNORMAL,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::IncorrectData(msg) => write!(f, "Incorrect data: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 payload"),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::QueueOverflow => write!(f, "Inbound event queue overflow"),
            Error::ControlTooLarge => write!(f, "Control frame payload over 125 bytes"),
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Application(msg) => write!(f, "Application callback error: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
