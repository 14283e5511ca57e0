// src/core/errors.rs

//! Defines the error type shared by every layer of the client.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum. Every call resolves with exactly one of these on failure.
///
/// Transport and protocol failures are handled by the connection worker and
/// reach callers only as `ConnectionLost`, `ConnectionClosed` or `NotConnected`
/// attached to their own request.
#[derive(Error, Debug)]
pub enum TntError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timed out")]
    Timeout,

    /// The server rejected the request. `code` is the server error code
    /// (status code with the error bit masked off).
    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("Unknown space '{0}'")]
    UnknownSpace(String),

    #[error("Unknown index '{index}' in space '{space}'")]
    UnknownIndex { space: String, index: String },

    #[error("Decode error: {0}")]
    Decode(String),
}

impl TntError {
    /// Returns true for failures that end the physical connection and must
    /// push the state machine into `Reconnecting`/`Closed`.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            TntError::Io(_)
                | TntError::Protocol(_)
                | TntError::FrameTooLarge { .. }
                | TntError::Handshake(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for TntError {
    fn clone(&self) -> Self {
        match self {
            TntError::Io(e) => TntError::Io(Arc::clone(e)),
            TntError::Protocol(s) => TntError::Protocol(s.clone()),
            TntError::FrameTooLarge { size, max } => TntError::FrameTooLarge {
                size: *size,
                max: *max,
            },
            TntError::Handshake(s) => TntError::Handshake(s.clone()),
            TntError::NotConnected => TntError::NotConnected,
            TntError::ConnectionLost => TntError::ConnectionLost,
            TntError::ConnectionClosed => TntError::ConnectionClosed,
            TntError::Timeout => TntError::Timeout,
            TntError::Server { code, message } => TntError::Server {
                code: *code,
                message: message.clone(),
            },
            TntError::UnknownSpace(s) => TntError::UnknownSpace(s.clone()),
            TntError::UnknownIndex { space, index } => TntError::UnknownIndex {
                space: space.clone(),
                index: index.clone(),
            },
            TntError::Decode(s) => TntError::Decode(s.clone()),
        }
    }
}

impl PartialEq for TntError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TntError::Io(e1), TntError::Io(e2)) => e1.kind() == e2.kind(),
            (TntError::Protocol(s1), TntError::Protocol(s2)) => s1 == s2,
            (
                TntError::FrameTooLarge { size: s1, max: m1 },
                TntError::FrameTooLarge { size: s2, max: m2 },
            ) => s1 == s2 && m1 == m2,
            (TntError::Handshake(s1), TntError::Handshake(s2)) => s1 == s2,
            (
                TntError::Server { code: c1, message: m1 },
                TntError::Server { code: c2, message: m2 },
            ) => c1 == c2 && m1 == m2,
            (TntError::UnknownSpace(s1), TntError::UnknownSpace(s2)) => s1 == s2,
            (
                TntError::UnknownIndex { space: s1, index: i1 },
                TntError::UnknownIndex { space: s2, index: i2 },
            ) => s1 == s2 && i1 == i2,
            (TntError::Decode(s1), TntError::Decode(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for TntError {
    fn from(e: std::io::Error) -> Self {
        TntError::Io(Arc::new(e))
    }
}

impl From<rmp::encode::ValueWriteError> for TntError {
    fn from(e: rmp::encode::ValueWriteError) -> Self {
        TntError::Io(Arc::new(std::io::Error::other(e.to_string())))
    }
}

impl From<rmpv::decode::Error> for TntError {
    fn from(e: rmpv::decode::Error) -> Self {
        TntError::Protocol(format!("malformed msgpack payload: {e}"))
    }
}

impl From<rmpv::ext::Error> for TntError {
    fn from(e: rmpv::ext::Error) -> Self {
        TntError::Decode(e.to_string())
    }
}
