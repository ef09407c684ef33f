//! Error types.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors produced while encoding or decoding packet frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The transport ended in the middle of a frame.
    UnexpectedEof,
    /// The frame header carried a kind byte this protocol does not define.
    UnknownKind(u8),
    /// The frame payload exceeds the configured maximum.
    PayloadTooLarge { len: u64, max: u64 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::UnknownKind(kind) => write!(f, "unknown packet kind: {kind}"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Transport-level errors.
///
/// `io::Error` is held behind an `Arc` so transport errors can be recorded in
/// a [`Signal`](crate::Signal) and handed to every observer.
#[derive(Debug, Clone)]
pub enum TransportError {
    Closed,
    Io(Arc<io::Error>),
    Frame(FrameError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Frame(e) => write!(f, "frame error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            Self::Frame(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// Protocol violations detected while a stream handles a packet.
///
/// These are fatal to the whole connection: after one, the transport is in an
/// indeterminate state and the manager tears it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// An invoke arrived for a stream that already exists.
    UnexpectedInvoke { stream: u64 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedInvoke { stream } => {
                write!(f, "unexpected invoke on stream {stream}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors surfaced by the connection manager and its streams.
#[derive(Debug, Clone)]
pub enum ManagerError {
    /// The manager was closed.
    Closed,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The stream reached a terminal state and can no longer be used.
    StreamClosed,
    /// Reading from or writing to the transport failed.
    Transport(TransportError),
    /// A stream could not handle a packet.
    Protocol(ProtocolError),
    /// The remote peer reported an error for this stream.
    Remote(String),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "manager closed"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::StreamClosed => write!(f, "stream closed"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ManagerError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for ManagerError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
