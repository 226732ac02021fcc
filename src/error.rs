use thiserror::Error;
use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};
use tokio_tungstenite::tungstenite::Error as WsError;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for an endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Upgrade error: {0}")]
    UpgradeError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] SocketError),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

/// Failures observed on a session socket. Every one of them ends the pump
/// that saw it.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Socket closed")]
    Closed,

    #[error("Peer closed connection with code {code}: {reason}")]
    PeerClosed { code: u16, reason: String },

    #[error("Connection dropped without close frame")]
    Dropped,

    #[error("Read deadline exceeded")]
    ReadTimeout,

    #[error("Write deadline exceeded")]
    WriteTimeout,

    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Invalid text payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Protocol error: {0}")]
    Protocol(WsError),
}

impl SocketError {
    /// Whether the peer went away in a way that needs no diagnostic noise:
    /// a normal or going-away close frame, or a dropped connection.
    pub fn is_expected_close(&self) -> bool {
        match self {
            SocketError::PeerClosed { code, .. } => {
                matches!(*code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
            }
            SocketError::Dropped => true,
            _ => false,
        }
    }

    /// Close code as the peer would report it, if the error is a closure.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            SocketError::PeerClosed { code, .. } => Some(*code),
            SocketError::Dropped => Some(CLOSE_ABNORMAL),
            _ => None,
        }
    }
}

impl From<WsError> for SocketError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SocketError::Closed,
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                SocketError::MessageTooLarge { size, limit: max_size }
            }
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => SocketError::Dropped,
            WsError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                SocketError::Dropped
            }
            other => SocketError::Protocol(other),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Outbound queue is full")]
    Full,

    #[error("Outbound queue is closed")]
    Closed,
}
