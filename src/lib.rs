pub mod config;
pub mod error;
pub mod websocket;

pub use error::{AppError, QueueError, SocketError};
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

pub use websocket::{
    InboundHandler, InboundMessage, LoggingHandler, MessageKind, OutboundQueue, Session,
    SessionConfig, SessionHandle, UpgradeConfig, Upgrader, WebSocketServer, MAX_MESSAGE_SIZE,
    PING_PERIOD, PONG_WAIT, QUEUE_CAPACITY, WRITE_WAIT,
};
