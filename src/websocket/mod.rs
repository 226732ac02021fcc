//! WebSocket sessions.
//!
//! Each upgraded connection becomes a [`Session`] driven by two tasks: a read
//! pump that is the socket's only reader and a write pump that is its only
//! writer.

mod handler;
mod pump;
mod queue;
mod server;
mod session;
pub mod socket;
mod upgrade;

pub use handler::{InboundHandler, LoggingHandler};
pub use queue::OutboundQueue;
pub use server::WebSocketServer;
pub use session::{
    Session, SessionConfig, SessionHandle, MAX_MESSAGE_SIZE, NEWLINE, PING_PERIOD, PONG_WAIT,
    QUEUE_CAPACITY, WRITE_WAIT,
};
pub use socket::{CloseSignal, InboundMessage, MessageKind};
pub use upgrade::{UpgradeConfig, Upgraded, Upgrader};
