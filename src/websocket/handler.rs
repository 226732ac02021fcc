use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::socket::{InboundMessage, MessageKind};

/// Receives every data message the read pump pulls off a session.
///
/// The read pump awaits each call before reading again, so a slow handler
/// slows that one session's reads and nothing else.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, session_id: Uuid, message: InboundMessage);
}

/// Logs inbound messages and drops them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl InboundHandler for LoggingHandler {
    async fn on_message(&self, session_id: Uuid, message: InboundMessage) {
        match message.kind {
            MessageKind::Text => info!(
                session = %session_id,
                "Received message: {}",
                String::from_utf8_lossy(&message.payload)
            ),
            MessageKind::Binary => info!(
                session = %session_id,
                "Received binary message of {} bytes",
                message.payload.len()
            ),
        }
    }
}
