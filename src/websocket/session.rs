use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info};
use uuid::Uuid;

use super::handler::InboundHandler;
use super::pump::{read_pump, write_pump};
use super::queue::OutboundQueue;
use super::socket::{self, CloseSignal, SocketReader, SocketWriter};
use crate::error::SocketError;

/// Time allowed to write a message to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next pong from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval. Must stay below `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Maximum message size allowed from the peer.
pub const MAX_MESSAGE_SIZE: usize = 100_000;

/// Payloads a session buffers before producers are turned away.
pub const QUEUE_CAPACITY: usize = 256;

/// Separates payloads coalesced into one frame.
pub const NEWLINE: &[u8] = b"\n";

const _: () = assert!(PING_PERIOD.as_secs() < PONG_WAIT.as_secs());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub max_message_size: usize,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl SessionConfig {
    /// Nine tenths of the pong wait, so a ping always lands before the peer's
    /// liveness deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
            pong_wait: PONG_WAIT,
            write_wait: WRITE_WAIT,
        }
    }
}

/// One connection: a socket bound to its outbound queue.
///
/// `start` consumes the session, so a socket never gets a second pair of
/// pumps.
pub struct Session<R, W> {
    id: Uuid,
    reader: SocketReader<R>,
    writer: SocketWriter<W>,
    queue: OutboundQueue,
    receiver: mpsc::Receiver<Vec<u8>>,
    config: SessionConfig,
}

impl<S> Session<SplitStream<WebSocketStream<S>>, SplitSink<WebSocketStream<S>, Message>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a socket handed back by the upgrade.
    pub fn from_stream(socket: WebSocketStream<S>, config: SessionConfig) -> Self {
        let (reader, writer) = socket::split(socket);
        Self::new(reader, writer, config)
    }
}

impl<R, W> Session<R, W>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    W: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    pub fn new(reader: SocketReader<R>, writer: SocketWriter<W>, config: SessionConfig) -> Self {
        let (queue, receiver) = OutboundQueue::channel(config.queue_capacity);
        Self {
            id: Uuid::new_v4(),
            reader,
            writer,
            queue,
            receiver,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Producer handle for this session's outbound queue.
    pub fn outbound(&self) -> OutboundQueue {
        self.queue.clone()
    }

    /// Spawns the read pump and the write pump and returns immediately.
    pub fn start(self, handler: Arc<dyn InboundHandler>) -> SessionHandle {
        let Self {
            id,
            reader,
            writer,
            queue,
            receiver,
            config,
        } = self;

        let closed = reader.close_signal();
        let write_task = tokio::spawn(write_pump(writer, receiver, config.clone(), id));
        let read_task = tokio::spawn(read_pump(reader, handler, config, id));

        SessionHandle {
            id,
            queue,
            closed,
            read_task,
            write_task,
        }
    }
}

/// What the owner of a running session keeps.
///
/// Dropping the handle does not stop the session. The queue stays open for
/// as long as any clone of it exists.
pub struct SessionHandle {
    id: Uuid,
    queue: OutboundQueue,
    closed: CloseSignal,
    read_task: JoinHandle<SocketError>,
    write_task: JoinHandle<Result<(), SocketError>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.queue
    }

    /// True once either pump has closed the socket.
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    /// Waits until both pumps have exited.
    pub async fn finished(self) {
        let (read, write) = tokio::join!(self.read_task, self.write_task);
        for joined in [read.err(), write.err()].into_iter().flatten() {
            error!(session = %self.id, "Pump task failed: {}", joined);
        }
        info!(session = %self.id, "Session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::handler::MockInboundHandler;
    use crate::websocket::socket::testing::mock_socket;
    use futures::StreamExt;
    use tokio::time::timeout;

    #[test]
    fn test_reference_timings() {
        assert_eq!(WRITE_WAIT, Duration::from_secs(10));
        assert_eq!(PONG_WAIT, Duration::from_secs(60));
        assert_eq!(PING_PERIOD, Duration::from_secs(54));
        assert_eq!(SessionConfig::default().ping_period(), PING_PERIOD);
    }

    #[test]
    fn test_ping_period_below_pong_wait() {
        for secs in [1, 2, 10, 60, 3600] {
            let config = SessionConfig {
                pong_wait: Duration::from_secs(secs),
                ..SessionConfig::default()
            };
            assert!(config.ping_period() < config.pong_wait);
        }
    }

    #[tokio::test]
    async fn test_reader_failure_tears_down_writer() {
        let (reader, writer, peer) = mock_socket();
        let handle = Session::new(reader, writer, SessionConfig::default())
            .start(Arc::new(MockInboundHandler::new()));
        let mut outbound = peer.outbound;

        peer.inbound
            .unbounded_send(Err(WsError::ConnectionClosed))
            .unwrap();

        let queue = handle.outbound().clone();
        timeout(Duration::from_secs(1), handle.finished())
            .await
            .expect("session did not end");
        assert!(outbound.next().await.is_none());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_writer_failure_tears_down_reader() {
        let (reader, writer, peer) = mock_socket();
        let handle = Session::new(reader, writer, SessionConfig::default())
            .start(Arc::new(MockInboundHandler::new()));
        let _inbound = peer.inbound;
        drop(peer.outbound);

        handle.outbound().try_send("nobody is listening").unwrap();

        let mut closed = handle.close_signal();
        timeout(Duration::from_secs(1), closed.closed())
            .await
            .expect("socket was not closed");
        timeout(Duration::from_secs(1), handle.finished())
            .await
            .expect("session did not end");
    }

    #[tokio::test]
    async fn test_queue_close_ends_session_gracefully() {
        let (reader, writer, peer) = mock_socket();
        let handle = Session::new(reader, writer, SessionConfig::default())
            .start(Arc::new(MockInboundHandler::new()));
        let _inbound = peer.inbound;
        let mut outbound = peer.outbound;

        handle.outbound().try_send("one").unwrap();
        assert_eq!(outbound.next().await, Some(Message::Text("one".into())));

        assert!(handle.outbound().close());
        assert_eq!(outbound.next().await, Some(Message::Close(None)));

        timeout(Duration::from_secs(1), handle.finished())
            .await
            .expect("session did not end");
        assert_eq!(outbound.next().await, None);
    }
}
