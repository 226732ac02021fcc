//! Role-partitioned views over one WebSocket.
//!
//! A socket is split into a [`SocketReader`] and a [`SocketWriter`]. The
//! reader can only read and the writer can only write, so two tasks can share
//! the connection without a lock. Both views share one close state: closing
//! from either side is idempotent and wakes whatever the other side is
//! blocked on.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::SocketError;

/// Close code reported when a close frame carried no status.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A data message read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Invoked for every pong frame with the current read deadline and the pong
/// payload.
pub type PongHandler = Box<dyn FnMut(&mut Option<Instant>, &[u8]) + Send>;

#[derive(Debug)]
struct CloseState {
    tx: watch::Sender<bool>,
}

impl CloseState {
    fn new() -> (Arc<Self>, CloseSignal) {
        let (tx, rx) = watch::channel(false);
        (Arc::new(Self { tx }), CloseSignal { rx })
    }

    /// Returns true only for the call that actually closed the socket.
    fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }
}

/// Observes the shared close state without being able to read or write.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the socket has been closed from either side.
    pub async fn closed(&mut self) {
        // An error means every view is gone, which is as closed as it gets.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

/// Closes the socket when dropped.
#[derive(Debug)]
pub struct CloseGuard {
    state: Arc<CloseState>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.state.close();
    }
}

/// Splits an established WebSocket into its read and write views.
pub fn split<S>(
    socket: WebSocketStream<S>,
) -> (
    SocketReader<SplitStream<WebSocketStream<S>>>,
    SocketWriter<SplitSink<WebSocketStream<S>, Message>>,
)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = socket.split();
    from_parts(stream, sink)
}

/// Builds the two views from an arbitrary message stream and sink.
pub fn from_parts<R, W>(stream: R, sink: W) -> (SocketReader<R>, SocketWriter<W>)
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    let (state, closed) = CloseState::new();
    let reader = SocketReader {
        stream,
        state: state.clone(),
        closed: closed.clone(),
        read_limit: None,
        deadline: None,
        pong_handler: None,
    };
    let writer = SocketWriter {
        sink,
        state,
        closed,
        deadline: None,
    };
    (reader, writer)
}

async fn before<F, T>(deadline: Option<Instant>, fut: F, expired: SocketError) -> Result<T, SocketError>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await.map_err(|_| expired),
        None => Ok(fut.await),
    }
}

/// Read-only view of a socket.
pub struct SocketReader<R> {
    stream: R,
    state: Arc<CloseState>,
    closed: CloseSignal,
    read_limit: Option<usize>,
    deadline: Option<Instant>,
    pong_handler: Option<PongHandler>,
}

impl<R> SocketReader<R>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    /// Messages larger than `limit` bytes fail the read.
    pub fn set_read_limit(&mut self, limit: usize) {
        self.read_limit = Some(limit);
    }

    pub fn set_read_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_pong_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Option<Instant>, &[u8]) + Send + 'static,
    {
        self.pong_handler = Some(Box::new(handler));
    }

    /// Waits for the next text or binary message.
    ///
    /// Pongs go to the pong handler, pings are answered by the protocol layer,
    /// and neither is returned. Any error is final for this reader.
    pub async fn read_message(&mut self) -> Result<InboundMessage, SocketError> {
        loop {
            if self.closed.is_closed() {
                return Err(SocketError::Closed);
            }

            let next = tokio::select! {
                biased;
                _ = self.closed.closed() => return Err(SocketError::Closed),
                next = before(self.deadline, self.stream.next(), SocketError::ReadTimeout) => next?,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SocketError::Dropped),
            };

            match message {
                Message::Text(text) => return self.accept(MessageKind::Text, text.into_bytes()),
                Message::Binary(data) => return self.accept(MessageKind::Binary, data),
                Message::Pong(data) => {
                    if let Some(handler) = self.pong_handler.as_mut() {
                        handler(&mut self.deadline, &data);
                    }
                }
                Message::Close(frame) => {
                    self.finish_close().await;
                    return Err(match frame {
                        Some(frame) => SocketError::PeerClosed {
                            code: frame.code.into(),
                            reason: frame.reason.into_owned(),
                        },
                        None => SocketError::PeerClosed {
                            code: CLOSE_NO_STATUS,
                            reason: String::new(),
                        },
                    });
                }
                Message::Ping(_) | Message::Frame(_) => {}
            }
        }
    }

    /// The protocol layer queues the close reply and only flushes it on a
    /// later read, so keep reading until the stream ends.
    async fn finish_close(&mut self) {
        let deadline = self.deadline;
        let stream = &mut self.stream;
        let drain = async move { while let Some(Ok(_)) = stream.next().await {} };
        tokio::select! {
            biased;
            _ = self.closed.closed() => {}
            _ = before(deadline, drain, SocketError::ReadTimeout) => {}
        }
    }

    fn accept(&self, kind: MessageKind, payload: Vec<u8>) -> Result<InboundMessage, SocketError> {
        if let Some(limit) = self.read_limit {
            if payload.len() > limit {
                return Err(SocketError::MessageTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }
        Ok(InboundMessage { kind, payload })
    }
}

impl<R> SocketReader<R> {
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    pub fn close_guard(&self) -> CloseGuard {
        CloseGuard {
            state: self.state.clone(),
        }
    }

    /// Closes the socket. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.state.close()
    }
}

/// Write-only view of a socket.
pub struct SocketWriter<W> {
    sink: W,
    state: Arc<CloseState>,
    closed: CloseSignal,
    deadline: Option<Instant>,
}

impl<W> SocketWriter<W>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    pub fn set_write_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Sends one message and flushes it, bounded by the write deadline.
    pub async fn write_message(&mut self, message: Message) -> Result<(), SocketError> {
        if self.closed.is_closed() {
            return Err(SocketError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.closed() => Err(SocketError::Closed),
            sent = before(self.deadline, self.sink.send(message), SocketError::WriteTimeout) => {
                sent?.map_err(SocketError::from)
            }
        }
    }

    /// Opens a message of the given kind. Nothing is sent until
    /// [`MessageWriter::finish`].
    pub fn next_writer(&mut self, kind: MessageKind) -> MessageWriter<'_, W> {
        MessageWriter {
            writer: self,
            kind,
            buf: Vec::new(),
        }
    }
}

impl<W> SocketWriter<W> {
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    pub fn close_guard(&self) -> CloseGuard {
        CloseGuard {
            state: self.state.clone(),
        }
    }

    /// Closes the socket. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.state.close()
    }
}

/// One outgoing message assembled from several writes.
pub struct MessageWriter<'a, W> {
    writer: &'a mut SocketWriter<W>,
    kind: MessageKind,
    buf: Vec<u8>,
}

impl<'a, W> MessageWriter<'a, W>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Sends the assembled message as a single frame.
    pub async fn finish(self) -> Result<(), SocketError> {
        let message = match self.kind {
            MessageKind::Text => Message::Text(String::from_utf8(self.buf)?),
            MessageKind::Binary => Message::Binary(self.buf),
        };
        self.writer.write_message(message).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::mock_socket;
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[tokio::test]
    async fn test_read_skips_control_frames() {
        let (mut reader, _writer, peer) = mock_socket();
        peer.inbound.unbounded_send(Ok(Message::Ping(vec![1]))).unwrap();
        peer.inbound.unbounded_send(Ok(Message::Pong(vec![]))).unwrap();
        peer.inbound.unbounded_send(Ok(Message::Text("hello".into()))).unwrap();
        peer.inbound.unbounded_send(Ok(Message::Binary(vec![0, 1, 2]))).unwrap();

        let first = reader.read_message().await.unwrap();
        assert_eq!(first.kind, MessageKind::Text);
        assert_eq!(first.payload, b"hello");

        let second = reader.read_message().await.unwrap();
        assert_eq!(second.kind, MessageKind::Binary);
        assert_eq!(second.payload, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_read_limit() {
        let (mut reader, _writer, peer) = mock_socket();
        reader.set_read_limit(4);
        peer.inbound.unbounded_send(Ok(Message::Text("four".into()))).unwrap();
        peer.inbound.unbounded_send(Ok(Message::Text("fives".into()))).unwrap();

        assert!(reader.read_message().await.is_ok());
        match reader.read_message().await {
            Err(SocketError::MessageTooLarge { size, limit }) => {
                assert_eq!(size, 5);
                assert_eq!(limit, 4);
            }
            other => panic!("Expected MessageTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_close_frame() {
        let (mut reader, _writer, peer) = mock_socket();
        peer.inbound
            .unbounded_send(Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "bye".into(),
            }))))
            .unwrap();
        drop(peer);

        let err = reader.read_message().await.unwrap_err();
        assert!(err.is_expected_close());
        assert_eq!(err.close_code(), Some(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_reads_until_stream_ends() {
        let (mut reader, _writer, peer) = mock_socket();
        let start = Instant::now();
        reader.set_read_deadline(start + Duration::from_secs(5));
        peer.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        peer.inbound.unbounded_send(Ok(Message::Text("after close".into()))).unwrap();

        let read = tokio::spawn(async move {
            let result = reader.read_message().await;
            (result, reader)
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!read.is_finished());

        drop(peer);
        let (result, mut reader) = read.await.unwrap();
        match result {
            Err(SocketError::PeerClosed { code, .. }) => assert_eq!(code, CLOSE_NO_STATUS),
            other => panic!("Expected PeerClosed, got {:?}", other),
        }
        assert!(reader.stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_gives_up_at_deadline() {
        let (mut reader, _writer, peer) = mock_socket();
        let start = Instant::now();
        reader.set_read_deadline(start + Duration::from_secs(5));
        peer.inbound
            .unbounded_send(Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))))
            .unwrap();

        let err = reader.read_message().await.unwrap_err();
        assert_eq!(err.close_code(), Some(1000));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stream_end_is_dropped_connection() {
        let (mut reader, _writer, peer) = mock_socket();
        drop(peer);
        assert!(matches!(reader.read_message().await, Err(SocketError::Dropped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (mut reader, _writer, _peer) = mock_socket();
        let start = Instant::now();
        reader.set_read_deadline(start + Duration::from_secs(5));

        assert!(matches!(reader.read_message().await, Err(SocketError::ReadTimeout)));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_handler_moves_deadline() {
        let (mut reader, _writer, peer) = mock_socket();
        let start = Instant::now();
        reader.set_read_deadline(start + Duration::from_secs(5));
        reader.set_pong_handler(|deadline, payload| {
            assert_eq!(payload, b"alive");
            *deadline = Some(Instant::now() + Duration::from_secs(30));
        });
        peer.inbound.unbounded_send(Ok(Message::Pong(b"alive".to_vec()))).unwrap();

        assert!(matches!(reader.read_message().await, Err(SocketError::ReadTimeout)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(reader.read_deadline(), Some(start + Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_shared() {
        let (reader, writer, _peer) = mock_socket();
        assert!(!reader.is_closed());

        assert!(writer.close());
        assert!(!writer.close());
        assert!(!reader.close());
        assert!(reader.is_closed());
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (mut reader, writer, _peer) = mock_socket();
        let read = tokio::spawn(async move { reader.read_message().await });

        tokio::task::yield_now().await;
        drop(writer.close_guard());

        let result = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .expect("reader was not woken")
            .unwrap();
        assert!(matches!(result, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (reader, mut writer, mut peer) = mock_socket();
        reader.close();

        let result = writer.write_message(Message::Text("late".into())).await;
        assert!(matches!(result, Err(SocketError::Closed)));
        drop(writer);
        assert!(peer.outbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_message_writer_sends_one_frame() {
        let (_reader, mut writer, mut peer) = mock_socket();

        let mut frame = writer.next_writer(MessageKind::Text);
        assert!(frame.is_empty());
        frame.write(b"one");
        frame.write(b"\n");
        frame.write(b"two");
        assert_eq!(frame.len(), 7);
        frame.finish().await.unwrap();

        assert_eq!(peer.outbound.next().await, Some(Message::Text("one\ntwo".into())));
    }

    #[tokio::test]
    async fn test_message_writer_rejects_invalid_text() {
        let (_reader, mut writer, _peer) = mock_socket();

        let mut frame = writer.next_writer(MessageKind::Text);
        frame.write(&[0xff, 0xfe]);
        assert!(matches!(frame.finish().await, Err(SocketError::InvalidUtf8(_))));
    }

    #[tokio::test]
    async fn test_write_to_gone_peer_fails() {
        let (_reader, mut writer, peer) = mock_socket();
        drop(peer);

        let result = writer.write_message(Message::Ping(Vec::new())).await;
        assert!(matches!(result, Err(SocketError::Closed)));
    }
}
