//! The two per-session tasks.
//!
//! `read_pump` is the only code that reads from a session socket and
//! `write_pump` the only code that writes to it. Whichever exits first closes
//! the socket, which in turn ends the other one.

use std::sync::Arc;

use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::InboundHandler;
use super::session::{SessionConfig, NEWLINE};
use super::socket::{MessageKind, SocketReader, SocketWriter};
use crate::error::SocketError;

/// Reads until the socket fails, handing each message to `handler`.
/// Returns the error that ended the loop.
pub(crate) async fn read_pump<R>(
    mut reader: SocketReader<R>,
    handler: Arc<dyn InboundHandler>,
    config: SessionConfig,
    id: Uuid,
) -> SocketError
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let _guard = reader.close_guard();

    let pong_wait = config.pong_wait;
    reader.set_read_limit(config.max_message_size);
    reader.set_read_deadline(Instant::now() + pong_wait);
    reader.set_pong_handler(move |deadline, _| {
        *deadline = Some(Instant::now() + pong_wait);
        debug!(session = %id, "Pong received, read deadline renewed");
    });

    info!(session = %id, "Client connected");

    let err = loop {
        match reader.read_message().await {
            Ok(message) => handler.on_message(id, message).await,
            Err(e) => break e,
        }
    };

    match &err {
        SocketError::Closed => debug!(session = %id, "Read pump stopped, socket closed by writer"),
        e if e.is_expected_close() => info!(session = %id, "Client closed connection: {}", e),
        e => error!(session = %id, "Unexpected read failure: {}", e),
    }
    info!(session = %id, "Client disconnected");

    err
}

/// Drains `queue` onto the socket and keeps the peer alive with pings.
///
/// Returns `Ok(())` when the queue was closed and the close frame went out.
pub(crate) async fn write_pump<W>(
    mut writer: SocketWriter<W>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    config: SessionConfig,
    id: Uuid,
) -> Result<(), SocketError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let _guard = writer.close_guard();
    let mut closed = writer.close_signal();

    let ping_period = config.ping_period();
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            payload = queue.recv() => {
                writer.set_write_deadline(Instant::now() + config.write_wait);
                let Some(payload) = payload else {
                    // Every producer is done.
                    break writer.write_message(Message::Close(None)).await;
                };
                if let Err(e) = write_coalesced(&mut writer, &mut queue, payload, config.queue_capacity).await {
                    break Err(e);
                }
            }
            _ = ticker.tick() => {
                debug!(session = %id, "Sending ping");
                writer.set_write_deadline(Instant::now() + config.write_wait);
                if let Err(e) = writer.write_message(Message::Ping(Vec::new())).await {
                    break Err(e);
                }
            }
            _ = closed.closed() => break Err(SocketError::Closed),
        }
    };

    match &result {
        Ok(()) => info!(session = %id, "Outbound queue closed, close frame sent"),
        Err(SocketError::Closed) => debug!(session = %id, "Write pump stopped, socket closed by reader"),
        Err(e) => warn!(session = %id, "Write failed: {}", e),
    }

    result
}

/// Writes `first` plus whatever is already queued as one text frame, one
/// payload per line. At most `limit` extra payloads are taken.
async fn write_coalesced<W>(
    writer: &mut SocketWriter<W>,
    queue: &mut mpsc::Receiver<Vec<u8>>,
    first: Vec<u8>,
    limit: usize,
) -> Result<(), SocketError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut frame = writer.next_writer(MessageKind::Text);
    frame.write(&first);

    for _ in 0..limit {
        match queue.try_recv() {
            Ok(payload) => {
                frame.write(NEWLINE);
                frame.write(&payload);
            }
            Err(_) => break,
        }
    }

    frame.finish().await
}
