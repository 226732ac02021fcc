use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::handler::{InboundHandler, LoggingHandler};
use super::session::{Session, SessionConfig};
use super::upgrade::Upgrader;
use crate::config::Settings;

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accepts connections and gives each upgraded socket its own session.
pub struct WebSocketServer {
    upgrader: Upgrader,
    session_config: SessionConfig,
    handler: Arc<dyn InboundHandler>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketServer {
    pub fn new(
        upgrader: Upgrader,
        session_config: SessionConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            upgrader,
            session_config,
            handler,
            shutdown,
        }
    }

    /// Server that logs whatever clients send.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Upgrader::new(settings.upgrade_config()),
            settings.session_config(),
            Arc::new(LoggingHandler),
        )
    }

    /// Stops accepting and closes the outbound queue of every live session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Accept loop. Returns once shutdown was requested and every session
    /// has ended.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        connections.spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        info!("Shutting down, waiting for {} session(s)", connections.len());
        while connections.join_next().await.is_some() {}
        info!("All sessions closed");

        Ok(())
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        info!("New WebSocket connection from: {}", addr);

        let mut shutdown = self.shutdown.subscribe();
        let upgraded = tokio::select! {
            upgraded = self.upgrader.upgrade(stream) => match upgraded {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    error!("Error during WebSocket handshake with {}: {}", addr, e);
                    return;
                }
            },
            _ = stopped(&mut shutdown) => {
                info!("Dropping {} before handshake, shutting down", addr);
                return;
            }
        };

        let session = Session::from_stream(upgraded.socket, self.session_config.clone());
        info!(
            session = %session.id(),
            subprotocol = upgraded.subprotocol.as_deref().unwrap_or(""),
            "Session started for {}",
            addr
        );

        let handle = session.start(self.handler.clone());
        let outbound = handle.outbound().clone();

        let finished = handle.finished();
        tokio::pin!(finished);

        tokio::select! {
            _ = &mut finished => {}
            _ = stopped(&mut shutdown) => {
                outbound.close();
                finished.await;
            }
        }
    }
}
