use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    AsHeaderName, HeaderValue, HOST, ORIGIN, REFERER, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use super::session::{MAX_MESSAGE_SIZE, WRITE_WAIT};
use crate::error::AppError;

/// Handshake policy. Built once at startup and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    pub path: String,
    pub subprotocols: Vec<String>,
    pub allow_all_origins: bool,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    /// Time a client gets to complete the handshake after connecting.
    pub handshake_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            subprotocols: vec!["testticket".to_string()],
            allow_all_origins: true,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: MAX_MESSAGE_SIZE,
            handshake_timeout: WRITE_WAIT,
        }
    }
}

/// A socket that completed the handshake.
pub struct Upgraded<S> {
    pub socket: WebSocketStream<BufReader<S>>,
    pub subprotocol: Option<String>,
}

impl<S> std::fmt::Debug for Upgraded<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("subprotocol", &self.subprotocol)
            .finish_non_exhaustive()
    }
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

fn header<'a>(request: &'a Request, name: impl AsHeaderName) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

#[derive(Debug, Clone)]
pub struct Upgrader {
    config: UpgradeConfig,
}

impl Upgrader {
    pub fn new(config: UpgradeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.write_buffer_size = self.config.write_buffer_size;
        config.max_message_size = Some(self.config.max_message_size);
        config
    }

    /// Runs the server side of the handshake over `stream`.
    pub async fn upgrade<S>(&self, stream: S) -> Result<Upgraded<S>, AppError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = BufReader::with_capacity(self.config.read_buffer_size, stream);
        let mut selected = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            info!(
                host = header(request, HOST),
                user_agent = header(request, USER_AGENT),
                referer = header(request, REFERER),
                "Upgrade request for {}",
                request.uri().path()
            );

            let protocol = self.negotiate(request)?;
            if let Some(protocol) = &protocol {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            selected = protocol;
            Ok(response)
        };

        let handshake = accept_hdr_async_with_config(stream, callback, Some(self.websocket_config()));
        let socket = tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| AppError::UpgradeError("Handshake timed out".to_string()))?
            .map_err(|e| AppError::UpgradeError(e.to_string()))?;

        Ok(Upgraded {
            socket,
            subprotocol: selected,
        })
    }

    /// Applies the route and origin policy and picks a sub-protocol.
    pub fn negotiate(&self, request: &Request) -> Result<Option<String>, ErrorResponse> {
        if request.uri().path() != self.config.path {
            return Err(reject(StatusCode::NOT_FOUND, "Not found"));
        }
        if !self.config.allow_all_origins && !same_origin(request) {
            warn!(origin = header(request, ORIGIN), "Rejected cross-origin upgrade");
            return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
        }
        Ok(self.select_subprotocol(request))
    }

    /// First protocol in the client's list that the server accepts.
    fn select_subprotocol(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .find(|offered| self.config.subprotocols.iter().any(|accepted| accepted.as_str() == *offered))
            .map(str::to_string)
    }
}

/// Requests without an `Origin` header pass; otherwise the origin's host must
/// match the `Host` header.
fn same_origin(request: &Request) -> bool {
    let Some(origin) = request.headers().get(ORIGIN) else {
        return true;
    };
    let Some(origin) = origin.to_str().ok().and_then(|o| Url::parse(o).ok()) else {
        return false;
    };
    let Some(host) = origin.host_str() else {
        return false;
    };
    let origin_host = match origin.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    origin_host.eq_ignore_ascii_case(header(request, HOST))
}
