//! WebSocket transport.
//!
//! Accepts the upgrade on the fixed terminal path, then runs two pumps per
//! connection: one decodes incoming frames into the endpoint's inbound
//! channel, the other encodes outbound messages into frames.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{decode_client, encode_server, ClientMessage, Frame, ServerMessage, TERMINAL_PATH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::task::TaskTracker;

use super::{TransportEndpoint, CHANNEL_CAPACITY};
use crate::config::ServerConfig;
use crate::session::ConnectionId;

/// How long the writer waits to deliver the final close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rules applied to every upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePolicy {
    /// Accepted `Origin` values. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Maximum size of one WebSocket message or frame.
    pub max_message_size: usize,
}

impl HandshakePolicy {
    /// Builds the policy from server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            max_message_size: config.max_message_size,
        }
    }

    /// Whether any origin is accepted.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_origins.is_empty()
    }
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

#[derive(Debug)]
struct HandshakeRejection {
    status: StatusCode,
    body: &'static str,
}

impl HandshakeRejection {
    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.body.to_string()));
        *response.status_mut() = self.status;
        response
    }
}

fn validate_upgrade(request: &Request, policy: &HandshakePolicy) -> Result<(), HandshakeRejection> {
    if request.uri().path() != TERMINAL_PATH {
        return Err(HandshakeRejection {
            status: StatusCode::NOT_FOUND,
            body: "Unknown endpoint",
        });
    }

    if !policy.is_unrestricted() {
        let origin = request
            .headers()
            .get("Origin")
            .and_then(|value| value.to_str().ok())
            .ok_or(HandshakeRejection {
                status: StatusCode::FORBIDDEN,
                body: "Origin header missing",
            })?;

        if !policy.allowed_origins.iter().any(|allowed| allowed == origin) {
            return Err(HandshakeRejection {
                status: StatusCode::FORBIDDEN,
                body: "Origin not allowed",
            });
        }
    }

    Ok(())
}

/// Performs the WebSocket handshake on an accepted stream.
pub async fn accept<S>(stream: S, policy: &HandshakePolicy) -> Result<WebSocketStream<S>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(policy.max_message_size);
    ws_config.max_frame_size = Some(policy.max_message_size);

    let policy = policy.clone();
    let callback = move |request: &Request, response: Response| {
        validate_upgrade(request, &policy)
            .map(|()| response)
            .map_err(|rejection| {
                tracing::warn!(
                    path = %request.uri().path(),
                    status = %rejection.status,
                    reason = rejection.body,
                    "Rejected WebSocket upgrade"
                );
                rejection.into_response()
            })
    };

    accept_hdr_async_with_config(stream, callback, Some(ws_config)).await
}

/// Wires a WebSocket into a [`TransportEndpoint`].
///
/// Both pumps run on `tracker`. The reader stops once the endpoint's inbound
/// receiver is dropped, even if the client never closes its side.
pub fn attach<S>(
    ws: WebSocketStream<S>,
    id: ConnectionId,
    tracker: &TaskTracker,
) -> TransportEndpoint
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tracker.spawn(read_frames(stream, inbound_tx, id.clone()));
    tracker.spawn(write_frames(sink, outbound_rx, id.clone()));

    TransportEndpoint::new(id, inbound_rx, outbound_tx)
}

async fn read_frames<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<ClientMessage>,
    id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inbound.closed() => {
                tracing::debug!(connection_id = %id, "Session ended; stopping frame reader");
                return;
            }
            frame = stream.next() => frame,
        };

        let frame = match frame {
            Some(Ok(WsMessage::Text(text))) => Frame::Text(text),
            Some(Ok(WsMessage::Binary(data))) => Frame::Binary(data),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %id, error = %e, "WebSocket read error");
                break;
            }
        };

        match decode_client(frame) {
            Ok(message) => {
                if inbound.send(message).await.is_err() {
                    // Session already torn down.
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Dropping malformed client frame");
            }
        }
    }

    tracing::debug!(connection_id = %id, "Client transport closed");
}

async fn write_frames<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let frame = match encode_server(message) {
            Ok(Frame::Text(text)) => WsMessage::Text(text),
            Ok(Frame::Binary(data)) => WsMessage::Binary(data),
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Failed to encode server message");
                continue;
            }
        };

        if let Err(e) = sink.send(frame).await {
            tracing::debug!(connection_id = %id, error = %e, "WebSocket write error");
            return;
        }
    }

    let close = async {
        sink.send(WsMessage::Close(None)).await?;
        sink.close().await
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        tracing::debug!(connection_id = %id, "Client did not take the close frame in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TerminalSize;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn request(path: &str, origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(path);
        if let Some(origin) = origin {
            builder = builder.header("Origin", origin);
        }
        builder.body(()).unwrap()
    }

    fn restricted() -> HandshakePolicy {
        HandshakePolicy {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            ..HandshakePolicy::default()
        }
    }

    #[test]
    fn test_default_policy_is_unrestricted() {
        assert!(HandshakePolicy::default().is_unrestricted());
    }

    #[test]
    fn test_terminal_path_accepted_from_any_origin() {
        let policy = HandshakePolicy::default();
        assert!(validate_upgrade(&request(TERMINAL_PATH, None), &policy).is_ok());
        assert!(
            validate_upgrade(&request(TERMINAL_PATH, Some("https://evil.example")), &policy)
                .is_ok()
        );
    }

    #[test]
    fn test_query_string_does_not_change_path() {
        let policy = HandshakePolicy::default();
        let uri = format!("{TERMINAL_PATH}?EIO=4");
        assert!(validate_upgrade(&request(&uri, None), &policy).is_ok());
    }

    #[test]
    fn test_other_paths_rejected() {
        let policy = HandshakePolicy::default();
        let rejection = validate_upgrade(&request("/", None), &policy).unwrap_err();
        assert_eq!(rejection.status, StatusCode::NOT_FOUND);

        let rejection = validate_upgrade(&request("/api/terminal/extra", None), &policy).unwrap_err();
        assert_eq!(rejection.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_allowlist_accepts_listed_origin() {
        let req = request(TERMINAL_PATH, Some("http://localhost:3000"));
        assert!(validate_upgrade(&req, &restricted()).is_ok());
    }

    #[test]
    fn test_allowlist_rejects_other_origin() {
        let req = request(TERMINAL_PATH, Some("https://evil.example"));
        let rejection = validate_upgrade(&req, &restricted()).unwrap_err();
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
        assert_eq!(rejection.body, "Origin not allowed");
    }

    #[test]
    fn test_allowlist_rejects_missing_origin() {
        let rejection = validate_upgrade(&request(TERMINAL_PATH, None), &restricted()).unwrap_err();
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
        assert_eq!(rejection.body, "Origin header missing");
    }

    #[test]
    fn test_rejection_response_status() {
        let response = HandshakeRejection {
            status: StatusCode::FORBIDDEN,
            body: "Origin not allowed",
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_deref(), Some("Origin not allowed"));
    }

    #[tokio::test]
    async fn test_client_frames_reach_endpoint() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let tracker = TaskTracker::new();

        let endpoint = attach(server, "ws-frames".to_string(), &tracker);
        let (_id, mut inbound, _outbound) = endpoint.into_parts();

        client
            .send(WsMessage::Text(
                r#"{"type":"resize","cols":90,"rows":20}"#.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(ClientMessage::Resize(TerminalSize::new(90, 20)))
        );
    }

    #[tokio::test]
    async fn test_pumps_finish_when_session_ends_without_client_close() {
        let (server_io, _client_io) = tokio::io::duplex(64 * 1024);
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let tracker = TaskTracker::new();

        // The client side stays open but never reads or answers the close.
        let endpoint = attach(ws, "ws-idle".to_string(), &tracker);
        drop(endpoint);

        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("frame pumps outlived the session");
    }
}
