//! Transport endpoints.
//!
//! A [`TransportEndpoint`] is the server's view of one client connection:
//! an inbound channel of validated [`ClientMessage`]s and an outbound channel
//! of [`ServerMessage`]s. The inbound channel closing means the client
//! disconnected. Concrete transports (see [`websocket`]) pump frames into and
//! out of these channels; [`TransportEndpoint::pair`] builds an in-memory
//! endpoint for embedding and tests.

pub mod websocket;

use protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;

use crate::session::ConnectionId;

/// Default channel capacity for endpoint queues.
pub const CHANNEL_CAPACITY: usize = 256;

/// Server side of a client connection.
pub struct TransportEndpoint {
    id: ConnectionId,
    inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl TransportEndpoint {
    /// Wraps existing channels.
    pub fn new(
        id: ConnectionId,
        inbound: mpsc::Receiver<ClientMessage>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            inbound,
            outbound,
        }
    }

    /// Creates a connected in-memory endpoint and its client side.
    pub fn pair(id: ConnectionId) -> (Self, RemoteEndpoint) {
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self::new(id, input_rx, output_tx),
            RemoteEndpoint {
                input: input_tx,
                output: output_rx,
            },
        )
    }

    /// The connection identity.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Splits into identity, inbound receiver, and outbound sender.
    pub fn into_parts(
        self,
    ) -> (
        ConnectionId,
        mpsc::Receiver<ClientMessage>,
        mpsc::Sender<ServerMessage>,
    ) {
        (self.id, self.inbound, self.outbound)
    }
}

/// Client side of an in-memory endpoint.
///
/// Dropping it (or calling [`RemoteEndpoint::disconnect`]) is a disconnect.
pub struct RemoteEndpoint {
    input: mpsc::Sender<ClientMessage>,
    output: mpsc::Receiver<ServerMessage>,
}

impl RemoteEndpoint {
    /// Sends a message to the server. Returns false once the session is gone.
    pub async fn send(&self, message: ClientMessage) -> bool {
        self.input.send(message).await.is_ok()
    }

    /// Receives the next server message, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.output.recv().await
    }

    /// Ends the connection.
    pub fn disconnect(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ExitInfo, TerminalSize};

    #[tokio::test]
    async fn test_pair_carries_messages_both_ways() {
        let (endpoint, mut remote) = TransportEndpoint::pair("conn".to_string());
        assert_eq!(endpoint.id(), "conn");
        let (_, mut inbound, outbound) = endpoint.into_parts();

        assert!(
            remote
                .send(ClientMessage::Resize(TerminalSize::new(90, 20)))
                .await
        );
        assert_eq!(
            inbound.recv().await,
            Some(ClientMessage::Resize(TerminalSize::new(90, 20)))
        );

        outbound
            .send(ServerMessage::Exit(ExitInfo::code(0)))
            .await
            .unwrap();
        assert_eq!(
            remote.recv().await,
            Some(ServerMessage::Exit(ExitInfo::code(0)))
        );
    }

    #[tokio::test]
    async fn test_disconnect_closes_inbound() {
        let (endpoint, remote) = TransportEndpoint::pair("conn".to_string());
        let (_, mut inbound, _outbound) = endpoint.into_parts();

        remote.disconnect();
        assert_eq!(inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_server_side_dropped() {
        let (endpoint, mut remote) = TransportEndpoint::pair("conn".to_string());
        drop(endpoint);

        assert!(!remote.send(ClientMessage::Input(b"ls\n".to_vec())).await);
        assert_eq!(remote.recv().await, None);
    }
}
