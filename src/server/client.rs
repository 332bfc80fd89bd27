use std::{fmt, net::SocketAddr, sync::Arc};

use axum::{extract::ws::Message, http::HeaderMap};
use dashmap::DashMap;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::server::message::ServerMessage;

/// Header carrying the original client address when behind a proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Key used to rate limit a client.
///
/// Taken from the first `X-Forwarded-For` entry when present, otherwise
/// from the peer IP address of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(Arc<str>);

impl ClientIdentity {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn from_request(headers: &HeaderMap, peer: SocketAddr) -> Self {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        match forwarded {
            Some(first) => Self::new(first),
            None => Self::new(peer.ip().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound handle for a connected client.
///
/// Frames are queued on an unbounded channel and written by a dedicated task,
/// so sending never blocks the session loop.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier for the client.
    pub id: Uuid,
    identity: ClientIdentity,
    sender: mpsc::UnboundedSender<Message>,
}

impl Client {
    /// Creates a client whose frames are written to `writer` by a spawned task.
    #[instrument(skip(writer))]
    pub fn spawn<S>(identity: ClientIdentity, writer: S) -> Self
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        let (client, mut receiver) = Self::detached(identity);

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = receiver.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = writer.send(msg).await {
                    error!("Failed to send message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        client
    }

    /// Creates a client whose frames are delivered to the returned receiver.
    pub fn detached(identity: ClientIdentity) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = Client {
            id: Uuid::new_v4(),
            identity,
            sender,
        };
        (client, receiver)
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Queues a raw frame.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::SendFailed` if the writer has gone away.
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        self.sender.send(message).map_err(|_| {
            debug!(client = %self.id, "Outbound queue closed");
            ClientError::SendFailed
        })
    }

    /// Encodes and queues a protocol message.
    pub fn send_message(&self, message: &ServerMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(message).map_err(|e| ClientError::Encode(e.to_string()))?;
        self.send(Message::Text(json))
    }

    /// Checks if the client's writer is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queues a close frame. Errors are ignored since the peer may already be gone.
    pub fn close(&self) {
        let _ = self.sender.send(Message::Close(None));
    }
}

/// Manages the set of open sessions.
#[derive(Clone, Default)]
pub struct ClientManager {
    /// A concurrent map storing active clients.
    clients: Arc<DashMap<Uuid, Client>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Client) {
        self.clients.insert(client.id, client);
    }

    pub fn remove(&self, id: &Uuid) {
        self.clients.remove(id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Cleans up clients whose writer has stopped.
    pub fn cleanup(&self) {
        self.clients.retain(|_, client| {
            let connected = client.is_connected();
            if !connected {
                debug!("Removing disconnected client: {}", client.id);
            }
            connected
        });
    }

    /// Sends a close frame to every open session.
    pub fn close_all(&self) {
        self.clients.iter().for_each(|entry| entry.value().close());
    }
}

/// Represents errors that may occur in client operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send message")]
    SendFailed,
    #[error("Failed to encode message: {0}")]
    Encode(String),
}
