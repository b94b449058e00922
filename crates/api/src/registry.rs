//! Registry of open WebSocket connections, keyed by user.
//!
//! This is the delivery gateway the feed pollers push through: a recipient is
//! online while at least one of its connections is registered here.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use herald_engine::error::TransportError;
use herald_engine::gateway::DeliveryGateway;

use crate::message::ServerMessage;

/// Default wait for a connection's writer to confirm a notification.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for a connection's writer.
///
/// Notifications carry a receipt. The writer completes it once the frame has
/// been written to the socket; dropping it unanswered means the frame was lost.
#[derive(Debug)]
pub struct Outbound {
    pub message: ServerMessage,
    receipt: Option<oneshot::Sender<()>>,
}

impl Outbound {
    fn with_receipt(message: ServerMessage) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let outbound = Self {
            message,
            receipt: Some(tx),
        };
        (outbound, rx)
    }

    /// Report the frame as written.
    pub fn confirm(self) {
        if let Some(receipt) = self.receipt {
            let _ = receipt.send(());
        }
    }
}

impl From<ServerMessage> for Outbound {
    fn from(message: ServerMessage) -> Self {
        Self {
            message,
            receipt: None,
        }
    }
}

#[derive(Debug)]
struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
}

/// Active connections by user ID.
#[derive(Debug)]
pub struct ConnectionRegistry {
    users: DashMap<i64, Vec<Connection>>,
    confirm_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Register a connection for `user_id`. Messages for the user are queued
    /// on `sender`.
    pub fn register(&self, user_id: i64, sender: mpsc::Sender<Outbound>) -> ConnectionId {
        let id = ConnectionId::generate();
        self.users
            .entry(user_id)
            .or_default()
            .push(Connection { id, sender });
        id
    }

    pub fn unregister(&self, user_id: i64, id: ConnectionId) {
        if let Some(mut conns) = self.users.get_mut(&user_id) {
            conns.retain(|c| c.id != id);
        }
        self.users.remove_if(&user_id, |_, conns| conns.is_empty());
    }

    /// Drop every connection. Their outbound queues close once the socket
    /// tasks release their own senders.
    pub fn clear(&self) {
        self.users.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|e| e.value().len()).sum()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.users.get(&user_id).is_some_and(|c| !c.is_empty())
    }
}

#[async_trait]
impl DeliveryGateway for ConnectionRegistry {
    /// Push the payload to every connection of the recipient and wait for at
    /// least one writer to confirm it reached the socket.
    async fn deliver(&self, recipient_id: i64, payload: &str) -> Result<bool, TransportError> {
        // Clone the senders out so no map shard lock is held while sending.
        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> =
            match self.users.get(&recipient_id) {
                Some(conns) => conns.iter().map(|c| (c.id, c.sender.clone())).collect(),
                None => return Ok(false),
            };

        let message = ServerMessage::GeneralNotification {
            message: payload.to_string(),
        };

        let mut receipts = Vec::with_capacity(targets.len());
        let mut full = 0usize;
        let mut closed = Vec::new();

        for (id, sender) in targets {
            let (outbound, receipt) = Outbound::with_receipt(message.clone());
            match sender.try_send(outbound) {
                Ok(()) => receipts.push((id, receipt)),
                Err(TrySendError::Full(_)) => full += 1,
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        let mut confirmed = false;
        let mut unconfirmed = 0usize;

        for (id, receipt) in receipts {
            match tokio::time::timeout_at(deadline, receipt).await {
                Ok(Ok(())) => {
                    confirmed = true;
                    break;
                }
                // The writer gave up on its socket with the frame still queued.
                Ok(Err(_)) => closed.push(id),
                Err(_) => unconfirmed += 1,
            }
        }

        for id in closed {
            tracing::debug!(recipient_id, connection_id = %id, "Pruning closed connection");
            self.unregister(recipient_id, id);
        }

        if confirmed {
            tracing::debug!(recipient_id, "Sent general notification");
            Ok(true)
        } else if full > 0 {
            Err(TransportError::QueueFull(recipient_id))
        } else if unconfirmed > 0 {
            Err(TransportError::Unconfirmed(recipient_id))
        } else {
            Ok(false)
        }
    }
}
