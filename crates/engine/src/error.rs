use thiserror::Error;

/// Failure talking to the backing feed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Unexpected failure pushing a payload to a recipient.
///
/// A recipient with no open connection is not a transport error; gateways
/// report that as `Ok(false)`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Outbound queue full for recipient {0}")]
    QueueFull(i64),

    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("No connection of recipient {0} confirmed the write in time")]
    Unconfirmed(i64),
}

/// Fault raised by a poll cycle. Store faults trigger backoff, transport
/// faults are retried on the next cycle; neither stops the poller.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
