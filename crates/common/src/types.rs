use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Longest identifier Postgres accepts without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// A row read from a notification feed.
///
/// Rows handed to the engine are always pending (`delivered == false`); the
/// only transition the engine ever causes is `false → true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub recipient_id: i64,
    pub sender_id: Option<i64>,
    pub payload: String,
    pub delivered: bool,
}

/// Identifies one notification source (a table) and how to poll it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedDescriptor {
    /// Table name. Also used as the feed's name in logs and status output.
    pub feed_name: String,
    pub id_field: String,
    pub payload_field: String,
    pub recipient_field: String,
    pub sender_field: String,
    /// Boolean "seen" marker flipped on acknowledgment.
    pub delivered_field: String,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub backoff_initial: Duration,
    #[serde(with = "duration_ms")]
    pub backoff_max: Duration,
}

impl FeedDescriptor {
    pub const DEFAULT_RECIPIENT_FIELD: &str = "receiver_id";
    pub const DEFAULT_SENDER_FIELD: &str = "sender_id";
    pub const DEFAULT_DELIVERED_FIELD: &str = "is_seen";

    /// Descriptor with the default column names, a 5s poll interval and a
    /// 1s..60s backoff.
    pub fn new(
        feed_name: impl Into<String>,
        id_field: impl Into<String>,
        payload_field: impl Into<String>,
    ) -> Self {
        Self {
            feed_name: feed_name.into(),
            id_field: id_field.into(),
            payload_field: payload_field.into(),
            recipient_field: Self::DEFAULT_RECIPIENT_FIELD.to_string(),
            sender_field: Self::DEFAULT_SENDER_FIELD.to_string(),
            delivered_field: Self::DEFAULT_DELIVERED_FIELD.to_string(),
            poll_interval: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Override the recipient, sender and delivered-marker column names.
    pub fn with_columns(
        mut self,
        recipient_field: impl Into<String>,
        sender_field: impl Into<String>,
        delivered_field: impl Into<String>,
    ) -> Self {
        self.recipient_field = recipient_field.into();
        self.sender_field = sender_field.into();
        self.delivered_field = delivered_field.into();
        self
    }

    /// Check the descriptor before any poller is launched.
    ///
    /// Table and column names end up interpolated into SQL, so each one must
    /// be a plain identifier.
    pub fn validate(&self) -> Result<(), AppError> {
        for (what, name) in [
            ("feed name", &self.feed_name),
            ("id field", &self.id_field),
            ("payload field", &self.payload_field),
            ("recipient field", &self.recipient_field),
            ("sender field", &self.sender_field),
            ("delivered field", &self.delivered_field),
        ] {
            if !is_identifier(name) {
                return Err(AppError::Config(format!(
                    "Feed '{}': {} '{}' is not a valid SQL identifier",
                    self.feed_name, what, name
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(AppError::Config(format!(
                "Feed '{}': poll interval must be greater than zero",
                self.feed_name
            )));
        }
        if self.backoff_initial.is_zero() {
            return Err(AppError::Config(format!(
                "Feed '{}': initial backoff must be greater than zero",
                self.feed_name
            )));
        }
        if self.backoff_max < self.backoff_initial {
            return Err(AppError::Config(format!(
                "Feed '{}': max backoff ({:?}) is below initial backoff ({:?})",
                self.feed_name, self.backoff_max, self.backoff_initial
            )));
        }

        Ok(())
    }

    /// Whether both descriptors poll the same table. Postgres folds unquoted
    /// identifiers to lowercase, so the comparison ignores ASCII case.
    pub fn same_table(&self, other: &FeedDescriptor) -> bool {
        self.feed_name.eq_ignore_ascii_case(&other.feed_name)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Coarse lifecycle phase of a feed poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerPhase {
    Idle,
    Polling,
    Delivering,
    Sleeping,
    BackingOff,
    Stopped,
}

impl std::fmt::Display for PollerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerPhase::Idle => write!(f, "idle"),
            PollerPhase::Polling => write!(f, "polling"),
            PollerPhase::Delivering => write!(f, "delivering"),
            PollerPhase::Sleeping => write!(f, "sleeping"),
            PollerPhase::BackingOff => write!(f, "backing_off"),
            PollerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Read-only snapshot a poller publishes after every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerStatus {
    pub feed: String,
    pub phase: PollerPhase,
    /// Set while the poll loop is alive, cleared once it has exited.
    pub running: bool,
    pub current_backoff_ms: u64,
    pub consecutive_failures: u32,
    pub cycles: u64,
    pub delivered_total: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PollerStatus {
    pub fn new(feed: impl Into<String>, current_backoff: Duration) -> Self {
        Self {
            feed: feed.into(),
            phase: PollerPhase::Idle,
            running: false,
            current_backoff_ms: current_backoff.as_millis() as u64,
            consecutive_failures: 0,
            cycles: 0,
            delivered_total: 0,
            last_cycle_at: None,
            last_error: None,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptor_is_valid() {
        let feed = FeedDescriptor::new("notifications", "notification_id", "message_text");
        assert!(feed.validate().is_ok());
        assert_eq!(feed.recipient_field, "receiver_id");
        assert_eq!(feed.delivered_field, "is_seen");
    }

    #[test]
    fn test_rejects_injected_identifier() {
        let feed = FeedDescriptor::new("notifications; DROP TABLE users", "id", "body");
        let err = feed.validate().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("feed name"));

        let feed = FeedDescriptor::new("notifications", "1id", "body");
        assert!(feed.validate().is_err());

        let feed = FeedDescriptor::new("notifications", "id", "");
        assert!(feed.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_timing() {
        let feed = FeedDescriptor::new("n", "id", "body").with_poll_interval(Duration::ZERO);
        assert!(feed.validate().is_err());

        let feed = FeedDescriptor::new("n", "id", "body")
            .with_backoff(Duration::from_secs(10), Duration::from_secs(5));
        let err = feed.validate().unwrap_err();
        assert!(err.to_string().contains("max backoff"));

        let feed = FeedDescriptor::new("n", "id", "body")
            .with_backoff(Duration::ZERO, Duration::from_secs(5));
        assert!(feed.validate().is_err());
    }

    #[test]
    fn test_same_table_ignores_case() {
        let lower = FeedDescriptor::new("notifications", "id", "body");
        let upper = FeedDescriptor::new("Notifications", "id", "body");
        let other = FeedDescriptor::new("request_notification_log", "id", "body");
        assert!(lower.same_table(&upper));
        assert!(!lower.same_table(&other));
    }

    #[test]
    fn test_descriptor_serializes_durations_as_millis() {
        let feed = FeedDescriptor::new("n", "id", "body");
        let json = serde_json::to_value(&feed).unwrap();
        assert_eq!(json["poll_interval"], 5000);
        assert_eq!(json["backoff_max"], 60000);
    }

    #[test]
    fn test_phase_display_matches_serde() {
        for phase in [
            PollerPhase::Idle,
            PollerPhase::Polling,
            PollerPhase::Delivering,
            PollerPhase::Sleeping,
            PollerPhase::BackingOff,
            PollerPhase::Stopped,
        ] {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json.as_str().unwrap(), phase.to_string());
        }
    }
}
