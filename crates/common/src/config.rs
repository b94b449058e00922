use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::types::FeedDescriptor;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP / WebSocket server binds to
    pub server_host: String,

    /// Port the HTTP / WebSocket server binds to
    pub server_port: u16,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Feeds to poll, fully resolved against the timing defaults below
    pub feeds: Vec<FeedDescriptor>,

    /// How long shutdown waits for pollers to stop, in milliseconds
    pub shutdown_timeout_ms: u64,

    /// Outbound message queue capacity per WebSocket connection
    pub ws_queue_size: usize,

    /// How long a delivery waits for a connection to confirm the write, in milliseconds
    pub delivery_timeout_ms: u64,
}

/// Timing applied to every feed that does not override it.
#[derive(Debug, Clone, Copy)]
pub struct FeedDefaults {
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for FeedDefaults {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = FeedDefaults {
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", 5000u64)?),
            backoff_initial: Duration::from_millis(env_parse("BACKOFF_INITIAL_MS", 1000u64)?),
            backoff_max: Duration::from_millis(env_parse("BACKOFF_MAX_MS", 60_000u64)?),
        };

        let feeds_var = std::env::var("HERALD_FEEDS")
            .unwrap_or_else(|_| "notifications:notification_id:message_text".to_string());
        let feeds = parse_feeds(&feeds_var, defaults)?;

        Ok(Self {
            server_host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env_parse("SERVER_PORT", 8080u16)?,
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: env_parse_nonzero("DB_MAX_CONNECTIONS", 10u32)?,
            feeds,
            shutdown_timeout_ms: env_parse("SHUTDOWN_TIMEOUT_MS", 10_000u64)?,
            ws_queue_size: env_parse_nonzero("WS_QUEUE_SIZE", 64usize)?,
            delivery_timeout_ms: env_parse_nonzero("DELIVERY_TIMEOUT_MS", 5000u64)?,
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    parse_var(name, std::env::var(name).ok().as_deref(), default)
}

fn env_parse_nonzero<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialEq + Default,
{
    parse_nonzero_var(name, std::env::var(name).ok().as_deref(), default)
}

fn parse_var<T: FromStr>(name: &str, raw: Option<&str>, default: T) -> anyhow::Result<T> {
    match raw {
        Some(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())
        }),
        None => Ok(default),
    }
}

/// Like [`parse_var`], for sizes where zero would be unusable at runtime.
fn parse_nonzero_var<T>(name: &str, raw: Option<&str>, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialEq + Default,
{
    let value = parse_var(name, raw, default)?;
    if value == T::default() {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(value)
}

/// Parse a feed list of the form
/// `table:id_column:payload_column[:poll_interval_ms]`, entries separated by `;`.
///
/// Every resulting descriptor is validated; duplicate feed names are rejected.
pub fn parse_feeds(list: &str, defaults: FeedDefaults) -> Result<Vec<FeedDescriptor>, AppError> {
    let mut feeds: Vec<FeedDescriptor> = Vec::new();

    for entry in list.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let (table, id, payload, interval) = match parts.as_slice() {
            [table, id, payload] => (*table, *id, *payload, None),
            [table, id, payload, interval] => (*table, *id, *payload, Some(*interval)),
            _ => {
                return Err(AppError::Config(format!(
                    "Invalid feed entry '{}', expected \
                     table:id_column:payload_column[:poll_interval_ms]",
                    entry
                )));
            }
        };

        let poll_interval = match interval {
            Some(raw) => Duration::from_millis(raw.parse().map_err(|_| {
                AppError::Config(format!(
                    "Feed '{}': poll interval '{}' is not a number of milliseconds",
                    table, raw
                ))
            })?),
            None => defaults.poll_interval,
        };

        let feed = FeedDescriptor::new(table, id, payload)
            .with_poll_interval(poll_interval)
            .with_backoff(defaults.backoff_initial, defaults.backoff_max);
        feed.validate()?;

        if feeds.iter().any(|f| f.same_table(&feed)) {
            return Err(AppError::Config(format!(
                "Feed '{}' is configured more than once",
                feed.feed_name
            )));
        }
        feeds.push(feed);
    }

    if feeds.is_empty() {
        return Err(AppError::Config("No feeds configured".to_string()));
    }

    Ok(feeds)
}
