//! Feed storage: selecting pending rows and writing acknowledgments.

use async_trait::async_trait;
use sqlx::PgPool;

use herald_common::types::{FeedDescriptor, Notification};

use crate::error::StoreError;

/// Persistent side of a feed.
///
/// Implementations are shared by every poller task and must be safe for
/// concurrent use.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// All rows of the feed that are not yet marked delivered.
    async fn fetch_pending(&self, feed: &FeedDescriptor) -> Result<Vec<Notification>, StoreError>;

    /// Mark one row delivered.
    ///
    /// Returns `Ok(false)` if the row no longer matches the pending predicate,
    /// e.g. it was already acknowledged elsewhere.
    async fn acknowledge(
        &self,
        feed: &FeedDescriptor,
        notification_id: i64,
    ) -> Result<bool, StoreError>;
}

/// SQL text for one feed.
///
/// Table and column names come from a validated [`FeedDescriptor`] and are
/// interpolated directly; row values are always bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQueries {
    pub select_pending: String,
    pub mark_delivered: String,
}

impl FeedQueries {
    pub fn for_feed(feed: &FeedDescriptor) -> Self {
        let select_pending = format!(
            "SELECT {id}::BIGINT AS id, {recipient}::BIGINT AS recipient_id, \
             {sender}::BIGINT AS sender_id, {payload}::TEXT AS payload, {seen} AS delivered \
             FROM {table} WHERE {seen} = false ORDER BY {id}",
            id = feed.id_field,
            recipient = feed.recipient_field,
            sender = feed.sender_field,
            payload = feed.payload_field,
            seen = feed.delivered_field,
            table = feed.feed_name,
        );

        let mark_delivered = format!(
            "UPDATE {table} SET {seen} = true WHERE {id} = $1 AND {seen} = false",
            table = feed.feed_name,
            seen = feed.delivered_field,
            id = feed.id_field,
        );

        Self {
            select_pending,
            mark_delivered,
        }
    }
}

/// PostgreSQL-backed feed store.
#[derive(Debug, Clone)]
pub struct PgFeedStore {
    pool: PgPool,
}

impl PgFeedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn fetch_pending(&self, feed: &FeedDescriptor) -> Result<Vec<Notification>, StoreError> {
        let queries = FeedQueries::for_feed(feed);

        let rows: Vec<Notification> = sqlx::query_as(&queries.select_pending)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn acknowledge(
        &self,
        feed: &FeedDescriptor,
        notification_id: i64,
    ) -> Result<bool, StoreError> {
        let queries = FeedQueries::for_feed(feed);

        let result = sqlx::query(&queries.mark_delivered)
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
