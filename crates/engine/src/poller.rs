//! Per-feed poll / deliver / acknowledge loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use herald_common::types::{FeedDescriptor, Notification, PollerPhase, PollerStatus};

use crate::backoff::Backoff;
use crate::error::PollError;
use crate::gateway::DeliveryGateway;
use crate::store::FeedStore;

/// A row-level failure. The row stays pending and is retried by a later fetch.
#[derive(Debug)]
pub struct RowFault {
    pub notification_id: i64,
    pub error: PollError,
}

/// Outcome of a single fetch / deliver / acknowledge pass.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub fetched: usize,
    /// Rows the gateway confirmed as pushed.
    pub delivered: usize,
    pub acknowledged: usize,
    /// Pushed rows whose acknowledgment matched nothing (already acked elsewhere).
    pub already_acknowledged: usize,
    /// Rows whose recipient had no active target.
    pub offline: usize,
    pub faults: Vec<RowFault>,
    /// Cancellation was observed before every fetched row was processed.
    pub interrupted: bool,
}

impl CycleReport {
    /// True when no row hit a transport or acknowledgment fault.
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }

    /// Rows whose push failed. These are retried on the normal schedule.
    pub fn transport_faults(&self) -> usize {
        self.faults
            .iter()
            .filter(|f| matches!(f.error, PollError::Transport(_)))
            .count()
    }

    /// A write to the store failed, so the store itself is suspect and the
    /// poller backs off.
    pub fn has_store_fault(&self) -> bool {
        self.faults
            .iter()
            .any(|f| matches!(f.error, PollError::Store(_)))
    }
}

/// State owned by the running loop and never shared.
struct PollerState {
    backoff: Backoff,
}

/// Polls one feed until cancelled.
///
/// Delivery is at-least-once: a row is acknowledged only after the gateway
/// confirmed the push, and a failed acknowledgment leaves it pending so it is
/// pushed again on a later cycle.
pub struct ChangeFeedPoller {
    feed: FeedDescriptor,
    store: Arc<dyn FeedStore>,
    gateway: Arc<dyn DeliveryGateway>,
    state: PollerState,
    status: watch::Sender<PollerStatus>,
}

impl ChangeFeedPoller {
    pub fn new(
        feed: FeedDescriptor,
        store: Arc<dyn FeedStore>,
        gateway: Arc<dyn DeliveryGateway>,
    ) -> Self {
        let backoff = Backoff::new(feed.backoff_initial, feed.backoff_max);
        let (status, _) = watch::channel(PollerStatus::new(&feed.feed_name, backoff.current()));

        Self {
            feed,
            store,
            gateway,
            state: PollerState { backoff },
            status,
        }
    }

    pub fn feed(&self) -> &FeedDescriptor {
        &self.feed
    }

    /// Watch the poller's published status.
    pub fn subscribe(&self) -> watch::Receiver<PollerStatus> {
        self.status.subscribe()
    }

    /// Start the polling loop. Returns only once `cancel` has been observed.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.status.send_modify(|s| s.running = true);

        tracing::info!(
            feed = %self.feed.feed_name,
            poll_interval_ms = self.feed.poll_interval.as_millis() as u64,
            "Feed poller started"
        );

        while !cancel.is_cancelled() {
            self.set_phase(PollerPhase::Polling);

            let (delay, phase) = match self.run_cycle(&cancel).await {
                Ok(report) if !report.has_store_fault() => {
                    if !report.is_clean() {
                        tracing::warn!(
                            feed = %self.feed.feed_name,
                            transport_faults = report.transport_faults(),
                            acknowledged = report.acknowledged,
                            "Poll cycle finished with undelivered rows, retrying next cycle"
                        );
                    } else if report.fetched > 0 {
                        tracing::debug!(
                            feed = %self.feed.feed_name,
                            fetched = report.fetched,
                            acknowledged = report.acknowledged,
                            offline = report.offline,
                            "Poll cycle complete"
                        );
                    }
                    self.state.backoff.reset();
                    self.record_cycle(&report, None);
                    (self.feed.poll_interval, PollerPhase::Sleeping)
                }
                Ok(report) => {
                    let last = report
                        .faults
                        .iter()
                        .rev()
                        .find(|f| matches!(f.error, PollError::Store(_)))
                        .map(|f| f.error.to_string());
                    tracing::warn!(
                        feed = %self.feed.feed_name,
                        faults = report.faults.len(),
                        acknowledged = report.acknowledged,
                        backoff_ms = self.state.backoff.current().as_millis() as u64,
                        "Failed to record deliveries, backing off"
                    );
                    self.record_cycle(&report, last);
                    (self.state.backoff.next_delay(), PollerPhase::BackingOff)
                }
                Err(e) => {
                    tracing::warn!(
                        feed = %self.feed.feed_name,
                        error = %e,
                        backoff_ms = self.state.backoff.current().as_millis() as u64,
                        "Error during polling, backing off"
                    );
                    self.record_cycle(&CycleReport::default(), Some(e.to_string()));
                    (self.state.backoff.next_delay(), PollerPhase::BackingOff)
                }
            };

            self.set_phase(phase);
            if !Self::pause(delay, &cancel).await {
                break;
            }
        }

        self.status.send_modify(|s| {
            s.running = false;
            s.phase = PollerPhase::Stopped;
        });
        tracing::info!(feed = %self.feed.feed_name, "Feed poller stopped");
    }

    /// Run one fetch / deliver / acknowledge pass.
    ///
    /// Rows are handled strictly one after another. Cancellation aborts the
    /// fetch, and is checked between rows, but never interrupts a row whose
    /// delivery has started.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, PollError> {
        let mut report = CycleReport::default();

        let pending = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.interrupted = true;
                return Ok(report);
            }
            result = self.store.fetch_pending(&self.feed) => result?,
        };

        report.fetched = pending.len();
        if pending.is_empty() {
            return Ok(report);
        }

        self.set_phase(PollerPhase::Delivering);

        for notification in &pending {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            self.process(notification, &mut report).await;
        }

        Ok(report)
    }

    async fn process(&self, notification: &Notification, report: &mut CycleReport) {
        let feed = &self.feed.feed_name;

        match self
            .gateway
            .deliver(notification.recipient_id, &notification.payload)
            .await
        {
            Ok(true) => {
                report.delivered += 1;
                match self.store.acknowledge(&self.feed, notification.id).await {
                    Ok(true) => report.acknowledged += 1,
                    Ok(false) => {
                        tracing::debug!(
                            feed = %feed,
                            notification_id = notification.id,
                            "Notification already acknowledged"
                        );
                        report.already_acknowledged += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            feed = %feed,
                            notification_id = notification.id,
                            error = %e,
                            "Failed to mark notification as delivered, it will be sent again"
                        );
                        report.faults.push(RowFault {
                            notification_id: notification.id,
                            error: e.into(),
                        });
                    }
                }
            }
            Ok(false) => {
                tracing::debug!(
                    feed = %feed,
                    notification_id = notification.id,
                    recipient_id = notification.recipient_id,
                    "Recipient not connected, notification left pending"
                );
                report.offline += 1;
            }
            Err(e) => {
                tracing::warn!(
                    feed = %feed,
                    notification_id = notification.id,
                    recipient_id = notification.recipient_id,
                    error = %e,
                    "Error sending notification"
                );
                report.faults.push(RowFault {
                    notification_id: notification.id,
                    error: e.into(),
                });
            }
        }
    }

    /// Sleep for `delay`. Returns `false` if cancelled first.
    async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_phase(&self, phase: PollerPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    fn record_cycle(&self, report: &CycleReport, error: Option<String>) {
        let backoff_ms = self.state.backoff.current().as_millis() as u64;
        self.status.send_modify(|s| {
            s.cycles += 1;
            s.delivered_total += report.delivered as u64;
            s.last_cycle_at = Some(Utc::now());
            s.current_backoff_ms = backoff_ms;
            match error {
                Some(e) => {
                    s.consecutive_failures += 1;
                    s.last_error = Some(e);
                }
                None => s.consecutive_failures = 0,
            }
        });
    }
}
