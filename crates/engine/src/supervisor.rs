//! Lifecycle of all feed pollers as a unit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::types::{FeedDescriptor, PollerStatus};

use crate::gateway::DeliveryGateway;
use crate::poller::ChangeFeedPoller;
use crate::store::FeedStore;

/// Launches one [`ChangeFeedPoller`] task per feed.
pub struct PollerSupervisor {
    store: Arc<dyn FeedStore>,
    gateway: Arc<dyn DeliveryGateway>,
    cancel: CancellationToken,
}

impl PollerSupervisor {
    pub fn new(store: Arc<dyn FeedStore>, gateway: Arc<dyn DeliveryGateway>) -> Self {
        Self {
            store,
            gateway,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the pollers to an outer shutdown signal as well as to
    /// [`SupervisorHandle::stop`].
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Validate every feed, then spawn one poller per feed.
    ///
    /// Nothing is spawned if any descriptor is invalid or two feeds share a name.
    pub fn start(self, feeds: Vec<FeedDescriptor>) -> Result<SupervisorHandle, AppError> {
        for (i, feed) in feeds.iter().enumerate() {
            feed.validate()?;
            if feeds[..i].iter().any(|f| f.same_table(feed)) {
                return Err(AppError::Config(format!(
                    "Feed '{}' is configured more than once",
                    feed.feed_name
                )));
            }
        }

        let mut pollers = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let name = feed.feed_name.clone();
            let poller = ChangeFeedPoller::new(feed, self.store.clone(), self.gateway.clone());
            let status = poller.subscribe();
            let handle = tokio::spawn(poller.run(self.cancel.child_token()));
            pollers.push(PollerTask {
                feed: name,
                status,
                handle,
            });
        }

        tracing::info!(feeds = pollers.len(), "Feed pollers launched");

        Ok(SupervisorHandle {
            cancel: self.cancel,
            pollers,
        })
    }
}

struct PollerTask {
    feed: String,
    status: watch::Receiver<PollerStatus>,
    handle: JoinHandle<()>,
}

/// Handle to the running pollers, used for status and shutdown.
pub struct SupervisorHandle {
    cancel: CancellationToken,
    pollers: Vec<PollerTask>,
}

impl SupervisorHandle {
    pub fn feeds(&self) -> Vec<String> {
        self.pollers.iter().map(|p| p.feed.clone()).collect()
    }

    /// Read-only view of every poller's published status.
    pub fn status_board(&self) -> FeedStatusBoard {
        FeedStatusBoard {
            feeds: Arc::new(
                self.pollers
                    .iter()
                    .map(|p| (p.feed.clone(), p.status.clone()))
                    .collect(),
            ),
        }
    }

    /// Signal cancellation and wait up to `timeout` for every poller to stop.
    ///
    /// Pollers finish the row they are delivering before stopping. Pollers
    /// still running at the deadline are reported, not aborted.
    pub async fn stop(self, timeout: Duration) -> StopReport {
        tracing::info!(
            feeds = self.pollers.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Stopping feed pollers"
        );
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = StopReport::default();

        for task in self.pollers {
            match tokio::time::timeout_at(deadline, task.handle).await {
                Ok(Ok(())) => report.stopped.push(task.feed),
                Ok(Err(e)) => {
                    tracing::error!(feed = %task.feed, error = %e, "Feed poller task failed");
                    report.failed.push(task.feed);
                }
                Err(_) => {
                    tracing::error!(
                        feed = %task.feed,
                        "Feed poller did not stop within the shutdown timeout"
                    );
                    report.timed_out.push(task.feed);
                }
            }
        }

        report
    }
}

/// Outcome of [`SupervisorHandle::stop`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<String>,
    /// Still running when the deadline passed.
    pub timed_out: Vec<String>,
    /// Task panicked or was aborted.
    pub failed: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.failed.is_empty()
    }
}

/// Cheaply cloneable, read-only access to the pollers' statuses.
#[derive(Clone, Default)]
pub struct FeedStatusBoard {
    feeds: Arc<Vec<(String, watch::Receiver<PollerStatus>)>>,
}

impl FeedStatusBoard {
    pub fn snapshot(&self) -> Vec<PollerStatus> {
        self.feeds.iter().map(|(_, rx)| rx.borrow().clone()).collect()
    }

    pub fn get(&self, feed: &str) -> Option<PollerStatus> {
        self.feeds
            .iter()
            .find(|(name, _)| name == feed)
            .map(|(_, rx)| rx.borrow().clone())
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

impl FromIterator<(String, watch::Receiver<PollerStatus>)> for FeedStatusBoard {
    fn from_iter<I: IntoIterator<Item = (String, watch::Receiver<PollerStatus>)>>(iter: I) -> Self {
        Self {
            feeds: Arc::new(iter.into_iter().collect()),
        }
    }
}
