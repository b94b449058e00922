//! Change-feed polling and delivery engine.
//!
//! One [`poller::ChangeFeedPoller`] per feed repeatedly fetches pending rows
//! from a [`store::FeedStore`], pushes each to its recipient through a
//! [`gateway::DeliveryGateway`], and acknowledges the row only once the push
//! was confirmed. [`supervisor::PollerSupervisor`] runs the pollers as a unit.

pub mod backoff;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod store;
pub mod supervisor;
