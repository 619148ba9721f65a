//! # Event subscribers for runners.
//!
//! This module provides the [`Subscribe`] trait, the fan-out [`SubscriberSet`]
//! and the built-in [`LogWriter`] that turns lifecycle events into `tracing` records.
//!
//! ## Architecture
//! ```text
//! Lifecycle ── publish(Event) ──► Bus ──► listener (spawned by run) ──► SubscriberSet
//!                                                                         │
//!                                                         ┌───────────────┼──────────┐
//!                                                         ▼               ▼          ▼
//!                                                     LogWriter       Metrics     Custom
//! ```
//!
//! ## Implementing custom subscribers
//! ```no_run
//! use runvisor::{Subscribe, Event, EventKind};
//! use async_trait::async_trait;
//!
//! struct Restarts;
//!
//! #[async_trait]
//! impl Subscribe for Restarts {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::BackoffScheduled {
//!             // increment restart counter
//!         }
//!     }
//! }
//! ```

mod log;
mod set;
mod subscriber;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
