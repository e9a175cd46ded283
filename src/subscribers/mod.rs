//! # Event subscribers for the procvisor engine.
//!
//! This module provides the [`Subscribe`] trait and built-in implementations
//! for handling lifecycle events broadcast through the [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   Watcher ── publish(Event) ──► Bus ──► arbiter event listener
//!                                             │
//!                                             ▼
//!                                       SubscriberSet::emit
//!                                             │
//!                                     ┌───────┼─────────┐
//!                                     ▼       ▼         ▼
//!                                 LogWriter  Metrics  Custom ...
//! ```
//!
//! ## Implementing custom subscribers
//! ```no_run
//! use procvisor::{Event, EventKind, Subscribe};
//! use async_trait::async_trait;
//!
//! struct ReapCounter;
//!
//! #[async_trait]
//! impl Subscribe for ReapCounter {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::Reap {
//!             // increment a counter
//!         }
//!     }
//!     fn name(&self) -> &'static str { "reap_counter" }
//! }
//! ```

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
