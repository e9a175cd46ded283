//! # LogWriter — structured lifecycle logging.
//!
//! [`LogWriter`] renders every lifecycle event through `tracing`, one line per
//! event, carrying the watcher scope and any process identifiers as fields.
//!
//! ## Output shape
//! ```text
//! INFO spawn watcher=web wid=3 pid=4242
//! INFO reap watcher=web wid=3 pid=4242
//! WARN stop watcher=web reason="flapping: retry in 7s"
//! ```
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use procvisor::{Arbiter, Config, LogWriter};
//!
//! let arbiter = Arbiter::new(Config::default()).with_subscriber(Arc::new(LogWriter::new()));
//! ```

use async_trait::async_trait;
use tracing::{info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event-to-log subscriber.
///
/// Subscriber-level diagnostics (`SubscriberOverflow`, `SubscriberPanicked`)
/// and stops carrying a reason are logged at `warn`, everything else at `info`.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let watcher = e.watcher.as_deref().unwrap_or("arbiter");
        match e.kind {
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                warn!(
                    subscriber = watcher,
                    reason = e.reason.as_deref().unwrap_or("unknown"),
                    "{}",
                    e.action(),
                );
            }
            EventKind::Stop if e.reason.is_some() => {
                warn!(
                    watcher,
                    reason = e.reason.as_deref().unwrap_or(""),
                    "{}",
                    e.action(),
                );
            }
            _ => {
                info!(
                    watcher,
                    wid = e.wid,
                    pid = e.pid,
                    reason = e.reason.as_deref(),
                    "{}",
                    e.action(),
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "log_writer"
    }
}
