//! # Lifecycle events emitted by the arbiter and its watchers.
//!
//! The [`EventKind`] enum classifies event types across three categories:
//! - **Process events**: per-child lifecycle (spawn, reap, kill, expired)
//! - **Watcher events**: group lifecycle (start, stop, restart, reload, updated, add, remove)
//! - **Subscriber events**: fan-out diagnostics (overflow, panic)
//!
//! The [`Event`] struct carries the watcher scope plus optional metadata such
//! as the worker id, the OS pid, and a human-readable reason.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use procvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::Spawn)
//!     .with_watcher("web")
//!     .with_wid(3)
//!     .with_pid(4242);
//!
//! assert_eq!(ev.kind, EventKind::Spawn);
//! assert_eq!(ev.watcher.as_deref(), Some("web"));
//! assert_eq!(ev.action(), "spawn");
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Process events ===
    /// A watcher spawned a new child process.
    ///
    /// Sets:
    /// - `watcher`: owning watcher name
    /// - `wid`: worker id of the new child
    /// - `pid`: OS pid of the new child
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Spawn,

    /// A dead child was reaped and removed from its watcher.
    ///
    /// Sets:
    /// - `watcher`: owning watcher name
    /// - `wid`: worker id of the reaped child
    /// - `pid`: OS pid of the reaped child
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Reap,

    /// A live child was deliberately terminated (shrink, replacement).
    ///
    /// Sets:
    /// - `watcher`: owning watcher name
    /// - `wid`: worker id of the killed child
    /// - `pid`: OS pid of the killed child
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Kill,

    /// A child exceeded its configured maximum age and was recycled.
    ///
    /// Sets:
    /// - `watcher`: owning watcher name
    /// - `wid`: worker id of the expired child
    /// - `pid`: OS pid of the expired child
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Expired,

    // === Watcher events ===
    /// A watcher started spawning toward its target count.
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Start,

    /// A watcher stopped; all of its processes are gone.
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `reason`: optional detail (e.g. flapping verdict, spawn exhaustion)
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Stop,

    /// A watcher completed a stop/start cycle.
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Restart,

    /// A watcher completed a rolling reload (or delivered SIGHUP in place).
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Reload,

    /// A watcher option was changed at runtime.
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `reason`: the option key that changed
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Updated,

    /// A watcher was registered with the arbiter.
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Add,

    /// A watcher was removed from the arbiter.
    ///
    /// Sets:
    /// - `watcher`: watcher name
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    Remove,

    // === Subscriber events ===
    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `watcher`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    SubscriberOverflow,

    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `watcher`: subscriber name
    /// - `reason`: panic info/message
    /// - `at`: wall-clock timestamp
    /// - `seq`: global sequence
    SubscriberPanicked,
}

impl EventKind {
    /// Returns the action name used in published topics and log lines.
    pub fn as_action(&self) -> &'static str {
        match self {
            EventKind::Spawn => "spawn",
            EventKind::Reap => "reap",
            EventKind::Kill => "kill",
            EventKind::Expired => "expired",
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Restart => "restart",
            EventKind::Reload => "reload",
            EventKind::Updated => "updated",
            EventKind::Add => "add",
            EventKind::Remove => "remove",
            EventKind::SubscriberOverflow => "subscriber_overflow",
            EventKind::SubscriberPanicked => "subscriber_panicked",
        }
    }
}

/// Lifecycle event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - `watcher`: scope of the event; `None` means the arbiter itself
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,

    /// Scope: the watcher this event concerns, if any.
    pub watcher: Option<Arc<str>>,
    /// Worker id within the watcher, if applicable.
    pub wid: Option<u64>,
    /// OS pid, if applicable.
    pub pid: Option<i32>,
    /// Human-readable reason (flapping verdicts, changed option keys, etc.).
    pub reason: Option<Arc<str>>,
    /// Event classification.
    pub kind: EventKind,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            watcher: None,
            wid: None,
            pid: None,
            reason: None,
            kind,
        }
    }

    /// Attaches the watcher scope.
    #[inline]
    pub fn with_watcher(mut self, watcher: impl Into<Arc<str>>) -> Self {
        self.watcher = Some(watcher.into());
        self
    }

    /// Attaches a worker id.
    #[inline]
    pub fn with_wid(mut self, wid: u64) -> Self {
        self.wid = Some(wid);
        self
    }

    /// Attaches an OS pid.
    #[inline]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Returns the action name for this event (e.g. `"spawn"`).
    #[inline]
    pub fn action(&self) -> &'static str {
        self.kind.as_action()
    }

    /// Returns the publish topic, `watcher.<name>.<action>` or `arbiter.<action>`.
    pub fn topic(&self) -> String {
        match &self.watcher {
            Some(w) => format!("watcher.{w}.{}", self.action()),
            None => format!("arbiter.{}", self.action()),
        }
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_watcher(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_watcher(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_monotonic() {
        let a = Event::new(EventKind::Spawn);
        let b = Event::new(EventKind::Reap);
        assert!(b.seq > a.seq, "later events must carry larger sequence numbers");
    }

    #[test]
    fn topic_includes_watcher_scope() {
        let ev = Event::new(EventKind::Reap).with_watcher("web");
        assert_eq!(ev.topic(), "watcher.web.reap");

        let ev = Event::new(EventKind::Start);
        assert_eq!(ev.topic(), "arbiter.start");
    }

    #[test]
    fn builders_set_payload_fields() {
        let ev = Event::new(EventKind::Kill)
            .with_watcher("db")
            .with_wid(7)
            .with_pid(1234)
            .with_reason("shrinking");
        assert_eq!(ev.wid, Some(7));
        assert_eq!(ev.pid, Some(1234));
        assert_eq!(ev.reason.as_deref(), Some("shrinking"));
    }
}
