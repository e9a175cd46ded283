//! # procvisor
//!
//! **Procvisor** is an async process supervision engine for Unix.
//!
//! It runs groups of identical worker processes ("watchers"), keeps them at
//! their target count, detects crash loops, shares pre-bound listening
//! sockets with workers, and reconciles its whole state against a new
//! configuration without dropping capacity. The crate is designed as a
//! building block for daemons and service managers.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │WatcherConfig │   │WatcherConfig │   │ SocketConfig │
//!     │  ("web" ×4)  │   │ ("worker"×2) │   │   ("http")   │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Arbiter (run loop, sole owner of supervision state)              │
//! │  - SocketRegistry (pre-bound listeners, fd placeholders)          │
//! │  - FlappingDetector (crash-loop windows + cooldown timers)        │
//! │  - Pidfile (single-instance guard)                                │
//! │  - mpsc control channel (ControlHandle clients)                   │
//! └──────┬──────────────────┬─────────────────────────────────┬───────┘
//!        ▼                  ▼                                 │
//!     ┌──────────────┐   ┌──────────────┐                     │
//!     │   Watcher    │   │   Watcher    │                     │
//!     │ ChildHandle  │   │ ChildHandle  │                     │
//!     │ ChildHandle  │   │ ChildHandle  │                     │
//!     └┬─────────────┘   └┬─────────────┘                     │
//!      │ Publishes        │ Publishes                         │
//!      │ Events:          │ Events:                           │
//!      │ - Spawn / Reap   │ - Start / Stop                    │
//!      │ - Kill / Expired │ - Reload / Updated                │
//!      ▼                  ▼                                   ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! │                   (capacity: Config::bus_capacity)                │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                          ┌──────────────────┐
//!                          │    event pump    │
//!                          │   (in Arbiter)   │
//!                          └────────┬─────────┘
//!                                   ▼
//!                             SubscriberSet
//!                            (per-sub queues)
//!                         ┌─────────┼─────────┐
//!                         ▼         ▼         ▼
//!                         worker1  worker2  workerN
//!                         ▼         ▼         ▼
//!                    sub1.on   sub2.on   subN.on
//!                     _event()  _event()  _event()
//! ```
//!
//! ### Management tick
//! ```text
//! every check_delay seconds, unless a command is being served:
//!
//!   ├─► waitpid(-1, WNOHANG) until drained   (single global reaper)
//!   │     └─ route each exit to the owning watcher by pid
//!   ├─► for every watcher (parallel, isolated):
//!   │     ├─ reap dead children        ─► Reap events
//!   │     ├─ recycle aged workers      ─► Expired events (max_age)
//!   │     ├─ spawn up to numprocesses  ─► Spawn events
//!   │     └─ evict excess, lowest wid  ─► Kill events
//!   ├─► flapping verdicts per watcher:
//!   │     ├─ Healthy   ─► reset counters
//!   │     ├─ Retry     ─► stop watcher, restart after retry_in
//!   │     └─ Exhausted ─► stop watcher, stays down
//!   └─► wake stopped on-demand watchers with a pending connection
//! ```
//!
//! ## Features
//! | Area              | Description                                                        | Key types / traits                  |
//! |-------------------|--------------------------------------------------------------------|-------------------------------------|
//! | **Supervision**   | Watcher groups, spawn/reap/scale, escalating stop.                 | [`Arbiter`], [`Config`]             |
//! | **Control**       | Typed runtime commands with synchronous replies.                   | [`ControlHandle`], [`Command`]      |
//! | **Sockets**       | Pre-bound listeners inherited by workers via fd placeholders.      | [`SocketConfig`]                    |
//! | **Crash loops**   | Sliding-window flapping detection with retry budget.               | `flapping` table in watcher config  |
//! | **Hot reload**    | Config diffing: in-place rescale, delete-before-add, fail closed.  | [`Command::ReloadConfig`]           |
//! | **Subscriber API**| Hook into lifecycle events (logging, metrics, custom subscribers). | [`Subscribe`], [`Event`]            |
//! | **Errors**        | Typed errors per layer with stable labels.                         | [`ControlError`], [`ProcessError`]  |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use procvisor::{Arbiter, Command, Config, LogWriter, WatcherConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     let mut web = WatcherConfig::new("web", "/usr/bin/my-server");
//!     web.numprocesses = 4;
//!     config.watchers.push(web);
//!
//!     let arbiter = Arbiter::new(config).with_subscriber(Arc::new(LogWriter::new()));
//!     let handle = arbiter.handle();
//!
//!     tokio::spawn(async move {
//!         // Scale up later, from anywhere holding a handle.
//!         let _ = handle.request(Command::Incr { name: "web".into(), count: 2 }).await;
//!     });
//!
//!     // Runs until SIGINT/SIGTERM/SIGQUIT or a Quit command.
//!     arbiter.run().await?;
//!     Ok(())
//! }
//! ```

mod arbiter;
mod config;
mod control;
mod error;
mod events;
mod flapping;
mod pidfile;
mod process;
mod shutdown;
mod sockets;
mod subscribers;
mod watcher;

// ---- Public re-exports ----

pub use arbiter::Arbiter;
pub use config::{Config, FlappingConfig, WatcherConfig};
pub use control::{Command, ControlHandle, Reply, SignalTarget, WatcherStats, WatcherSummary};
pub use error::{ConfigError, ControlError, PidfileError, ProcessError, SupervisorError};
pub use events::{Bus, Event, EventKind};
pub use process::{ChildSpec, ExitOutcome, ProcessInfo};
pub use sockets::SocketConfig;
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
