//! # Example: basic_watcher
//!
//! Minimal example: supervise one group of worker processes until Ctrl-C.
//!
//! Demonstrates how to:
//! - Define a watcher with [`WatcherConfig`].
//! - Run it under [`Arbiter`] with the built-in [`LogWriter`] subscriber.
//! - Exit cleanly on SIGINT/SIGTERM.
//!
//! ## Flow
//! ```text
//! WatcherConfig ──► Arbiter::run()
//!     ├─► Watcher::start()
//!     │     ├─► spawn ×numprocesses  ─► Spawn events
//!     │     └─► manage every check_delay (reap + respawn)
//!     └─► SIGINT/SIGTERM
//!           ├─► stop watchers (escalating signals)
//!           └─► exit
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example basic_watcher
//! ```

use std::sync::Arc;
use procvisor::{Arbiter, Config, LogWriter, WatcherConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // 1. Build configuration: two sleepers, checked every half second
    let mut config = Config::default();
    config.check_delay = 0.5;

    let mut workers = WatcherConfig::new("sleepers", "/bin/sleep");
    workers.args = vec!["60".to_string()];
    workers.numprocesses = 2;
    workers.stop_signal = "SIGTERM".to_string();
    config.watchers.push(workers);

    // 2. Create the arbiter with a logging subscriber
    let arbiter = Arbiter::new(config).with_subscriber(Arc::new(LogWriter::new()));

    // 3. Run until a shutdown signal; kill a sleeper from another terminal
    //    and watch it come back
    arbiter.run().await?;
    Ok(())
}
