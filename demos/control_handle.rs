//! # Example: control_handle
//!
//! Drives a running arbiter through its typed command surface.
//!
//! Shows how to:
//! - Get a [`ControlHandle`] before `run()` and use it from another task.
//! - Scale a watcher with [`Command::Incr`] / [`Command::Decr`].
//! - Inspect state with [`Command::List`] and [`Command::NumProcesses`].
//! - Shut the arbiter down with [`Command::Quit`].
//!
//! ## Flow
//! ```text
//! ControlHandle ──► mpsc ──► arbiter run loop
//!     request(Incr)  ──► watcher spawns up    ──► Reply::Count
//!     request(List)  ──► snapshot of watchers ──► Reply::Watchers
//!     request(Quit)  ──► teardown             ──► Reply::Ok, run() returns
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example control_handle
//! ```

use std::time::Duration;
use procvisor::{Arbiter, Command, Config, Reply, WatcherConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    config.check_delay = 0.2;
    let mut web = WatcherConfig::new("web", "/bin/sleep");
    web.args = vec!["60".to_string()];
    web.stop_signal = "SIGTERM".to_string();
    config.watchers.push(web);

    let arbiter = Arbiter::new(config);
    let handle = arbiter.handle();

    let client = tokio::spawn(async move {
        // Give startup a moment.
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Scale up to three processes.
        if let Reply::Count(n) = handle
            .request(Command::Incr { name: "web".into(), count: 2 })
            .await?
        {
            println!("[client] web scaled to {n}");
        }

        if let Reply::Watchers(list) = handle.request(Command::List { name: None }).await? {
            for w in list {
                println!(
                    "[client] {} [{}] target={} pids={:?}",
                    w.name, w.status, w.numprocesses, w.pids
                );
            }
        }

        // Back down to one, then shut everything off.
        handle
            .request(Command::Decr { name: "web".into(), count: 2 })
            .await?;
        if let Reply::Count(n) = handle.request(Command::NumProcesses { name: None }).await? {
            println!("[client] {n} processes left");
        }
        handle.request(Command::Quit).await?;
        Ok::<_, procvisor::ControlError>(())
    });

    arbiter.run().await?;
    client.await??;
    Ok(())
}
