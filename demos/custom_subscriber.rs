//! # Example: custom_subscriber
//!
//! Demonstrates how to build and attach a custom event subscriber.
//!
//! Shows how to:
//! - Implement the [`Subscribe`] trait.
//! - Inspect [`Event`] / [`EventKind`] for process lifecycle metrics.
//! - Wire the subscriber into [`Arbiter::with_subscriber`].
//!
//! ## Flow
//! ```text
//! Watcher ──► Bus.publish(Spawn / Reap / Kill / Stop / ...)
//!     └─► event pump (in Arbiter)
//!           └─► SubscriberSet.emit_arc() ──► ChurnMeter.on_event()
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example custom_subscriber
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procvisor::{Arbiter, Command, Config, Event, EventKind, Subscribe, WatcherConfig};

/// Counts process churn. In real life you could export metrics, ship logs,
/// or trigger alerts.
struct ChurnMeter {
    spawned: AtomicUsize,
    reaped: AtomicUsize,
}

#[async_trait::async_trait]
impl Subscribe for ChurnMeter {
    async fn on_event(&self, ev: &Event) {
        let watcher = ev.watcher.as_deref().unwrap_or("<arbiter>");
        match ev.kind {
            EventKind::Spawn => {
                let n = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
                println!("[meter] spawn #{n}: watcher={watcher} pid={:?}", ev.pid);
            }
            EventKind::Reap => {
                let n = self.reaped.fetch_add(1, Ordering::Relaxed) + 1;
                println!("[meter] reap  #{n}: watcher={watcher} pid={:?}", ev.pid);
            }
            EventKind::Stop => {
                println!(
                    "[meter] stop: watcher={watcher} reason={}",
                    ev.reason.as_deref().unwrap_or("<none>")
                );
            }
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        "churn_meter"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // A watcher that exits every couple of seconds, so the meter has
    // something to count.
    let mut config = Config::default();
    config.check_delay = 0.5;
    let mut churn = WatcherConfig::new("churn", "/bin/sleep");
    churn.args = vec!["2".to_string()];
    churn.numprocesses = 2;
    // Exits this frequent are deliberate; keep the crash-loop detector out
    // of the way.
    churn.flapping.active = false;
    config.watchers.push(churn);

    let arbiter = Arbiter::new(config).with_subscriber(Arc::new(ChurnMeter {
        spawned: AtomicUsize::new(0),
        reaped: AtomicUsize::new(0),
    }));
    let handle = arbiter.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let _ = handle.request(Command::Quit).await;
    });

    arbiter.run().await?;
    Ok(())
}
