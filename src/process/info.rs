//! # Point-in-time resource usage for one worker.
//!
//! [`ProcessInfo`] is the payload behind the `stats` command: everything a
//! client needs to render one process line. Metrics that cannot be read
//! (permission denied, process raced away) are `None`, never an error — a
//! stats call over a busy watcher must not fail because one worker died
//! mid-collection.

use serde::Serialize;

/// Resource usage snapshot for a single worker process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// OS pid.
    pub pid: i32,
    /// Worker id within the owning watcher.
    pub wid: u64,
    /// Command line the worker was started with.
    pub cmdline: String,
    /// CPU usage in percent since the previous refresh; `None` if unreadable.
    pub cpu_percent: Option<f32>,
    /// Resident memory in bytes; `None` if unreadable.
    pub memory_bytes: Option<u64>,
    /// Seconds the OS has seen this process running; `None` if unreadable.
    pub uptime_secs: Option<u64>,
    /// Seconds since the watcher spawned this worker.
    pub age_secs: f64,
    /// Direct OS children of the worker.
    pub children: Vec<i32>,
}
