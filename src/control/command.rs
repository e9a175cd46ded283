//! The closed command vocabulary and its typed replies.

use std::collections::BTreeMap;

use crate::config::{Config, WatcherConfig};
use crate::process::ProcessInfo;
use crate::sockets::SocketConfig;

/// Where a signal command is aimed inside one watcher.
///
/// With only `name` set the signal goes to every worker. `pid` narrows it to
/// one worker, `children` to that worker's direct OS children, and
/// `child_pid` to one specific OS child.
#[derive(Debug, Clone)]
pub struct SignalTarget {
    /// Watcher name.
    pub name: String,
    /// One worker pid, if narrowing.
    pub pid: Option<i32>,
    /// Address the worker's direct OS children instead of the worker.
    pub children: bool,
    /// One specific OS child of `pid`.
    pub child_pid: Option<i32>,
    /// Signal number to deliver.
    pub signum: i32,
}

/// Everything a client can ask the arbiter to do.
#[derive(Debug, Clone)]
pub enum Command {
    /// Register a new watcher at runtime, optionally starting it.
    AddWatcher {
        /// Full definition of the new watcher.
        config: WatcherConfig,
        /// Start it immediately after registration.
        start: bool,
    },
    /// Unregister a watcher. With `nostop` its processes are left running
    /// and orphaned.
    RmWatcher {
        /// Watcher to remove.
        name: String,
        /// Skip the stop; abandon the processes.
        nostop: bool,
    },
    /// Start one watcher, or every stopped watcher when `name` is `None`.
    Start {
        /// Target watcher, or all.
        name: Option<String>,
    },
    /// Stop one watcher (or all), with escalating signals.
    Stop {
        /// Target watcher, or all.
        name: Option<String>,
    },
    /// Stop-then-start one watcher (or all).
    Restart {
        /// Target watcher, or all.
        name: Option<String>,
    },
    /// Rolling reload of one watcher (or all). `graceful = false` degrades
    /// to a restart.
    Reload {
        /// Target watcher, or all.
        name: Option<String>,
        /// Keep capacity at target during the swap.
        graceful: bool,
    },
    /// Reconcile the whole arbiter against a new configuration.
    ReloadConfig {
        /// The already-loaded replacement configuration.
        config: Box<Config>,
    },
    /// Raise a watcher's target process count.
    Incr {
        /// Target watcher.
        name: String,
        /// How many processes to add.
        count: usize,
    },
    /// Lower a watcher's target process count.
    Decr {
        /// Target watcher.
        name: String,
        /// How many processes to remove.
        count: usize,
    },
    /// Deliver a signal to processes of one watcher.
    Signal(SignalTarget),
    /// Change one mutable watcher option and apply its follow-up action.
    SetOption {
        /// Target watcher.
        name: String,
        /// Option key.
        key: String,
        /// New value, as a string.
        value: String,
    },
    /// Read one watcher option back.
    GetOption {
        /// Target watcher.
        name: String,
        /// Option key.
        key: String,
    },
    /// List every mutable option of one watcher with current values.
    Options {
        /// Target watcher.
        name: String,
    },
    /// List watchers, or the pids of one watcher when `name` is set.
    List {
        /// Watcher to list pids for, or `None` for the watcher overview.
        name: Option<String>,
    },
    /// Pids of every watcher, grouped by watcher name.
    ListPids,
    /// Resource usage of one watcher's processes, or of all watchers.
    Stats {
        /// Target watcher, or all.
        name: Option<String>,
    },
    /// Names and definitions of every bound socket.
    ListSockets,
    /// Bind and register a new socket at runtime.
    AddSocket {
        /// Definition of the socket to bind.
        config: SocketConfig,
    },
    /// Close and unregister a socket.
    RmSocket {
        /// Socket to remove.
        name: String,
    },
    /// Number of registered watchers.
    NumWatchers,
    /// Number of live processes, of one watcher or in total.
    NumProcesses {
        /// Target watcher, or all.
        name: Option<String>,
    },
    /// The arbiter-level settings currently in force.
    GlobalOptions,
    /// Shut the arbiter down (stop everything, then exit the run loop).
    Quit,
}

/// One row of the `list` overview.
#[derive(Debug, Clone)]
pub struct WatcherSummary {
    /// Watcher name.
    pub name: String,
    /// `"active"` or `"stopped"`.
    pub status: &'static str,
    /// Configured target process count.
    pub numprocesses: usize,
    /// Pids currently tracked.
    pub pids: Vec<i32>,
}

/// Resource usage of one watcher's processes.
#[derive(Debug, Clone)]
pub struct WatcherStats {
    /// Watcher name.
    pub name: String,
    /// Per-process usage snapshots.
    pub processes: Vec<ProcessInfo>,
}

/// Successful command results.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The command completed with nothing to report.
    Ok,
    /// A single numeric result (`incr`, `numwatchers`, ...).
    Count(usize),
    /// A single string result (`get`).
    Value(String),
    /// Key/value listing (`options`, `globaloptions`).
    Options(Vec<(String, String)>),
    /// Watcher overview (`list`).
    Watchers(Vec<WatcherSummary>),
    /// Pids of one watcher (`list <name>`).
    Pids(Vec<i32>),
    /// Pids grouped by watcher (`listpids`).
    PidMap(BTreeMap<String, Vec<i32>>),
    /// Resource usage (`stats`).
    Stats(Vec<WatcherStats>),
    /// Bound socket definitions (`listsockets`).
    Sockets(Vec<SocketConfig>),
}
