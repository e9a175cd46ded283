//! Error types used by the procvisor engine.
//!
//! This module defines one error enum per layer:
//!
//! - [`ProcessError`] — OS-level failures on a single child process (spawn, signal, wait).
//! - [`ConfigError`] — configuration loading and reload validation failures.
//! - [`ControlError`] — client-facing command failures (unknown names, rejected operations).
//! - [`PidfileError`] — pid-file creation and ownership failures.
//! - [`SupervisorError`] — failures of the arbiter run loop itself.
//!
//! All types provide helper methods (`as_label`, `as_message`) for logging and
//! structured command replies.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// # Errors produced by operations on a single child process.
///
/// Signal delivery to a process that no longer exists (`ESRCH`) is *not* an
/// error anywhere in the engine — callers swallow it before constructing
/// [`ProcessError::Signal`]. Anything that reaches this enum is a real OS
/// failure.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The OS refused to spawn the process (exec failure, missing binary,
    /// pre-exec stage failure such as setuid).
    #[error("spawn failed: {source}")]
    Spawn {
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Signal delivery failed for a reason other than the target being gone.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target process id.
        pid: i32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// A `waitpid` call failed for a reason other than `ECHILD`.
    #[error("wait failed: {source}")]
    Wait {
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
}

impl ProcessError {
    /// Returns a short stable label (snake_case) for use in logs/replies.
    ///
    /// # Example
    /// ```
    /// use procvisor::ProcessError;
    ///
    /// let err = ProcessError::Spawn {
    ///     source: std::io::Error::from_raw_os_error(2),
    /// };
    /// assert_eq!(err.as_label(), "process_spawn_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::Spawn { .. } => "process_spawn_failed",
            ProcessError::Signal { .. } => "process_signal_failed",
            ProcessError::Wait { .. } => "process_wait_failed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            ProcessError::Spawn { source } => format!("spawn failed: {source}"),
            ProcessError::Signal { pid, source } => {
                format!("signal to pid {pid} failed: {source}")
            }
            ProcessError::Wait { source } => format!("wait failed: {source}"),
        }
    }
}

/// # Errors produced while loading or reconciling configuration.
///
/// [`ConfigError::MissingSocket`] is the reload fail-closed case: it is
/// raised during validation, before any live state has been mutated.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config {path:?}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("cannot parse config: {source}")]
    Parse {
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// Two watchers share a name (names are case-insensitive).
    #[error("duplicate watcher name: {name:?}")]
    DuplicateWatcher {
        /// Offending name, lowercased.
        name: String,
    },

    /// Two sockets share a name (names are case-insensitive).
    #[error("duplicate socket name: {name:?}")]
    DuplicateSocket {
        /// Offending name, lowercased.
        name: String,
    },

    /// A watcher references a socket that the configuration does not define.
    #[error("watcher {watcher:?} references undefined socket {socket:?}")]
    MissingSocket {
        /// Watcher whose command line carries the reference.
        watcher: String,
        /// Name of the missing socket.
        socket: String,
    },

    /// A singleton watcher declares more than one process.
    #[error("singleton watcher {name:?} declares numprocesses = {numprocesses}")]
    SingletonCount {
        /// Offending watcher name.
        name: String,
        /// Declared process count.
        numprocesses: usize,
    },

    /// A stop-signal name could not be parsed.
    #[error("unknown signal name: {name:?}")]
    UnknownSignal {
        /// The name as written in the configuration.
        name: String,
    },

    /// An rlimit key does not name a known resource.
    #[error("unknown rlimit resource: {name:?}")]
    UnknownRlimit {
        /// The key as written in the configuration.
        name: String,
    },

    /// A socket could not be bound.
    #[error("cannot bind socket {name:?}: {source}")]
    Bind {
        /// Socket entry name.
        name: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/replies.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read_failed",
            ConfigError::Parse { .. } => "config_parse_failed",
            ConfigError::DuplicateWatcher { .. } => "config_duplicate_watcher",
            ConfigError::DuplicateSocket { .. } => "config_duplicate_socket",
            ConfigError::MissingSocket { .. } => "config_missing_socket",
            ConfigError::SingletonCount { .. } => "config_singleton_count",
            ConfigError::UnknownSignal { .. } => "config_unknown_signal",
            ConfigError::UnknownRlimit { .. } => "config_unknown_rlimit",
            ConfigError::Bind { .. } => "config_bind_failed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors returned to command clients.
///
/// These are validation failures surfaced synchronously to the caller of a
/// control operation. They never crash the management tick. Replies carry
/// [`ControlError::as_label`] as the machine-readable code and
/// [`ControlError::as_message`] as the reason string.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ControlError {
    /// No watcher registered under this name.
    #[error("unknown watcher: {name:?}")]
    UnknownWatcher {
        /// Requested name, as given by the client.
        name: String,
    },

    /// No socket registered under this name.
    #[error("unknown socket: {name:?}")]
    UnknownSocket {
        /// Requested name, as given by the client.
        name: String,
    },

    /// The option key is not a mutable watcher option.
    #[error("unknown option: {key:?}")]
    UnknownOption {
        /// Requested option key.
        key: String,
    },

    /// The option value could not be parsed for this key.
    #[error("invalid value {value:?} for option {key:?}")]
    InvalidOptionValue {
        /// Option key the value was meant for.
        key: String,
        /// The rejected value, as given by the client.
        value: String,
    },

    /// The watcher holds no process with this pid.
    #[error("watcher {name:?} has no process with pid {pid}")]
    UnknownProcess {
        /// Watcher that was addressed.
        name: String,
        /// Pid that was not found.
        pid: i32,
    },

    /// Scaling a singleton watcher away from exactly one process was refused.
    #[error("watcher {name:?} is a singleton")]
    Singleton {
        /// The singleton watcher.
        name: String,
    },

    /// The signal number does not map to a known signal.
    #[error("invalid signal number: {signum}")]
    InvalidSignal {
        /// Number as given by the client.
        signum: i32,
    },

    /// A watcher with this name already exists.
    #[error("watcher already exists: {name:?}")]
    AlreadyExists {
        /// The conflicting name, lowercased.
        name: String,
    },

    /// An OS-level process failure bubbled up from the addressed watcher.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A configuration failure bubbled up from a reload or add operation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine is gone; no further commands can be served.
    #[error("control channel closed")]
    Closed,
}

impl ControlError {
    /// Returns a short stable label (snake_case) for use in logs/replies.
    ///
    /// # Example
    /// ```
    /// use procvisor::ControlError;
    ///
    /// let err = ControlError::UnknownWatcher { name: "web".into() };
    /// assert_eq!(err.as_label(), "unknown_watcher");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ControlError::UnknownWatcher { .. } => "unknown_watcher",
            ControlError::UnknownSocket { .. } => "unknown_socket",
            ControlError::UnknownOption { .. } => "unknown_option",
            ControlError::InvalidOptionValue { .. } => "invalid_option_value",
            ControlError::UnknownProcess { .. } => "unknown_process",
            ControlError::Singleton { .. } => "singleton",
            ControlError::InvalidSignal { .. } => "invalid_signal",
            ControlError::AlreadyExists { .. } => "watcher_exists",
            ControlError::Process(e) => e.as_label(),
            ControlError::Config(e) => e.as_label(),
            ControlError::Closed => "control_closed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors produced while managing the pid file.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PidfileError {
    /// The pid file exists and its recorded pid is still alive.
    #[error("pid file {path:?} is owned by live pid {owner}")]
    Stale {
        /// Path of the conflicting pid file.
        path: PathBuf,
        /// Pid recorded in the file.
        owner: i32,
    },

    /// Reading or writing the pid file failed.
    #[error("pid file {path:?}: {source}")]
    Io {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// # Errors produced by the arbiter run loop.
///
/// These are fatal to the supervisor: startup aborts and `run()` returns.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The pid file could not be claimed at startup.
    #[error(transparent)]
    Pidfile(#[from] PidfileError),

    /// Initial configuration was rejected or a socket could not be bound.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::Pidfile(_) => "supervisor_pidfile",
            SupervisorError::Config(e) => e.as_label(),
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}
