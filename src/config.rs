//! # Supervisor configuration.
//!
//! Provides [`Config`] (global options plus the declared watchers and
//! sockets) and [`WatcherConfig`] (everything one watcher needs). Both are
//! plain serde structs loadable from TOML:
//!
//! ```toml
//! check_delay = 1.0
//!
//! [[sockets]]
//! name = "web"
//! host = "127.0.0.1"
//! port = 8080
//!
//! [[watchers]]
//! name = "web"
//! cmd = "serve"
//! args = ["--fd", "$(procvisor.sockets.web)"]
//! numprocesses = 4
//! ```
//!
//! Config is used in two ways:
//! 1. **Startup**: `Arbiter::new(config)` builds the initial socket
//!    registry and watcher set from it.
//! 2. **Reload diffing**: the arbiter keeps the last-applied `Config` as a
//!    snapshot and diffs a freshly parsed one against it (see
//!    [`WatcherConfig::diff`] and [`Config::global_differs`]).
//!
//! ## Sentinel values
//! - `warmup_delay = 0.0` → no pause between spawns
//! - `max_age = 0` → no age-based recycling
//! - durations are plain `f64` seconds

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::process::{parse_rlimit, parse_signal};
use crate::sockets::{referenced_sockets, SocketConfig};

/// Environment keys whose changes never mark a watcher as changed during
/// reload diffing. These leak in from the shell that edited the config and
/// say nothing about the worker.
pub const NOISY_ENV_KEYS: &[&str] = &["PWD", "OLDPWD", "SHLVL", "_"];

/// Outcome of diffing one watcher's options against a newer definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherDiff {
    /// Nothing meaningful changed.
    Unchanged,
    /// Only the target process count moved; mutate it in place, no restart.
    NumprocessesOnly,
    /// Anything else changed; the watcher must be deleted and re-added.
    Changed,
}

/// Global configuration for the supervision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Management tick interval in seconds.
    #[serde(default = "default_check_delay")]
    pub check_delay: f64,

    /// Pause between starting consecutive watchers, in seconds.
    #[serde(default)]
    pub warmup_delay: f64,

    /// Capacity of the event bus ring buffer (min 1, clamped by the bus).
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Control channel queue depth.
    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,

    /// Optional pid file claimed at startup, removed on clean exit.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Declared sockets, bound before any watcher starts.
    #[serde(default)]
    pub sockets: Vec<SocketConfig>,

    /// Declared watchers.
    #[serde(default)]
    pub watchers: Vec<WatcherConfig>,
}

fn default_check_delay() -> f64 {
    1.0
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_control_capacity() -> usize {
    64
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `check_delay = 1s` (management tick)
    /// - `warmup_delay = 0s` (no pause between watcher starts)
    /// - `bus_capacity = 1024`
    /// - `control_capacity = 64`
    /// - no pidfile, no sockets, no watchers
    fn default() -> Self {
        Self {
            check_delay: default_check_delay(),
            warmup_delay: 0.0,
            bus_capacity: default_bus_capacity(),
            control_capacity: default_control_capacity(),
            pidfile: None,
            sockets: Vec::new(),
            watchers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates internal consistency: unique case-insensitive names, socket
    /// references resolvable, signal and rlimit names parseable.
    ///
    /// This is the reload fail-closed gate: a new config that does not pass
    /// here never touches live state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut socket_names = Vec::new();
        for s in &self.sockets {
            let name = s.name.to_lowercase();
            if socket_names.contains(&name) {
                return Err(ConfigError::DuplicateSocket { name });
            }
            socket_names.push(name);
        }

        let mut watcher_names = Vec::new();
        for w in &self.watchers {
            let name = w.name.to_lowercase();
            if watcher_names.contains(&name) {
                return Err(ConfigError::DuplicateWatcher { name });
            }
            watcher_names.push(name);

            w.validate()?;
            for socket in w.referenced_sockets() {
                if !socket_names.contains(&socket) {
                    return Err(ConfigError::MissingSocket {
                        watcher: w.name.clone(),
                        socket,
                    });
                }
            }
        }
        Ok(())
    }

    /// Management tick interval as a [`Duration`].
    #[inline]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_delay.max(0.01))
    }

    /// Warmup pause between watcher starts.
    #[inline]
    pub fn warmup(&self) -> Duration {
        Duration::from_secs_f64(self.warmup_delay.max(0.0))
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// True when the arbiter-level options (everything outside
    /// watchers/sockets) differ. A reload seeing this restarts everything.
    pub fn global_differs(&self, other: &Config) -> bool {
        let a = Config {
            sockets: Vec::new(),
            watchers: Vec::new(),
            ..self.clone()
        };
        let b = Config {
            sockets: Vec::new(),
            watchers: Vec::new(),
            ..other.clone()
        };
        a != b
    }

    /// Looks up a watcher definition by case-insensitive name.
    pub fn watcher(&self, name: &str) -> Option<&WatcherConfig> {
        self.watchers
            .iter()
            .find(|w| w.name.eq_ignore_ascii_case(name))
    }

    /// Looks up a socket definition by case-insensitive name.
    pub fn socket(&self, name: &str) -> Option<&SocketConfig> {
        self.sockets
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// Definition of one watcher: a named group of identical worker processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Unique name, compared case-insensitively across the arbiter.
    pub name: String,

    /// Program to execute (or the command string when `shell` is set).
    pub cmd: String,

    /// Arguments; socket placeholders are substituted at spawn time.
    #[serde(default)]
    pub args: Vec<String>,

    /// Target number of worker processes.
    #[serde(default = "default_numprocesses")]
    pub numprocesses: usize,

    /// Pause between consecutive spawns, in seconds.
    #[serde(default)]
    pub warmup_delay: f64,

    /// Bounded wait during graceful stop before escalating to SIGKILL,
    /// in seconds.
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: f64,

    /// Signal sent during a graceful stop (name, e.g. `"quit"` or
    /// `"SIGTERM"`).
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Also deliver the stop signal to each worker's direct OS children.
    #[serde(default)]
    pub stop_children: bool,

    /// Spawn-failure budget per `spawn_processes` call; exhausting it stops
    /// the whole watcher.
    #[serde(default = "default_max_retry")]
    pub max_retry: usize,

    /// Respawn workers that exit. `false` makes workers one-shot.
    #[serde(default = "default_true")]
    pub respawn: bool,

    /// Exactly one process, enforced at the command layer.
    #[serde(default)]
    pub singleton: bool,

    /// Spawn only once a referenced socket has a connection waiting.
    #[serde(default)]
    pub on_demand: bool,

    /// Start ordering: higher starts earlier, stops later.
    #[serde(default)]
    pub priority: i32,

    /// Start this watcher when the arbiter starts.
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// Reload delivers SIGHUP in place instead of a rolling restart.
    #[serde(default)]
    pub send_hup: bool,

    /// Recycle workers older than this many seconds (0 = never).
    #[serde(default)]
    pub max_age: u64,

    /// Random extra seconds added to `max_age` per worker, spreading the
    /// recycling out.
    #[serde(default = "default_max_age_variance")]
    pub max_age_variance: u64,

    /// Run the command through `/bin/sh -c`.
    #[serde(default)]
    pub shell: bool,

    /// Working directory for workers.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Environment overrides for workers.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Run workers as this uid.
    #[serde(default)]
    pub uid: Option<u32>,

    /// Run workers as this gid.
    #[serde(default)]
    pub gid: Option<u32>,

    /// Resource limits by name (`nofile`, `core`, ...), soft = hard = value.
    #[serde(default)]
    pub rlimits: BTreeMap<String, u64>,

    /// Flapping detection tuning; read per check (late binding).
    #[serde(default)]
    pub flapping: FlappingConfig,
}

fn default_numprocesses() -> usize {
    1
}

fn default_graceful_timeout() -> f64 {
    30.0
}

fn default_stop_signal() -> String {
    "SIGQUIT".to_string()
}

fn default_max_retry() -> usize {
    5
}

fn default_max_age_variance() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl WatcherConfig {
    /// Creates a definition with defaults, ready to be tweaked field-wise.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            numprocesses: default_numprocesses(),
            warmup_delay: 0.0,
            graceful_timeout: default_graceful_timeout(),
            stop_signal: default_stop_signal(),
            stop_children: false,
            max_retry: default_max_retry(),
            respawn: true,
            singleton: false,
            on_demand: false,
            priority: 0,
            autostart: true,
            send_hup: false,
            max_age: 0,
            max_age_variance: default_max_age_variance(),
            shell: false,
            working_dir: None,
            env: BTreeMap::new(),
            uid: None,
            gid: None,
            rlimits: BTreeMap::new(),
            flapping: FlappingConfig::default(),
        }
    }

    /// Checks that names used in this definition resolve to real signals and
    /// rlimit resources, and that a singleton declares at most one process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_signal(&self.stop_signal).is_none() {
            return Err(ConfigError::UnknownSignal {
                name: self.stop_signal.clone(),
            });
        }
        for key in self.rlimits.keys() {
            if parse_rlimit(key).is_none() {
                return Err(ConfigError::UnknownRlimit { name: key.clone() });
            }
        }
        if self.singleton && self.numprocesses > 1 {
            return Err(ConfigError::SingletonCount {
                name: self.name.clone(),
                numprocesses: self.numprocesses,
            });
        }
        Ok(())
    }

    /// Socket names referenced by the command line and arguments.
    pub fn referenced_sockets(&self) -> Vec<String> {
        let mut names = referenced_sockets(&self.cmd);
        for arg in &self.args {
            for name in referenced_sockets(arg) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Warmup pause between spawns.
    #[inline]
    pub fn warmup(&self) -> Duration {
        Duration::from_secs_f64(self.warmup_delay.max(0.0))
    }

    /// Graceful-stop deadline.
    #[inline]
    pub fn graceful(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_timeout.max(0.0))
    }

    /// Diffs this definition against a newer one with the same name.
    ///
    /// Noisy environment keys ([`NOISY_ENV_KEYS`]) are ignored. A change
    /// confined to `numprocesses` mutates in place on reload; anything else
    /// forces delete-then-add.
    pub fn diff(&self, new: &WatcherConfig) -> WatcherDiff {
        let mut a = self.clone();
        let mut b = new.clone();
        for key in NOISY_ENV_KEYS {
            a.env.remove(*key);
            b.env.remove(*key);
        }
        if a == b {
            return WatcherDiff::Unchanged;
        }
        a.numprocesses = b.numprocesses;
        if a == b {
            WatcherDiff::NumprocessesOnly
        } else {
            WatcherDiff::Changed
        }
    }
}

/// Per-watcher flapping detection tuning.
///
/// Read per check (late binding): live edits take effect on the next
/// evaluation without restarting the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlappingConfig {
    /// Evaluate the window once this many exits have accumulated.
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    /// Exits inside this many seconds count as flapping.
    #[serde(default = "default_window")]
    pub window: f64,
    /// Cooldown before the automatic restart, in seconds.
    #[serde(default = "default_retry_in")]
    pub retry_in: f64,
    /// Automatic restarts granted before the watcher stays down.
    #[serde(default = "default_flapping_max_retry")]
    pub max_retry: usize,
    /// When false the verdict is computed and logged but never acted on.
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_attempts() -> usize {
    2
}

fn default_window() -> f64 {
    1.0
}

fn default_retry_in() -> f64 {
    7.0
}

fn default_flapping_max_retry() -> usize {
    5
}

impl Default for FlappingConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            window: default_window(),
            retry_in: default_retry_in(),
            max_retry: default_flapping_max_retry(),
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip_with_defaults() {
        let text = r#"
            check_delay = 0.5

            [[sockets]]
            name = "web"
            port = 0

            [[watchers]]
            name = "web"
            cmd = "serve"
            args = ["--fd", "$(procvisor.sockets.web)"]
            numprocesses = 3
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.check_delay, 0.5);
        let w = cfg.watcher("WEB").unwrap();
        assert_eq!(w.numprocesses, 3);
        assert!(w.respawn, "respawn defaults to true");
        assert_eq!(w.referenced_sockets(), vec!["web".to_string()]);
    }

    #[test]
    fn missing_socket_reference_fails_validation() {
        let mut cfg = Config::default();
        let mut w = WatcherConfig::new("web", "serve");
        w.args = vec!["$(procvisor.sockets.ghost)".into()];
        cfg.watchers.push(w);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.as_label(), "config_missing_socket");
    }

    #[test]
    fn duplicate_watcher_names_are_case_insensitive() {
        let mut cfg = Config::default();
        cfg.watchers.push(WatcherConfig::new("Web", "a"));
        cfg.watchers.push(WatcherConfig::new("web", "b"));
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.as_label(), "config_duplicate_watcher");
    }

    #[test]
    fn singleton_with_many_processes_is_rejected() {
        let mut w = WatcherConfig::new("w", "sleep");
        w.singleton = true;
        w.numprocesses = 3;
        assert!(w.validate().is_err());
    }

    #[test]
    fn diff_classifies_numprocesses_only() {
        let a = WatcherConfig::new("w", "sleep");
        let mut b = a.clone();
        assert_eq!(a.diff(&b), WatcherDiff::Unchanged);

        b.numprocesses = 7;
        assert_eq!(a.diff(&b), WatcherDiff::NumprocessesOnly);

        b.cmd = "other".into();
        assert_eq!(a.diff(&b), WatcherDiff::Changed);
    }

    #[test]
    fn diff_ignores_noisy_env_keys() {
        let a = WatcherConfig::new("w", "sleep");
        let mut b = a.clone();
        b.env.insert("PWD".into(), "/tmp".into());
        b.env.insert("SHLVL".into(), "3".into());
        assert_eq!(a.diff(&b), WatcherDiff::Unchanged);

        b.env.insert("PORT".into(), "80".into());
        assert_eq!(a.diff(&b), WatcherDiff::Changed);
    }

    #[test]
    fn global_differs_ignores_watchers_and_sockets() {
        let a = Config::default();
        let mut b = a.clone();
        b.watchers.push(WatcherConfig::new("w", "sleep"));
        assert!(!a.global_differs(&b));

        b.check_delay = 9.0;
        assert!(a.global_differs(&b));
    }

    #[test]
    fn unknown_stop_signal_is_rejected() {
        let mut w = WatcherConfig::new("w", "sleep");
        w.stop_signal = "SIGBOGUS".into();
        assert_eq!(w.validate().unwrap_err().as_label(), "config_unknown_signal");
    }
}
