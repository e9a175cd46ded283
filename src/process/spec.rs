//! # Fully-resolved spawn specification.
//!
//! Defines [`ChildSpec`] — everything the OS needs to launch one worker
//! process: program, arguments, working directory, environment, identity
//! (uid/gid), resource limits, and the listening descriptors the child
//! inherits.
//!
//! A spec is built by a watcher from its live options right before each
//! spawn, after socket-placeholder substitution has been applied to the
//! command line. It carries no policy: retry, warmup, and respawn decisions
//! all live in the watcher.
//!
//! ## Rules
//! - `shell = true` wraps the command in `/bin/sh -c`, mirroring how the
//!   command would run from an interactive shell.
//! - `rlimits` entries apply to both the soft and the hard limit.

use std::collections::BTreeMap;
use std::path::PathBuf;

use nix::sys::resource::Resource;
use nix::sys::signal::Signal;

/// Fully-resolved specification for one OS process.
///
/// ## Example
/// ```rust
/// use procvisor::ChildSpec;
///
/// let spec = ChildSpec::new("/bin/sleep", ["30"]);
/// assert_eq!(spec.cmdline(), "/bin/sleep 30");
/// ```
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Program to execute (or the command string when `shell` is set).
    pub program: String,
    /// Arguments, already placeholder-substituted.
    pub args: Vec<String>,
    /// Working directory; inherits the supervisor's when `None`.
    pub working_dir: Option<PathBuf>,
    /// Environment overrides layered on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Run the command through `/bin/sh -c`.
    pub shell: bool,
    /// Drop to this uid after fork (requires privileges).
    pub uid: Option<u32>,
    /// Drop to this gid after fork (requires privileges; applied before uid).
    pub gid: Option<u32>,
    /// Resource limits applied in the pre-exec stage (soft = hard = value).
    pub rlimits: Vec<(Resource, u64)>,
    /// Listening descriptors to leave open across exec (close-on-exec cleared).
    pub inherit_fds: Vec<i32>,
}

impl ChildSpec {
    /// Creates a minimal spec: program plus arguments, everything else inherited.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            shell: false,
            uid: None,
            gid: None,
            rlimits: Vec::new(),
            inherit_fds: Vec::new(),
        }
    }

    /// The exec vector actually handed to the OS.
    ///
    /// With `shell` set, the whole command line becomes a single `sh -c`
    /// argument so shell syntax (pipes, redirects) keeps working.
    pub fn exec_vector(&self) -> (String, Vec<String>) {
        if self.shell {
            ("/bin/sh".to_string(), vec!["-c".to_string(), self.cmdline()])
        } else {
            (self.program.clone(), self.args.clone())
        }
    }

    /// Human-readable command line (for events, logs, and process info).
    pub fn cmdline(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Parses a signal name into a [`Signal`].
///
/// Accepts the canonical uppercase name with or without the `SIG` prefix,
/// case-insensitively: `"term"`, `"SIGTERM"`, and `"sigterm"` all map to
/// `Signal::SIGTERM`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    match full.as_str() {
        "SIGHUP" => Some(Signal::SIGHUP),
        "SIGINT" => Some(Signal::SIGINT),
        "SIGQUIT" => Some(Signal::SIGQUIT),
        "SIGKILL" => Some(Signal::SIGKILL),
        "SIGUSR1" => Some(Signal::SIGUSR1),
        "SIGUSR2" => Some(Signal::SIGUSR2),
        "SIGTERM" => Some(Signal::SIGTERM),
        "SIGCHLD" => Some(Signal::SIGCHLD),
        "SIGCONT" => Some(Signal::SIGCONT),
        "SIGSTOP" => Some(Signal::SIGSTOP),
        "SIGWINCH" => Some(Signal::SIGWINCH),
        _ => None,
    }
}

/// Parses an rlimit key (as written in configuration, e.g. `"nofile"`)
/// into the matching [`Resource`].
pub fn parse_rlimit(name: &str) -> Option<Resource> {
    match name.to_ascii_lowercase().as_str() {
        "as" => Some(Resource::RLIMIT_AS),
        "core" => Some(Resource::RLIMIT_CORE),
        "cpu" => Some(Resource::RLIMIT_CPU),
        "data" => Some(Resource::RLIMIT_DATA),
        "fsize" => Some(Resource::RLIMIT_FSIZE),
        "memlock" => Some(Resource::RLIMIT_MEMLOCK),
        "nofile" => Some(Resource::RLIMIT_NOFILE),
        "nproc" => Some(Resource::RLIMIT_NPROC),
        "stack" => Some(Resource::RLIMIT_STACK),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_wraps_command_in_sh() {
        let mut spec = ChildSpec::new("echo hi | cat", Vec::<String>::new());
        spec.shell = true;
        let (prog, args) = spec.exec_vector();
        assert_eq!(prog, "/bin/sh");
        assert_eq!(args, vec!["-c".to_string(), "echo hi | cat".to_string()]);
    }

    #[test]
    fn plain_exec_vector_passes_through() {
        let spec = ChildSpec::new("/bin/sleep", ["30"]);
        let (prog, args) = spec.exec_vector();
        assert_eq!(prog, "/bin/sleep");
        assert_eq!(args, vec!["30".to_string()]);
    }

    #[test]
    fn signal_names_parse_with_and_without_prefix() {
        assert_eq!(parse_signal("term"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("SIGQUIT"), Some(Signal::SIGQUIT));
        assert_eq!(parse_signal("hup"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal("nope"), None);
    }

    #[test]
    fn rlimit_names_parse() {
        assert_eq!(parse_rlimit("nofile"), Some(Resource::RLIMIT_NOFILE));
        assert_eq!(parse_rlimit("NOFILE"), Some(Resource::RLIMIT_NOFILE));
        assert_eq!(parse_rlimit("bogus"), None);
    }
}
