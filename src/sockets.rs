//! # Socket registry — named, pre-bound listeners shared with workers.
//!
//! A watcher's command line may reference a socket by name using the
//! `$(procvisor.sockets.NAME)` placeholder. The registry binds every
//! configured socket once, keeps the listening descriptor open for the
//! lifetime of the entry, and hands the raw fd number to each spawned worker
//! through placeholder substitution. Workers inherit the descriptor (the
//! spawn path clears close-on-exec on it) and accept connections themselves.
//!
//! ## Rules
//! - Names are unique, compared lowercased.
//! - A bound descriptor is **immutable**: restarts of the owning watcher
//!   re-inherit the same fd. Only a reload that changes the socket's
//!   *definition* closes and re-binds it (delete-then-add, never in place).
//! - `pending_connection()` is a zero-timeout `poll(POLLIN)` probe used by
//!   the arbiter to wake on-demand watchers; it never accepts.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6, UnixAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Declarative definition of one listening socket.
///
/// Equality over the whole value is what the reload diff uses: **any** field
/// difference marks the socket changed and forces delete-then-add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Unique name (lowercased on load); referenced from watcher commands.
    pub name: String,
    /// Bind host for TCP sockets.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port for TCP sockets.
    #[serde(default)]
    pub port: u16,
    /// Filesystem path for unix-domain sockets; overrides host/port when set.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> i32 {
    128
}

impl SocketConfig {
    /// Creates a TCP socket definition.
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into().to_lowercase(),
            host: host.into(),
            port,
            path: None,
            backlog: default_backlog(),
        }
    }

    /// Creates a unix-domain socket definition.
    pub fn unix(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            host: default_host(),
            port: 0,
            path: Some(path.into()),
            backlog: default_backlog(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// One bound listening socket.
///
/// The descriptor stays open until the entry is dropped; watcher restarts
/// never touch it.
pub struct SocketEntry {
    config: SocketConfig,
    listener: Listener,
}

impl SocketEntry {
    /// Binds the socket described by `config` and starts listening with the
    /// configured backlog.
    ///
    /// A stale unix-socket file left over from a previous run is unlinked
    /// before binding.
    pub fn bind(config: SocketConfig) -> Result<Self, ConfigError> {
        let listener = bind_listener(&config).map_err(|source| ConfigError::Bind {
            name: config.name.clone(),
            source,
        })?;
        debug!(
            socket = %config.name,
            fd = entry_fd(&listener),
            backlog = config.backlog,
            "bound",
        );
        Ok(Self { config, listener })
    }

    /// The definition this entry was bound from.
    #[inline]
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Entry name (lowercased).
    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Raw descriptor number, stable for the lifetime of the entry.
    #[inline]
    pub fn fd(&self) -> RawFd {
        entry_fd(&self.listener)
    }

    /// True when a connection attempt is waiting to be accepted.
    ///
    /// Zero-timeout `poll(POLLIN)`; a poll failure degrades to `false`.
    pub fn pending_connection(&self) -> bool {
        let borrowed = match &self.listener {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
        };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                warn!(socket = %self.config.name, errno = %e, "poll failed");
                false
            }
        }
    }
}

impl Drop for SocketEntry {
    fn drop(&mut self) {
        if let Some(path) = &self.config.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn entry_fd(listener: &Listener) -> RawFd {
    match listener {
        Listener::Tcp(l) => l.as_raw_fd(),
        Listener::Unix(l) => l.as_raw_fd(),
    }
}

/// socket/bind/listen by hand so `SocketConfig::backlog` reaches `listen(2)`
/// (the std listeners hard-code their own backlog). The descriptor carries
/// close-on-exec; the spawn path clears it per inherited fd.
fn bind_listener(config: &SocketConfig) -> io::Result<Listener> {
    let backlog = Backlog::new(config.backlog).unwrap_or(Backlog::MAXCONN);
    match &config.path {
        Some(path) => {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
            let fd = socket::socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )?;
            socket::bind(fd.as_raw_fd(), &UnixAddr::new(path)?)?;
            socket::listen(&fd, backlog)?;
            Ok(Listener::Unix(UnixListener::from(fd)))
        }
        None => {
            let addr: SocketAddr = (config.host.as_str(), config.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolves to no address")
                })?;
            let family = if addr.is_ipv4() {
                AddressFamily::Inet
            } else {
                AddressFamily::Inet6
            };
            let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
            socket::setsockopt(&fd, socket::sockopt::ReuseAddr, &true)?;
            match addr {
                SocketAddr::V4(v4) => socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4))?,
                SocketAddr::V6(v6) => socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6))?,
            }
            socket::listen(&fd, backlog)?;
            Ok(Listener::Tcp(TcpListener::from(fd)))
        }
    }
}

/// Named collection of bound listeners, owned by the arbiter.
///
/// Only the arbiter mutates the registry, and only during reload or explicit
/// add/remove-socket commands; both paths run under the serialization lock.
#[derive(Default)]
pub struct SocketRegistry {
    entries: BTreeMap<String, SocketEntry>,
}

impl SocketRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every definition in `configs`.
    ///
    /// Fails closed on the first bind error; already-bound entries stay in
    /// the registry so the caller can tear them down as a unit.
    pub fn bind_all(&mut self, configs: &[SocketConfig]) -> Result<(), ConfigError> {
        for cfg in configs {
            self.add(cfg.clone())?;
        }
        Ok(())
    }

    /// Binds one definition and inserts it.
    pub fn add(&mut self, config: SocketConfig) -> Result<(), ConfigError> {
        let name = config.name.to_lowercase();
        if self.entries.contains_key(&name) {
            return Err(ConfigError::DuplicateSocket { name });
        }
        let entry = SocketEntry::bind(SocketConfig { name: name.clone(), ..config })?;
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Removes an entry, closing its descriptor.
    pub fn remove(&mut self, name: &str) -> Option<SocketEntry> {
        self.entries.remove(&name.to_lowercase())
    }

    /// Looks up an entry by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&SocketEntry> {
        self.entries.get(&name.to_lowercase())
    }

    /// Sorted entry names.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// The definitions currently bound, for reload diffing and `listsockets`.
    pub fn configs(&self) -> Vec<SocketConfig> {
        self.entries.values().map(|e| e.config.clone()).collect()
    }

    /// Name → fd map used for placeholder substitution at spawn time.
    pub fn fd_map(&self) -> HashMap<String, RawFd> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.fd()))
            .collect()
    }

    /// Number of bound entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The placeholder prefix a command line uses to reference a socket fd.
const PLACEHOLDER_PREFIX: &str = "$(procvisor.sockets.";

/// Extracts the socket names referenced by `text` via fd placeholders.
///
/// Returned names are lowercased and deduplicated, in order of first
/// appearance.
pub fn referenced_sockets(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(PLACEHOLDER_PREFIX) {
        let tail = &rest[start + PLACEHOLDER_PREFIX.len()..];
        match tail.find(')') {
            Some(end) => {
                let name = tail[..end].to_lowercase();
                if !names.contains(&name) {
                    names.push(name);
                }
                rest = &tail[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Replaces every socket placeholder in `text` with the matching fd number.
///
/// Names inside placeholders are matched case-insensitively, mirroring
/// registry lookups and [`referenced_sockets`]. Placeholders naming sockets
/// absent from `fds` are left untouched; the configuration validation pass
/// rejects those before a watcher ever spawns.
pub fn substitute_fds(text: &str, fds: &HashMap<String, RawFd>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(PLACEHOLDER_PREFIX) {
        out.push_str(&rest[..start]);
        let placeholder = &rest[start..];
        let tail = &placeholder[PLACEHOLDER_PREFIX.len()..];
        let Some(end) = tail.find(')') else {
            // Unterminated placeholder; keep the remainder verbatim.
            out.push_str(placeholder);
            return out;
        };
        let name = tail[..end].to_lowercase();
        match fds.get(&name) {
            Some(fd) => out.push_str(&fd.to_string()),
            None => out.push_str(&placeholder[..PLACEHOLDER_PREFIX.len() + end + 1]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_tcp_entry_keeps_a_stable_fd() {
        let mut reg = SocketRegistry::new();
        reg.add(SocketConfig::tcp("web", "127.0.0.1", 0)).unwrap();
        let fd = reg.get("web").unwrap().fd();
        assert!(fd >= 0);
        // Lookup is case-insensitive and the fd does not move.
        assert_eq!(reg.get("WEB").unwrap().fd(), fd);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = SocketRegistry::new();
        reg.add(SocketConfig::tcp("a", "127.0.0.1", 0)).unwrap();
        let err = reg.add(SocketConfig::tcp("A", "127.0.0.1", 0)).unwrap_err();
        assert_eq!(err.as_label(), "config_duplicate_socket");
    }

    #[test]
    fn unix_socket_binds_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        {
            let mut reg = SocketRegistry::new();
            reg.add(SocketConfig::unix("ctl", &path)).unwrap();
            assert!(path.exists());
            assert!(!reg.get("ctl").unwrap().pending_connection());
        }
        // Dropping the registry unlinks the socket file.
        assert!(!path.exists());
    }

    #[test]
    fn pending_connection_sees_a_waiting_client() {
        let mut reg = SocketRegistry::new();
        reg.add(SocketConfig::tcp("web", "127.0.0.1", 0)).unwrap();
        let entry = reg.get("web").unwrap();
        assert!(!entry.pending_connection());

        let port = match &entry.listener {
            Listener::Tcp(l) => l.local_addr().unwrap().port(),
            Listener::Unix(_) => unreachable!(),
        };
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(entry.pending_connection());
    }

    #[test]
    fn placeholders_are_parsed_and_substituted() {
        let cmd = "serve --fd $(procvisor.sockets.web) --alt $(procvisor.sockets.Web)";
        assert_eq!(referenced_sockets(cmd), vec!["web".to_string()]);

        let mut fds = HashMap::new();
        fds.insert("web".to_string(), 7);
        assert_eq!(
            substitute_fds("serve --fd $(procvisor.sockets.web)", &fds),
            "serve --fd 7"
        );
        // Unknown names stay as-is.
        assert_eq!(
            substitute_fds("serve $(procvisor.sockets.other)", &fds),
            "serve $(procvisor.sockets.other)"
        );
    }

    #[test]
    fn substitution_matches_names_case_insensitively() {
        let mut fds = HashMap::new();
        fds.insert("web".to_string(), 7);
        // Any spelling that validation accepts must substitute too.
        assert_eq!(
            substitute_fds("serve --fd $(procvisor.sockets.WEB)", &fds),
            "serve --fd 7"
        );
        assert_eq!(
            substitute_fds("$(procvisor.sockets.Web) $(procvisor.sockets.web)", &fds),
            "7 7"
        );
        // An unterminated placeholder is passed through untouched.
        assert_eq!(
            substitute_fds("serve $(procvisor.sockets.web", &fds),
            "serve $(procvisor.sockets.web"
        );
    }

    #[test]
    fn configured_backlog_still_accepts_clients() {
        let mut cfg = SocketConfig::tcp("deep", "127.0.0.1", 0);
        cfg.backlog = 4;
        let mut reg = SocketRegistry::new();
        reg.add(cfg).unwrap();
        let entry = reg.get("deep").unwrap();
        assert!(entry.fd() >= 0);

        let port = match &entry.listener {
            Listener::Tcp(l) => l.local_addr().unwrap().port(),
            Listener::Unix(_) => unreachable!(),
        };
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(entry.pending_connection());
    }
}
