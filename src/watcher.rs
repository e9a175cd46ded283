//! # Watcher — a named group of identical worker processes.
//!
//! A [`Watcher`] owns its [`ChildHandle`]s (keyed by worker id), drives them
//! toward the configured target count, and never shares them with anyone
//! else. All mutating entry points are called by the arbiter under the
//! engine's serialization lock.
//!
//! ## Lifecycle
//! ```text
//! start() ──► spawn_processes() ──► N children running
//!                 │ spawn failure × max_retry
//!                 ▼
//!             stop(reason = "spawn retries exhausted")
//!
//! manage_processes() each tick:
//!   reap dead ──► recycle aged (max_age) ──► spawn up to target
//!             ──► kill excess (lowest wid first)
//!
//! stop(graceful):
//!   stop_signal every 100ms + reap, until graceful_timeout
//!   then SIGKILL everything left, reap, children.len() == 0
//! ```
//!
//! ## Rules
//! - Spawns are strictly sequential with `warmup_delay` between them; a
//!   watcher never spawns in parallel with itself.
//! - While `stopped` is set nothing spawns, and a reap pass that observes
//!   the flag mid-iteration aborts early (a concurrent stop owns teardown).
//! - Worker ids increase monotonically and are never reused while the
//!   watcher lives.
//! - The spawn-failure budget (`max_retry`) is consumed per
//!   `spawn_processes` call, not per slot; a burst of failures across slots
//!   exhausts it for the whole call and stops the watcher.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::WatcherConfig;
use crate::error::{ControlError, ProcessError};
use crate::events::{Bus, Event, EventKind};
use crate::process::{parse_rlimit, parse_signal, ChildHandle, ChildSpec, ProcessInfo};
use crate::sockets::{substitute_fds, SocketRegistry};

/// Escalation cadence during a graceful stop.
const STOP_SIGNAL_INTERVAL: Duration = Duration::from_millis(100);

/// Action classification returned by [`Watcher::set_opt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptAction {
    /// Re-run process management (target count moved, pacing changed).
    Manage,
    /// Structural change: every live process must be respawned.
    Respawn,
    /// Config-only change with no immediate process effect.
    ConfigOnly,
}

/// A named, independently controllable group of worker processes.
pub struct Watcher {
    config: WatcherConfig,
    name: String,
    children: BTreeMap<u64, ChildHandle>,
    next_wid: u64,
    stopped: bool,
    bus: Bus,
}

impl Watcher {
    /// Creates a watcher from its definition. Starts stopped; `start()` or
    /// the arbiter's autostart pass brings it up.
    pub fn new(config: WatcherConfig, bus: Bus) -> Self {
        let name = config.name.to_lowercase();
        Self {
            config,
            name,
            children: BTreeMap::new(),
            next_wid: 0,
            stopped: true,
            bus,
        }
    }

    /// Watcher name (lowercased).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The live definition this watcher runs with.
    #[inline]
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// True while the watcher refuses to spawn.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of live children.
    #[inline]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when no children are tracked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Pids of all tracked children, ascending by worker id.
    pub fn pids(&self) -> Vec<i32> {
        self.children.values().map(|c| c.pid()).collect()
    }

    /// `"active"` or `"stopped"`, for the `list` command.
    pub fn status(&self) -> &'static str {
        if self.stopped {
            "stopped"
        } else {
            "active"
        }
    }

    /// Finds the worker id owning `pid`.
    pub fn wid_of(&self, pid: i32) -> Option<u64> {
        self.children
            .values()
            .find(|c| c.pid() == pid)
            .map(|c| c.wid())
    }

    /// Routes an exit observed by the arbiter's global reap pass to the
    /// owning child. Returns `false` when no child has this pid.
    pub fn record_external_exit(&mut self, pid: i32, outcome: crate::process::ExitOutcome) -> bool {
        for child in self.children.values_mut() {
            if child.pid() == pid {
                child.record_exit(outcome);
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    /// Spawns children one at a time until the target count is reached.
    ///
    /// Pauses `warmup_delay` between spawns. Spawn failures consume a
    /// shared budget of `max_retry` for the whole call; exhausting it stops
    /// the watcher and emits a `stop` event carrying the reason.
    pub async fn spawn_processes(&mut self, sockets: &SocketRegistry) {
        let mut failures = 0;
        while self.children.len() < self.config.numprocesses && !self.stopped {
            match self.spawn_one(sockets).await {
                Ok(()) => sleep(self.config.warmup()).await,
                Err(e) => {
                    failures += 1;
                    warn!(
                        watcher = %self.name,
                        failures,
                        budget = self.config.max_retry,
                        error = %e.as_message(),
                        "spawn failed"
                    );
                    if failures >= self.config.max_retry {
                        self.stop_with_reason(false, Some("spawn retries exhausted"))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn spawn_one(&mut self, sockets: &SocketRegistry) -> Result<(), ProcessError> {
        self.next_wid += 1;
        let wid = self.next_wid;
        let spec = self.build_spec(sockets);

        let child = tokio::task::spawn_blocking(move || ChildHandle::spawn(wid, &spec))
            .await
            .map_err(|e| ProcessError::Spawn {
                source: std::io::Error::other(e),
            })??;

        self.bus.publish(
            Event::new(EventKind::Spawn)
                .with_watcher(self.name.clone())
                .with_wid(wid)
                .with_pid(child.pid()),
        );
        self.children.insert(wid, child);
        Ok(())
    }

    /// Resolves the live options into a spawn spec, substituting socket
    /// placeholders with descriptor numbers from the registry.
    fn build_spec(&self, sockets: &SocketRegistry) -> ChildSpec {
        let all_fds = sockets.fd_map();
        let mut fds: HashMap<String, RawFd> = HashMap::new();
        let mut inherit = Vec::new();
        for name in self.config.referenced_sockets() {
            if let Some(fd) = all_fds.get(&name) {
                fds.insert(name, *fd);
                inherit.push(*fd);
            }
        }

        let mut spec = ChildSpec::new(
            substitute_fds(&self.config.cmd, &fds),
            self.config.args.iter().map(|a| substitute_fds(a, &fds)),
        );
        spec.working_dir = self.config.working_dir.clone();
        spec.env = self.config.env.clone();
        spec.shell = self.config.shell;
        spec.uid = self.config.uid;
        spec.gid = self.config.gid;
        spec.rlimits = self
            .config
            .rlimits
            .iter()
            .filter_map(|(name, value)| parse_rlimit(name).map(|r| (r, *value)))
            .collect();
        spec.inherit_fds = inherit;
        spec
    }

    // ------------------------------------------------------------------
    // Reaping and management
    // ------------------------------------------------------------------

    /// Removes children whose exit is known, emitting one `reap` event per
    /// removal.
    ///
    /// Aborts early if a concurrent stop set the `stopped` flag mid-pass:
    /// the stop path owns teardown from then on. Returns the number reaped.
    pub fn reap_processes(&mut self) -> usize {
        let wids: Vec<u64> = self.children.keys().copied().collect();
        let mut reaped = 0;
        for wid in wids {
            if self.stopped {
                debug!(watcher = %self.name, "reap aborted: watcher stopping");
                break;
            }
            reaped += self.reap_wid(wid);
        }
        reaped
    }

    /// Reap pass that ignores the `stopped` flag; used inside `stop()` and
    /// `start()` where the flag is held by the caller itself.
    fn reap_inner(&mut self) -> usize {
        let wids: Vec<u64> = self.children.keys().copied().collect();
        wids.into_iter().map(|wid| self.reap_wid(wid)).sum()
    }

    fn reap_wid(&mut self, wid: u64) -> usize {
        let Some(child) = self.children.get_mut(&wid) else {
            return 0;
        };
        match child.poll() {
            Ok(None) => 0,
            Ok(Some(_)) => {
                // A zombie that slipped through gets a final stop; double
                // delivery is tolerated.
                let _ = child.stop();
                let pid = child.pid();
                self.children.remove(&wid);
                self.bus.publish(
                    Event::new(EventKind::Reap)
                        .with_watcher(self.name.clone())
                        .with_wid(wid)
                        .with_pid(pid),
                );
                1
            }
            Err(e) => {
                warn!(watcher = %self.name, wid, error = %e.as_message(), "poll failed");
                0
            }
        }
    }

    /// One management pass: reap, recycle aged workers, spawn up to target,
    /// evict excess (lowest worker id first). Returns the number reaped.
    pub async fn manage_processes(&mut self, sockets: &SocketRegistry) -> usize {
        if self.stopped {
            return 0;
        }

        let reaped = self.reap_processes();
        if self.stopped {
            return reaped;
        }

        if self.config.max_age > 0 {
            self.recycle_aged();
        }

        if self.config.respawn && self.children.len() < self.config.numprocesses {
            self.spawn_processes(sockets).await;
        }

        while self.children.len() > self.config.numprocesses {
            let Some(wid) = self.children.keys().next().copied() else {
                break;
            };
            let sig = self.stop_signal();
            self.kill_one(wid, sig).await;
        }
        reaped
    }

    /// Signals workers older than `max_age` plus a per-worker random
    /// variance. They die, get reaped, and the spawn-up path replaces them
    /// gradually.
    fn recycle_aged(&mut self) {
        let sig = self.stop_signal();
        let mut rng = rand::thread_rng();
        let expired: Vec<(u64, i32)> = self
            .children
            .values()
            .filter(|c| {
                let jitter = rng.gen_range(0..=self.config.max_age_variance);
                c.age() > Duration::from_secs(self.config.max_age + jitter)
            })
            .map(|c| (c.wid(), c.pid()))
            .collect();

        for (wid, pid) in expired {
            self.bus.publish(
                Event::new(EventKind::Expired)
                    .with_watcher(self.name.clone())
                    .with_wid(wid)
                    .with_pid(pid),
            );
            if let Some(child) = self.children.get(&wid) {
                let _ = child.signal(sig);
            }
        }
    }

    /// Signals one child, emits `kill`, and removes it from the collection.
    ///
    /// Reaps the exit with a short bounded wait; a worker that ignores the
    /// signal is left for the arbiter's global reap pass.
    async fn kill_one(&mut self, wid: u64, sig: Signal) {
        let Some(mut child) = self.children.remove(&wid) else {
            return;
        };
        if self.config.stop_children {
            let _ = child.signal_children(sig);
        }
        let _ = child.signal(sig);
        self.bus.publish(
            Event::new(EventKind::Kill)
                .with_watcher(self.name.clone())
                .with_wid(wid)
                .with_pid(child.pid()),
        );
        for _ in 0..20 {
            match child.poll() {
                Ok(Some(_)) => return,
                Ok(None) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(_) => return,
            }
        }
        debug!(watcher = %self.name, wid, "killed worker slow to exit; left to global reap");
    }

    // ------------------------------------------------------------------
    // Start / stop / restart / reload
    // ------------------------------------------------------------------

    /// Clears `stopped`, reaps stragglers, and spawns to target. No-op if
    /// already running.
    pub async fn start(&mut self, sockets: &SocketRegistry) {
        if !self.stopped {
            return;
        }
        self.stopped = false;
        self.reap_inner();
        self.spawn_processes(sockets).await;
        self.bus
            .publish(Event::new(EventKind::Start).with_watcher(self.name.clone()));
    }

    /// Stops every child with escalating signals.
    ///
    /// Delivers the configured stop signal (SIGTERM when not graceful)
    /// every 100ms while reaping, until `graceful_timeout` elapses; then
    /// SIGKILLs whatever is left. Never blocks longer than the timeout plus
    /// one kill pass, and leaves `children` empty.
    pub async fn stop(&mut self, graceful: bool) {
        self.stop_with_reason(graceful, None).await;
    }

    /// [`stop`](Watcher::stop) with an explanation carried on the `stop`
    /// event (flapping verdicts, spawn exhaustion).
    pub async fn stop_with_reason(&mut self, graceful: bool, reason: Option<&str>) {
        self.stopped = true;

        let sig = if graceful {
            self.stop_signal()
        } else {
            Signal::SIGTERM
        };
        let deadline = Instant::now() + self.config.graceful();

        while !self.children.is_empty() && Instant::now() < deadline {
            self.kill_all(sig);
            sleep(STOP_SIGNAL_INTERVAL).await;
            self.reap_inner();
        }

        if !self.children.is_empty() {
            self.kill_all(Signal::SIGKILL);
            // SIGKILL cannot be caught; the exits land promptly.
            for _ in 0..50 {
                self.reap_inner();
                if self.children.is_empty() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        }

        let mut ev = Event::new(EventKind::Stop).with_watcher(self.name.clone());
        if let Some(reason) = reason {
            ev = ev.with_reason(reason.to_string());
        }
        self.bus.publish(ev);
    }

    fn kill_all(&mut self, sig: Signal) {
        for child in self.children.values() {
            if self.config.stop_children {
                if let Err(e) = child.signal_children(sig) {
                    warn!(watcher = %self.name, error = %e.as_message(), "signal children failed");
                }
            }
            if let Err(e) = child.signal(sig) {
                warn!(watcher = %self.name, error = %e.as_message(), "signal failed");
            }
        }
    }

    /// `stop()` then `start()`, sequentially. The capacity gap between the
    /// two is what [`reload`](Watcher::reload) avoids.
    pub async fn restart(&mut self, sockets: &SocketRegistry) {
        self.stop(true).await;
        self.start(sockets).await;
        self.bus
            .publish(Event::new(EventKind::Restart).with_watcher(self.name.clone()));
    }

    /// Rolling reload.
    ///
    /// With `send_hup` each live child gets SIGHUP and reloads itself in
    /// place. Otherwise `numprocesses` fresh workers are spawned first and
    /// the management pass then evicts the old ones (lowest worker ids), so
    /// capacity never drops below target during the swap. `graceful =
    /// false` degrades to a plain restart.
    pub async fn reload(&mut self, graceful: bool, sockets: &SocketRegistry) {
        if !graceful {
            self.restart(sockets).await;
            return;
        }
        if self.config.send_hup {
            for child in self.children.values() {
                if let Err(e) = child.signal(Signal::SIGHUP) {
                    warn!(watcher = %self.name, pid = child.pid(), error = %e.as_message(), "HUP failed");
                }
            }
        } else {
            for _ in 0..self.config.numprocesses {
                if self.stopped {
                    break;
                }
                if self.spawn_one(sockets).await.is_ok() {
                    sleep(self.config.warmup()).await;
                }
            }
            self.manage_processes(sockets).await;
        }
        self.bus
            .publish(Event::new(EventKind::Reload).with_watcher(self.name.clone()));
    }

    // ------------------------------------------------------------------
    // Scaling
    // ------------------------------------------------------------------

    /// Raises the target count by `n` and manages. Returns the new target.
    pub async fn incr(&mut self, n: usize, sockets: &SocketRegistry) -> usize {
        self.config.numprocesses += n;
        self.manage_processes(sockets).await;
        self.config.numprocesses
    }

    /// Lowers the target count by `n` (floor 0) and manages; excess workers
    /// are evicted lowest-wid-first. Returns the new target.
    pub async fn decr(&mut self, n: usize, sockets: &SocketRegistry) -> usize {
        self.config.numprocesses = self.config.numprocesses.saturating_sub(n);
        self.manage_processes(sockets).await;
        self.config.numprocesses
    }

    /// Sets the target count in place (reload's numprocesses-only path).
    pub async fn set_numprocesses(&mut self, n: usize, sockets: &SocketRegistry) {
        self.config.numprocesses = n;
        self.manage_processes(sockets).await;
    }

    // ------------------------------------------------------------------
    // Signal delivery (addressed variants)
    // ------------------------------------------------------------------

    /// Delivers `sig` to every tracked process.
    pub fn signal_processes(&self, sig: Signal) -> Result<(), ProcessError> {
        for child in self.children.values() {
            child.signal(sig)?;
        }
        Ok(())
    }

    /// Delivers `sig` to the process with `pid`.
    pub fn signal_process(&self, pid: i32, sig: Signal) -> Result<(), ControlError> {
        let child = self.child_by_pid(pid)?;
        child.signal(sig)?;
        Ok(())
    }

    /// Delivers `sig` to every direct OS child of the process with `pid`.
    pub fn signal_children_of(&self, pid: i32, sig: Signal) -> Result<(), ControlError> {
        let child = self.child_by_pid(pid)?;
        child.signal_children(sig)?;
        Ok(())
    }

    /// Delivers `sig` to one specific OS child (`child_pid`) of the process
    /// with `pid`.
    pub fn signal_child_of(
        &self,
        pid: i32,
        child_pid: i32,
        sig: Signal,
    ) -> Result<(), ControlError> {
        let child = self.child_by_pid(pid)?;
        if !child.signal_child(child_pid, sig)? {
            return Err(ControlError::UnknownProcess {
                name: self.name.clone(),
                pid: child_pid,
            });
        }
        Ok(())
    }

    fn child_by_pid(&self, pid: i32) -> Result<&ChildHandle, ControlError> {
        self.children
            .values()
            .find(|c| c.pid() == pid)
            .ok_or_else(|| ControlError::UnknownProcess {
                name: self.name.clone(),
                pid,
            })
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// Sets one mutable option and classifies the follow-up action.
    ///
    /// Emits an `updated` event naming the key. The caller feeds the
    /// returned action into [`do_action`](Watcher::do_action).
    pub fn set_opt(&mut self, key: &str, value: &str) -> Result<OptAction, ControlError> {
        let action = match key {
            "numprocesses" => {
                let n = parse_num(key, value)?;
                if self.config.singleton && n != 1 {
                    return Err(ControlError::Singleton {
                        name: self.name.clone(),
                    });
                }
                self.config.numprocesses = n;
                OptAction::Manage
            }
            "warmup_delay" => {
                self.config.warmup_delay = parse_float(key, value)?;
                OptAction::Manage
            }
            "cmd" => {
                self.config.cmd = value.to_string();
                OptAction::Respawn
            }
            "args" => {
                self.config.args = value.split_whitespace().map(str::to_string).collect();
                OptAction::Respawn
            }
            "working_dir" => {
                self.config.working_dir = Some(value.into());
                OptAction::Respawn
            }
            "uid" => {
                self.config.uid = Some(parse_num(key, value)? as u32);
                OptAction::Respawn
            }
            "gid" => {
                self.config.gid = Some(parse_num(key, value)? as u32);
                OptAction::Respawn
            }
            "shell" => {
                self.config.shell = parse_bool(key, value)?;
                OptAction::Respawn
            }
            "env" => {
                // "KEY=value,KEY2=value2" replaces the override map.
                let mut env = std::collections::BTreeMap::new();
                for pair in value.split(',').filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some((k, v)) => {
                            env.insert(k.trim().to_string(), v.to_string());
                        }
                        None => return Err(invalid(key, value)),
                    }
                }
                self.config.env = env;
                OptAction::Respawn
            }
            "max_age" => {
                self.config.max_age = parse_num(key, value)? as u64;
                OptAction::Respawn
            }
            "max_age_variance" => {
                self.config.max_age_variance = parse_num(key, value)? as u64;
                OptAction::Respawn
            }
            "graceful_timeout" => {
                self.config.graceful_timeout = parse_float(key, value)?;
                OptAction::ConfigOnly
            }
            "stop_signal" => {
                if parse_signal(value).is_none() {
                    return Err(invalid(key, value));
                }
                self.config.stop_signal = value.to_string();
                OptAction::ConfigOnly
            }
            "stop_children" => {
                self.config.stop_children = parse_bool(key, value)?;
                OptAction::ConfigOnly
            }
            "send_hup" => {
                self.config.send_hup = parse_bool(key, value)?;
                OptAction::ConfigOnly
            }
            "respawn" => {
                self.config.respawn = parse_bool(key, value)?;
                OptAction::ConfigOnly
            }
            "max_retry" => {
                self.config.max_retry = parse_num(key, value)?;
                OptAction::ConfigOnly
            }
            "priority" => {
                self.config.priority = parse_num(key, value)? as i32;
                OptAction::ConfigOnly
            }
            "flapping.attempts" => {
                self.config.flapping.attempts = parse_num(key, value)?;
                OptAction::ConfigOnly
            }
            "flapping.window" => {
                self.config.flapping.window = parse_float(key, value)?;
                OptAction::ConfigOnly
            }
            "flapping.retry_in" => {
                self.config.flapping.retry_in = parse_float(key, value)?;
                OptAction::ConfigOnly
            }
            "flapping.max_retry" => {
                self.config.flapping.max_retry = parse_num(key, value)?;
                OptAction::ConfigOnly
            }
            "flapping.active" => {
                self.config.flapping.active = parse_bool(key, value)?;
                OptAction::ConfigOnly
            }
            _ => {
                return Err(ControlError::UnknownOption {
                    key: key.to_string(),
                })
            }
        };

        self.bus.publish(
            Event::new(EventKind::Updated)
                .with_watcher(self.name.clone())
                .with_reason(key.to_string()),
        );
        Ok(action)
    }

    /// Reads one option back as a string.
    pub fn get_opt(&self, key: &str) -> Result<String, ControlError> {
        self.options()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| ControlError::UnknownOption {
                key: key.to_string(),
            })
    }

    /// All mutable options with their current values, sorted by key.
    pub fn options(&self) -> Vec<(String, String)> {
        let c = &self.config;
        let env = c
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut opts = vec![
            ("args".to_string(), c.args.join(" ")),
            ("cmd".to_string(), c.cmd.clone()),
            ("env".to_string(), env),
            ("flapping.active".to_string(), c.flapping.active.to_string()),
            ("flapping.attempts".to_string(), c.flapping.attempts.to_string()),
            ("flapping.max_retry".to_string(), c.flapping.max_retry.to_string()),
            ("flapping.retry_in".to_string(), c.flapping.retry_in.to_string()),
            ("flapping.window".to_string(), c.flapping.window.to_string()),
            ("graceful_timeout".to_string(), c.graceful_timeout.to_string()),
            ("max_age".to_string(), c.max_age.to_string()),
            ("max_age_variance".to_string(), c.max_age_variance.to_string()),
            ("max_retry".to_string(), c.max_retry.to_string()),
            ("numprocesses".to_string(), c.numprocesses.to_string()),
            ("priority".to_string(), c.priority.to_string()),
            ("respawn".to_string(), c.respawn.to_string()),
            ("send_hup".to_string(), c.send_hup.to_string()),
            ("shell".to_string(), c.shell.to_string()),
            ("stop_children".to_string(), c.stop_children.to_string()),
            ("stop_signal".to_string(), c.stop_signal.clone()),
            ("warmup_delay".to_string(), c.warmup_delay.to_string()),
            (
                "working_dir".to_string(),
                c.working_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
        ];
        opts.sort();
        opts
    }

    /// Executes the follow-up an option change asked for.
    ///
    /// [`OptAction::Respawn`] spawns a full fresh generation and lets the
    /// management pass evict the old one; anything else is a plain
    /// reap-and-manage.
    pub async fn do_action(&mut self, action: OptAction, sockets: &SocketRegistry) {
        self.stopped = false;
        match action {
            OptAction::Respawn => {
                for _ in 0..self.config.numprocesses {
                    if self.spawn_one(sockets).await.is_ok() {
                        sleep(self.config.warmup()).await;
                    }
                }
                self.manage_processes(sockets).await;
            }
            OptAction::Manage | OptAction::ConfigOnly => {
                self.reap_processes();
                self.manage_processes(sockets).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Resource usage for every tracked child.
    pub fn info(&self, sys: &mut sysinfo::System) -> Vec<ProcessInfo> {
        self.children.values().map(|c| c.info(sys)).collect()
    }

    fn stop_signal(&self) -> Signal {
        parse_signal(&self.config.stop_signal).unwrap_or(Signal::SIGQUIT)
    }
}

fn parse_num(key: &str, value: &str) -> Result<usize, ControlError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_float(key: &str, value: &str) -> Result<f64, ControlError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ControlError> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ControlError {
    ControlError::InvalidOptionValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    fn sleeper_config(name: &str, count: usize) -> WatcherConfig {
        let mut cfg = WatcherConfig::new(name, "/bin/sleep");
        cfg.args = vec!["30".to_string()];
        cfg.numprocesses = count;
        cfg.stop_signal = "SIGTERM".to_string();
        cfg.graceful_timeout = 2.0;
        cfg
    }

    async fn running_watcher(name: &str, count: usize) -> (Watcher, SocketRegistry, Bus) {
        let bus = Bus::new(64);
        let sockets = SocketRegistry::new();
        let mut w = Watcher::new(sleeper_config(name, count), bus.clone());
        w.start(&sockets).await;
        (w, sockets, bus)
    }

    #[tokio::test]
    async fn start_spawns_to_target() {
        let (mut w, _sockets, _bus) = running_watcher("spawn-target", 2).await;
        assert_eq!(w.len(), 2);
        assert!(!w.is_stopped());
        w.stop(false).await;
    }

    #[tokio::test]
    async fn manage_replaces_an_externally_killed_worker() {
        let (mut w, sockets, _bus) = running_watcher("replace", 1).await;
        let old_pid = w.pids()[0];
        let old_wid = w.wid_of(old_pid).unwrap();

        kill(Pid::from_raw(old_pid), Signal::SIGKILL).unwrap();
        // Give the kernel a moment to make the exit observable.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reaped = w.manage_processes(&sockets).await;
        assert_eq!(reaped, 1);
        assert_eq!(w.len(), 1);
        let new_pid = w.pids()[0];
        assert_ne!(new_pid, old_pid);
        assert!(w.wid_of(new_pid).unwrap() > old_wid, "wids never go backwards");
        w.stop(false).await;
    }

    #[tokio::test]
    async fn decr_evicts_lowest_wids_first() {
        let (mut w, sockets, _bus) = running_watcher("decr-oldest", 3).await;
        let wids: Vec<u64> = w.children.keys().copied().collect();
        assert_eq!(wids, vec![1, 2, 3]);

        let target = w.decr(2, &sockets).await;
        assert_eq!(target, 1);
        let left: Vec<u64> = w.children.keys().copied().collect();
        assert_eq!(left, vec![3], "oldest worker ids evicted first");
        w.stop(false).await;
    }

    #[tokio::test]
    async fn eviction_leaves_a_stubborn_worker_to_the_global_reap() {
        let bus = Bus::new(64);
        let sockets = SocketRegistry::new();
        let mut cfg = WatcherConfig::new("stubborn-evict", "trap '' TERM; sleep 30");
        cfg.shell = true;
        cfg.numprocesses = 2;
        cfg.stop_signal = "SIGTERM".to_string();
        let mut w = Watcher::new(cfg, bus);
        w.start(&sockets).await;
        let evicted_pid = w.pids()[0];

        // The evicted worker ignores the stop signal: kill_one gives up after
        // its bounded wait instead of stalling the management pass.
        let started = Instant::now();
        w.decr(1, &sockets).await;
        assert_eq!(w.len(), 1);
        assert!(w.wid_of(evicted_pid).is_none(), "the worker left the collection");
        assert!(started.elapsed() < Duration::from_secs(2));

        // Clean up what would normally fall to the arbiter's global pass.
        kill(Pid::from_raw(evicted_pid), Signal::SIGKILL).unwrap();
        let _ = nix::sys::wait::waitpid(Pid::from_raw(evicted_pid), None);
        w.stop(false).await;
    }

    #[tokio::test]
    async fn stop_empties_within_the_graceful_timeout() {
        let (mut w, _sockets, _bus) = running_watcher("stop-bound", 2).await;
        let started = Instant::now();
        w.stop(true).await;
        assert!(w.is_empty(), "no children survive stop()");
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "stop stays within graceful_timeout plus a kill pass"
        );
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill_for_stubborn_workers() {
        let bus = Bus::new(64);
        let sockets = SocketRegistry::new();
        let mut cfg = WatcherConfig::new("stubborn", "trap '' TERM; sleep 30");
        cfg.shell = true;
        cfg.stop_signal = "SIGTERM".to_string();
        cfg.graceful_timeout = 0.3;
        let mut w = Watcher::new(cfg, bus);
        w.start(&sockets).await;
        assert_eq!(w.len(), 1);

        let started = Instant::now();
        w.stop(true).await;
        assert!(w.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn double_reap_emits_no_duplicate_events() {
        let (mut w, _sockets, bus) = running_watcher("reap-idem", 1).await;
        let mut rx = bus.subscribe();
        let pid = w.pids()[0];
        kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(w.reap_processes(), 1);
        assert_eq!(w.reap_processes(), 0, "second pass reaps nothing");

        let ev = rx.try_recv().expect("one reap event");
        assert_eq!(ev.kind, EventKind::Reap);
        assert!(rx.try_recv().is_err(), "no duplicate reap event");
        w.stop(false).await;
    }

    #[tokio::test]
    async fn spawn_failures_exhaust_budget_and_stop_the_watcher() {
        let bus = Bus::new(64);
        let sockets = SocketRegistry::new();
        let mut cfg = WatcherConfig::new("broken", "/nonexistent-binary-procvisor");
        cfg.numprocesses = 2;
        cfg.max_retry = 3;
        let mut w = Watcher::new(cfg, bus.clone());
        let mut rx = bus.subscribe();

        w.start(&sockets).await;
        assert!(w.is_stopped(), "repeated spawn failure stops the watcher");
        assert!(w.is_empty());

        let mut saw_stop_reason = false;
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::Stop && ev.reason.is_some() {
                saw_stop_reason = true;
            }
        }
        assert!(saw_stop_reason, "stop event carries the exhaustion reason");
    }

    #[tokio::test]
    async fn rolling_reload_replaces_workers_without_a_gap() {
        let (mut w, sockets, _bus) = running_watcher("rolling", 2).await;
        let old: Vec<u64> = w.children.keys().copied().collect();

        w.reload(true, &sockets).await;
        assert_eq!(w.len(), 2, "capacity back at target after the swap");
        let new: Vec<u64> = w.children.keys().copied().collect();
        assert!(new.iter().all(|wid| !old.contains(wid)), "all workers replaced");
        w.stop(false).await;
    }

    #[tokio::test]
    async fn send_hup_reload_keeps_the_same_processes() {
        let bus = Bus::new(64);
        let sockets = SocketRegistry::new();
        let mut cfg = sleeper_config("hup", 1);
        cfg.send_hup = true;
        let mut w = Watcher::new(cfg, bus);
        w.start(&sockets).await;
        let pid = w.pids()[0];

        w.reload(true, &sockets).await;
        // sleep dies on SIGHUP by default, but it is the same pid that got
        // the signal; no respawn happened inside reload itself.
        assert_eq!(w.pids(), vec![pid]);
        w.stop(false).await;
    }

    #[tokio::test]
    async fn set_opt_classifies_actions() {
        let bus = Bus::new(64);
        let mut w = Watcher::new(sleeper_config("opts", 1), bus);

        assert_eq!(w.set_opt("numprocesses", "4").unwrap(), OptAction::Manage);
        assert_eq!(w.set_opt("cmd", "/bin/true").unwrap(), OptAction::Respawn);
        assert_eq!(
            w.set_opt("graceful_timeout", "5").unwrap(),
            OptAction::ConfigOnly
        );
        assert_eq!(w.get_opt("numprocesses").unwrap(), "4");

        let err = w.set_opt("bogus", "1").unwrap_err();
        assert_eq!(err.as_label(), "unknown_option");
        let err = w.set_opt("shell", "maybe").unwrap_err();
        assert_eq!(err.as_label(), "invalid_option_value");
    }

    #[tokio::test]
    async fn singleton_rejects_numprocesses_above_one() {
        let bus = Bus::new(64);
        let mut cfg = sleeper_config("single", 1);
        cfg.singleton = true;
        let mut w = Watcher::new(cfg, bus);

        let err = w.set_opt("numprocesses", "2").unwrap_err();
        assert_eq!(err.as_label(), "singleton");
        assert_eq!(w.config().numprocesses, 1);
    }

    #[tokio::test]
    async fn signal_variants_address_the_right_process() {
        let (mut w, _sockets, _bus) = running_watcher("signals", 2).await;
        let pids = w.pids();

        w.signal_processes(Signal::SIGCONT).unwrap();
        w.signal_process(pids[0], Signal::SIGCONT).unwrap();

        let err = w.signal_process(999_999, Signal::SIGCONT).unwrap_err();
        assert_eq!(err.as_label(), "unknown_process");

        // /bin/sleep forks nothing, so the children list is empty and the
        // children-addressed variant is a no-op.
        w.signal_children_of(pids[0], Signal::SIGCONT).unwrap();
        let err = w
            .signal_child_of(pids[0], 999_999, Signal::SIGCONT)
            .unwrap_err();
        assert_eq!(err.as_label(), "unknown_process");
        w.stop(false).await;
    }
}
