//! # Arbiter — the supervision engine and its run loop.
//!
//! One arbiter owns every watcher, the socket registry, the flapping
//! detector, and the control channel. A single select loop is the only
//! consumer of commands and the only driver of the management tick, so
//! every mutation of supervision state is serialized by construction.
//!
//! ## Architecture
//! ```text
//!                    ┌────────────────────────────────────────┐
//! ControlHandle ───► │              run loop                  │
//!   (commands)       │  select! {                             │
//!                    │    cancel token      → teardown        │
//! OS signals ──────► │    SIGINT/TERM/QUIT  → teardown        │
//!                    │    command envelope  → dispatch        │
//!                    │    check_delay tick  → tick            │
//!                    │  }                                     │
//!                    └───────┬────────────────────────────────┘
//!                            │ tick:
//!                            │   waitpid(-1) global reap
//!                            │   manage every watcher (parallel)
//!                            │   flapping verdicts
//!                            │   restart cooled-down watchers
//!                            │   wake on-demand watchers
//!                            ▼
//!            Watcher ── Watcher ── Watcher ──► Bus ──► SubscriberSet
//! ```
//!
//! ## Rules
//! - Exactly one `waitpid(-1)` caller exists in the whole process: the
//!   tick's global reap. Exit statuses are routed to the owning watcher by
//!   pid; unknown pids are logged and discarded.
//! - Commands and ticks never interleave: a command observes either the
//!   state before a tick or after it, never the middle.
//! - Watchers start in descending priority order and stop in ascending
//!   order; both walks are sequential.
//! - A failed command never unwinds the loop; the error travels back to the
//!   client in the reply.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, WatcherDiff};
use crate::control::{
    channel, Command, ControlHandle, Envelope, Reply, SignalTarget, WatcherStats, WatcherSummary,
};
use crate::error::{ConfigError, ControlError, SupervisorError};
use crate::events::{Bus, Event, EventKind};
use crate::flapping::{FlappingDetector, Verdict};
use crate::pidfile::Pidfile;
use crate::process::ExitOutcome;
use crate::shutdown::wait_for_shutdown_signal;
use crate::sockets::{SocketConfig, SocketRegistry};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::watcher::Watcher;

/// The supervisor. Built from a [`Config`], optionally decorated with
/// subscribers, then consumed by [`run`](Arbiter::run).
pub struct Arbiter {
    config: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    handle: ControlHandle,
    rx: mpsc::Receiver<Envelope>,
    token: CancellationToken,
}

impl Arbiter {
    /// Creates an arbiter for `config`. Nothing spawns until `run()`.
    pub fn new(config: Config) -> Self {
        let (handle, rx) = channel(config.control_capacity);
        Self {
            config,
            subscribers: Vec::new(),
            handle,
            rx,
            token: CancellationToken::new(),
        }
    }

    /// Attaches an event subscriber. May be called repeatedly.
    pub fn with_subscriber(mut self, sub: Arc<dyn Subscribe>) -> Self {
        self.subscribers.push(sub);
        self
    }

    /// A command handle usable before and during `run()`.
    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// Cancelling this token shuts the arbiter down, same as `SIGTERM`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs the supervisor until a shutdown signal, a `quit` command, or
    /// token cancellation.
    ///
    /// Claims the pid file and binds every socket before the first spawn;
    /// either failure aborts startup. On exit every watcher is stopped
    /// gracefully, sockets are closed, subscribers are drained, and the pid
    /// file is released.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.config.validate()?;

        let pidfile = match &self.config.pidfile {
            Some(path) => Some(Pidfile::claim(path)?),
            None => None,
        };

        let bus = Bus::new(self.config.bus_capacity_clamped());
        let subs = SubscriberSet::new(std::mem::take(&mut self.subscribers), bus.clone());
        let pump = spawn_pump(bus.clone(), subs);

        let mut engine = Engine::new(self.config.clone(), bus.clone());
        if let Err(e) = engine.bind_sockets() {
            if let Some(pf) = pidfile {
                pf.release();
            }
            return Err(e.into());
        }

        info!(watchers = engine.watchers.len(), "arbiter starting");
        engine.start_all().await;
        bus.publish(Event::new(EventKind::Start));

        let tick = self.config.tick_interval();
        let shutdown = wait_for_shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("cancellation requested");
                    break;
                }
                res = &mut shutdown => {
                    if let Err(e) = res {
                        warn!(error = %e, "signal listener failed");
                    } else {
                        info!("shutdown signal received");
                    }
                    break;
                }
                maybe = self.rx.recv() => {
                    // The engine holds a handle clone, so the channel never
                    // closes while we are here.
                    let Some(env) = maybe else { break };
                    let quit = matches!(env.cmd, Command::Quit);
                    engine.dispatch(env).await;
                    if quit {
                        info!("quit command received");
                        break;
                    }
                }
                _ = tokio::time::sleep(tick) => {
                    engine.tick(tick).await;
                }
            }
        }

        engine.teardown().await;
        bus.publish(Event::new(EventKind::Stop));
        drop(engine);
        drop(bus);
        let _ = pump.await;

        if let Some(pf) = pidfile {
            pf.release();
        }
        info!("arbiter stopped");
        Ok(())
    }
}

/// Forwards bus events into the subscriber set until every publisher is
/// gone, then drains the workers.
fn spawn_pump(bus: Bus, subs: SubscriberSet) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    drop(bus);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => subs.emit_arc(Arc::new(ev)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event pump lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        subs.shutdown().await;
    })
}

/// All mutable supervision state, owned exclusively by the run loop.
struct Engine {
    watchers: Vec<Watcher>,
    sockets: SocketRegistry,
    snapshot: Config,
    flapping: FlappingDetector,
    sys: sysinfo::System,
    bus: Bus,
}

impl Engine {
    fn new(config: Config, bus: Bus) -> Self {
        let watchers = config
            .watchers
            .iter()
            .map(|c| Watcher::new(c.clone(), bus.clone()))
            .collect();
        Self {
            watchers,
            sockets: SocketRegistry::new(),
            snapshot: config,
            flapping: FlappingDetector::new(),
            sys: sysinfo::System::new(),
            bus,
        }
    }

    fn bind_sockets(&mut self) -> Result<(), ConfigError> {
        self.sockets.bind_all(&self.snapshot.sockets)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        let name = name.to_lowercase();
        self.watchers.iter().position(|w| w.name() == name)
    }

    fn watcher(&mut self, name: &str) -> Result<&mut Watcher, ControlError> {
        let name_lc = name.to_lowercase();
        self.watchers
            .iter_mut()
            .find(|w| w.name() == name_lc)
            .ok_or(ControlError::UnknownWatcher {
                name: name.to_string(),
            })
    }

    /// Indices in start order: descending priority, stable for ties.
    fn start_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.watchers.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.watchers[i].config().priority));
        order
    }

    /// Starts every autostart watcher, highest priority first, with the
    /// global warmup delay between watchers. On-demand watchers stay down
    /// until their socket sees a connection.
    async fn start_all(&mut self) {
        let warmup = self.snapshot.warmup();
        for idx in self.start_order() {
            let cfg = self.watchers[idx].config();
            if !cfg.autostart || cfg.on_demand {
                continue;
            }
            if self.watchers[idx].is_stopped() {
                self.start_at(idx).await;
                tokio::time::sleep(warmup).await;
            }
        }
    }

    async fn start_at(&mut self, idx: usize) {
        let Engine {
            watchers, sockets, ..
        } = self;
        watchers[idx].start(&*sockets).await;
    }

    /// Stops every watcher, lowest priority first, sequentially.
    async fn stop_all(&mut self, graceful: bool) {
        let mut order = self.start_order();
        order.reverse();
        for idx in order {
            if !self.watchers[idx].is_stopped() {
                self.watchers[idx].stop(graceful).await;
            }
        }
    }

    async fn teardown(&mut self) {
        self.stop_all(true).await;
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One management pass over the whole engine.
    async fn tick(&mut self, tick_interval: Duration) {
        self.global_reap();

        // Manage watchers in parallel; each future owns exactly one watcher
        // and shares the registry immutably.
        let Engine {
            watchers, sockets, ..
        } = self;
        let sockets = &*sockets;
        let reaped: Vec<(String, usize)> = join_all(watchers.iter_mut().map(|w| async move {
            let n = w.manage_processes(sockets).await;
            (w.name().to_string(), n)
        }))
        .await;

        self.apply_flapping(&reaped, tick_interval).await;
        self.restart_cooled_down().await;
        self.wake_on_demand().await;
    }

    /// Drains every pending child exit in one pass and routes each status
    /// to the owning watcher.
    fn global_reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.route_exit(pid.as_raw(), ExitOutcome::Code(code));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.route_exit(pid.as_raw(), ExitOutcome::Signaled(sig as i32));
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(errno = %e, "global reap failed");
                    break;
                }
            }
        }
    }

    fn route_exit(&mut self, pid: i32, outcome: ExitOutcome) {
        for w in &mut self.watchers {
            if w.record_external_exit(pid, outcome) {
                return;
            }
        }
        debug!(pid, "reaped a child no watcher owns");
    }

    /// Feeds this tick's reap counts into the detector and acts on the
    /// verdicts.
    async fn apply_flapping(&mut self, reaped: &[(String, usize)], tick_interval: Duration) {
        let now = Instant::now();
        let mut verdicts: Vec<(String, Verdict, Duration, bool)> = Vec::new();

        for (name, count) in reaped {
            if *count == 0 {
                continue;
            }
            let Some(idx) = self.index_of(name) else { continue };
            let settings = self.watchers[idx].config().flapping.clone();
            for _ in 0..*count {
                self.flapping.record_exit(name, now, settings.attempts);
            }
            if let Some(verdict) = self.flapping.check(name, &settings, tick_interval) {
                let retry_in = Duration::from_secs_f64(settings.retry_in.max(0.0));
                verdicts.push((name.clone(), verdict, retry_in, settings.active));
            }
        }

        for (name, verdict, retry_in, active) in verdicts {
            if !active {
                debug!(watcher = %name, ?verdict, "flapping verdict ignored (inactive)");
                continue;
            }
            match verdict {
                Verdict::Healthy => {}
                Verdict::Retry { .. } => {
                    let Some(idx) = self.index_of(&name) else { continue };
                    self.watchers[idx]
                        .stop_with_reason(false, Some("flapping"))
                        .await;
                    self.flapping.arm_retry(&name, retry_in, Instant::now());
                }
                Verdict::Exhausted => {
                    let Some(idx) = self.index_of(&name) else { continue };
                    self.watchers[idx]
                        .stop_with_reason(false, Some("flapping: retry limit reached"))
                        .await;
                }
            }
        }
    }

    /// Restarts watchers whose flapping cooldown has elapsed.
    ///
    /// Bypasses the operator start path: the consumed retry budget stays in
    /// place, so a watcher that keeps crashing through its cooldowns
    /// eventually exhausts it and stays down.
    async fn restart_cooled_down(&mut self) {
        for name in self.flapping.take_due_retries(Instant::now()) {
            let Some(idx) = self.index_of(&name) else { continue };
            if self.watchers[idx].is_stopped() {
                info!(watcher = %name, "flapping cooldown elapsed; restarting");
                self.start_at(idx).await;
            }
        }
    }

    /// Starts stopped on-demand watchers whose socket has a connection
    /// waiting.
    async fn wake_on_demand(&mut self) {
        let mut wake: Vec<usize> = Vec::new();
        for (idx, w) in self.watchers.iter().enumerate() {
            if !w.is_stopped() || !w.config().on_demand {
                continue;
            }
            let pending = w
                .config()
                .referenced_sockets()
                .iter()
                .any(|s| self.sockets.get(s).is_some_and(|e| e.pending_connection()));
            if pending {
                wake.push(idx);
            }
        }
        for idx in wake {
            info!(watcher = %self.watchers[idx].name(), "waking on-demand watcher");
            self.start_at(idx).await;
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&mut self, env: Envelope) {
        let result = self.execute(env.cmd).await;
        if let Err(e) = &result {
            info!(error = %e.as_message(), "command rejected");
        }
        if let Some(reply) = env.reply {
            let _ = reply.send(result);
        }
    }

    async fn execute(&mut self, cmd: Command) -> Result<Reply, ControlError> {
        match cmd {
            Command::AddWatcher { config, start } => self.add_watcher(config, start).await,
            Command::RmWatcher { name, nostop } => self.rm_watcher(&name, nostop).await,
            Command::Start { name } => {
                match name {
                    Some(name) => {
                        let idx = self
                            .index_of(&name)
                            .ok_or(ControlError::UnknownWatcher { name })?;
                        self.flapping.reset(self.watchers[idx].name());
                        self.start_at(idx).await;
                    }
                    None => {
                        let warmup = self.snapshot.warmup();
                        for idx in self.start_order() {
                            if self.watchers[idx].is_stopped() {
                                self.flapping.reset(self.watchers[idx].name());
                                self.start_at(idx).await;
                                tokio::time::sleep(warmup).await;
                            }
                        }
                    }
                }
                Ok(Reply::Ok)
            }
            Command::Stop { name } => {
                match name {
                    Some(name) => {
                        let idx = self
                            .index_of(&name)
                            .ok_or(ControlError::UnknownWatcher { name })?;
                        // Manual stop cancels any pending flapping restart.
                        self.flapping.reset(self.watchers[idx].name());
                        self.watchers[idx].stop(true).await;
                    }
                    None => {
                        for w in &self.watchers {
                            self.flapping.reset(w.name());
                        }
                        self.stop_all(true).await;
                    }
                }
                Ok(Reply::Ok)
            }
            Command::Restart { name } => {
                match name {
                    Some(name) => {
                        let idx = self
                            .index_of(&name)
                            .ok_or(ControlError::UnknownWatcher { name })?;
                        self.restart_at(idx).await;
                    }
                    None => {
                        self.stop_all(true).await;
                        self.start_all().await;
                    }
                }
                Ok(Reply::Ok)
            }
            Command::Reload { name, graceful } => {
                match name {
                    Some(name) => {
                        let idx = self
                            .index_of(&name)
                            .ok_or(ControlError::UnknownWatcher { name })?;
                        self.reload_at(idx, graceful).await;
                    }
                    None => {
                        for idx in self.start_order() {
                            if !self.watchers[idx].is_stopped() {
                                self.reload_at(idx, graceful).await;
                            }
                        }
                    }
                }
                Ok(Reply::Ok)
            }
            Command::ReloadConfig { config } => {
                self.reload_from_config(*config).await?;
                self.bus.publish(Event::new(EventKind::Reload));
                Ok(Reply::Ok)
            }
            Command::Incr { name, count } => {
                let idx = self
                    .index_of(&name)
                    .ok_or(ControlError::UnknownWatcher { name: name.clone() })?;
                if self.watchers[idx].config().singleton {
                    return Err(ControlError::Singleton {
                        name: name.to_lowercase(),
                    });
                }
                let Engine {
                    watchers, sockets, ..
                } = self;
                Ok(Reply::Count(watchers[idx].incr(count, &*sockets).await))
            }
            Command::Decr { name, count } => {
                let idx = self
                    .index_of(&name)
                    .ok_or(ControlError::UnknownWatcher { name: name.clone() })?;
                if self.watchers[idx].config().singleton {
                    return Err(ControlError::Singleton {
                        name: name.to_lowercase(),
                    });
                }
                let Engine {
                    watchers, sockets, ..
                } = self;
                Ok(Reply::Count(watchers[idx].decr(count, &*sockets).await))
            }
            Command::Signal(target) => self.signal(target),
            Command::SetOption { name, key, value } => {
                let idx = self
                    .index_of(&name)
                    .ok_or(ControlError::UnknownWatcher { name: name.clone() })?;
                let action = self.watchers[idx].set_opt(&key, &value)?;
                let Engine {
                    watchers, sockets, ..
                } = self;
                watchers[idx].do_action(action, &*sockets).await;
                Ok(Reply::Ok)
            }
            Command::GetOption { name, key } => {
                Ok(Reply::Value(self.watcher(&name)?.get_opt(&key)?))
            }
            Command::Options { name } => Ok(Reply::Options(self.watcher(&name)?.options())),
            Command::List { name } => match name {
                Some(name) => Ok(Reply::Pids(self.watcher(&name)?.pids())),
                None => Ok(Reply::Watchers(
                    self.watchers
                        .iter()
                        .map(|w| WatcherSummary {
                            name: w.name().to_string(),
                            status: w.status(),
                            numprocesses: w.config().numprocesses,
                            pids: w.pids(),
                        })
                        .collect(),
                )),
            },
            Command::ListPids => Ok(Reply::PidMap(
                self.watchers
                    .iter()
                    .map(|w| (w.name().to_string(), w.pids()))
                    .collect::<BTreeMap<_, _>>(),
            )),
            Command::Stats { name } => {
                let Engine { watchers, sys, .. } = self;
                let stats = match name {
                    Some(name) => {
                        let name_lc = name.to_lowercase();
                        let w = watchers
                            .iter()
                            .find(|w| w.name() == name_lc)
                            .ok_or(ControlError::UnknownWatcher { name })?;
                        vec![WatcherStats {
                            name: w.name().to_string(),
                            processes: w.info(sys),
                        }]
                    }
                    None => watchers
                        .iter()
                        .map(|w| WatcherStats {
                            name: w.name().to_string(),
                            processes: w.info(sys),
                        })
                        .collect(),
                };
                Ok(Reply::Stats(stats))
            }
            Command::ListSockets => Ok(Reply::Sockets(self.sockets.configs())),
            Command::AddSocket { config } => {
                let name = config.name.to_lowercase();
                self.sockets.add(config)?;
                self.bus
                    .publish(Event::new(EventKind::Add).with_reason(format!("socket {name}")));
                Ok(Reply::Ok)
            }
            Command::RmSocket { name } => {
                self.sockets
                    .remove(&name)
                    .ok_or(ControlError::UnknownSocket { name: name.clone() })?;
                self.bus
                    .publish(Event::new(EventKind::Remove).with_reason(format!("socket {name}")));
                Ok(Reply::Ok)
            }
            Command::NumWatchers => Ok(Reply::Count(self.watchers.len())),
            Command::NumProcesses { name } => match name {
                Some(name) => Ok(Reply::Count(self.watcher(&name)?.len())),
                None => Ok(Reply::Count(self.watchers.iter().map(Watcher::len).sum())),
            },
            Command::GlobalOptions => {
                let c = &self.snapshot;
                Ok(Reply::Options(vec![
                    ("bus_capacity".to_string(), c.bus_capacity.to_string()),
                    ("check_delay".to_string(), c.check_delay.to_string()),
                    ("control_capacity".to_string(), c.control_capacity.to_string()),
                    (
                        "pidfile".to_string(),
                        c.pidfile
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                    ),
                    ("warmup_delay".to_string(), c.warmup_delay.to_string()),
                ]))
            }
            // The run loop breaks right after replying.
            Command::Quit => Ok(Reply::Ok),
        }
    }

    async fn restart_at(&mut self, idx: usize) {
        let Engine {
            watchers, sockets, ..
        } = self;
        watchers[idx].restart(&*sockets).await;
    }

    async fn reload_at(&mut self, idx: usize, graceful: bool) {
        let Engine {
            watchers, sockets, ..
        } = self;
        watchers[idx].reload(graceful, &*sockets).await;
    }

    async fn add_watcher(
        &mut self,
        config: crate::config::WatcherConfig,
        start: bool,
    ) -> Result<Reply, ControlError> {
        config.validate()?;
        let name = config.name.to_lowercase();
        if self.index_of(&name).is_some() {
            return Err(ControlError::AlreadyExists { name });
        }
        for socket in config.referenced_sockets() {
            if self.sockets.get(&socket).is_none() {
                return Err(ConfigError::MissingSocket {
                    watcher: name,
                    socket,
                }
                .into());
            }
        }

        self.watchers.push(Watcher::new(config, self.bus.clone()));
        self.bus
            .publish(Event::new(EventKind::Add).with_watcher(name));
        if start {
            let idx = self.watchers.len() - 1;
            self.start_at(idx).await;
        }
        Ok(Reply::Ok)
    }

    async fn rm_watcher(&mut self, name: &str, nostop: bool) -> Result<Reply, ControlError> {
        let idx = self.index_of(name).ok_or(ControlError::UnknownWatcher {
            name: name.to_string(),
        })?;
        if !nostop {
            self.watchers[idx].stop(true).await;
        }
        let removed = self.watchers.remove(idx);
        self.flapping.forget(removed.name());
        self.bus
            .publish(Event::new(EventKind::Remove).with_watcher(removed.name().to_string()));
        Ok(Reply::Ok)
    }

    fn signal(&mut self, target: SignalTarget) -> Result<Reply, ControlError> {
        let sig = Signal::try_from(target.signum).map_err(|_| ControlError::InvalidSignal {
            signum: target.signum,
        })?;
        let w = self.watcher(&target.name)?;
        match (target.pid, target.child_pid, target.children) {
            (None, _, _) => w.signal_processes(sig)?,
            (Some(pid), Some(child_pid), _) => w.signal_child_of(pid, child_pid, sig)?,
            (Some(pid), None, true) => w.signal_children_of(pid, sig)?,
            (Some(pid), None, false) => w.signal_process(pid, sig)?,
        }
        Ok(Reply::Ok)
    }

    // ------------------------------------------------------------------
    // Configuration reload
    // ------------------------------------------------------------------

    /// Reconciles live state against `new`.
    ///
    /// Validation failures reject the whole reload before anything mutates
    /// (fail closed). A change to any arbiter-level setting restarts
    /// everything; otherwise sockets and watchers are diffed individually,
    /// with deletions applied before additions. A watcher whose only change
    /// is `numprocesses` is rescaled in place; a watcher referencing a
    /// changed or removed socket is treated as changed itself.
    async fn reload_from_config(&mut self, new: Config) -> Result<(), ControlError> {
        new.validate().map_err(ControlError::Config)?;

        if self.snapshot.global_differs(&new) {
            info!("arbiter settings changed; full restart");
            self.stop_all(true).await;
            self.watchers.clear();
            self.flapping = FlappingDetector::new();
            self.sockets = SocketRegistry::new();
            self.sockets
                .bind_all(&new.sockets)
                .map_err(ControlError::Config)?;
            self.watchers = new
                .watchers
                .iter()
                .map(|c| Watcher::new(c.clone(), self.bus.clone()))
                .collect();
            self.snapshot = new;
            self.start_all().await;
            return Ok(());
        }

        // Socket diff: any field difference is delete-then-add.
        let current: BTreeMap<String, SocketConfig> = self
            .sockets
            .configs()
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        let incoming: BTreeMap<String, SocketConfig> = new
            .sockets
            .iter()
            .map(|c| {
                let mut c = c.clone();
                c.name = c.name.to_lowercase();
                (c.name.clone(), c)
            })
            .collect();

        let mut dirty_sockets: BTreeSet<String> = BTreeSet::new();
        let mut removed_sockets: Vec<String> = Vec::new();
        let mut added_sockets: Vec<String> = Vec::new();
        for (name, cfg) in &current {
            match incoming.get(name) {
                None => {
                    removed_sockets.push(name.clone());
                    dirty_sockets.insert(name.clone());
                }
                Some(new_cfg) if new_cfg != cfg => {
                    removed_sockets.push(name.clone());
                    added_sockets.push(name.clone());
                    dirty_sockets.insert(name.clone());
                }
                Some(_) => {}
            }
        }
        for name in incoming.keys() {
            if !current.contains_key(name) {
                added_sockets.push(name.clone());
            }
        }

        // Watcher diff against the live definitions.
        let mut removed_watchers: Vec<String> = Vec::new();
        let mut changed_watchers: Vec<String> = Vec::new();
        let mut rescaled: Vec<(String, usize)> = Vec::new();
        for w in &self.watchers {
            let name = w.name().to_string();
            match new.watcher(&name) {
                None => removed_watchers.push(name),
                Some(nc) => {
                    let touches_dirty = w
                        .config()
                        .referenced_sockets()
                        .iter()
                        .any(|s| dirty_sockets.contains(s))
                        || nc
                            .referenced_sockets()
                            .iter()
                            .any(|s| dirty_sockets.contains(s));
                    match w.config().diff(nc) {
                        _ if touches_dirty => changed_watchers.push(name),
                        WatcherDiff::Unchanged => {}
                        WatcherDiff::NumprocessesOnly => rescaled.push((name, nc.numprocesses)),
                        WatcherDiff::Changed => changed_watchers.push(name),
                    }
                }
            }
        }
        let mut added_watchers: Vec<String> = Vec::new();
        for nc in &new.watchers {
            let name = nc.name.to_lowercase();
            if self.index_of(&name).is_none() {
                added_watchers.push(name);
            }
        }

        // Deletions first: changed watchers go down before their sockets
        // are rebound, changed sockets are rebound before anything new
        // starts.
        for name in removed_watchers.iter().chain(changed_watchers.iter()) {
            let Some(idx) = self.index_of(name) else { continue };
            self.watchers[idx].stop(true).await;
            let removed = self.watchers.remove(idx);
            self.flapping.forget(removed.name());
            self.bus
                .publish(Event::new(EventKind::Remove).with_watcher(removed.name().to_string()));
        }
        for name in &removed_sockets {
            self.sockets.remove(name);
        }
        for name in &added_sockets {
            let Some(cfg) = incoming.get(name).cloned() else { continue };
            self.sockets.add(cfg).map_err(ControlError::Config)?;
        }
        for (name, n) in rescaled {
            let Some(idx) = self.index_of(&name) else { continue };
            let Engine {
                watchers, sockets, ..
            } = self;
            watchers[idx].set_numprocesses(n, &*sockets).await;
        }
        for name in changed_watchers.iter().chain(added_watchers.iter()) {
            let Some(cfg) = new.watcher(name).cloned() else { continue };
            let autostart = cfg.autostart && !cfg.on_demand;
            self.watchers.push(Watcher::new(cfg, self.bus.clone()));
            self.bus
                .publish(Event::new(EventKind::Add).with_watcher(name.clone()));
            if autostart {
                let idx = self.watchers.len() - 1;
                self.start_at(idx).await;
            }
        }

        self.snapshot = new;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatcherConfig;

    fn sleeper(name: &str, count: usize) -> WatcherConfig {
        let mut cfg = WatcherConfig::new(name, "/bin/sleep");
        cfg.args = vec!["30".to_string()];
        cfg.numprocesses = count;
        cfg.stop_signal = "SIGTERM".to_string();
        cfg.graceful_timeout = 2.0;
        cfg
    }

    fn engine_with(watchers: Vec<WatcherConfig>, sockets: Vec<SocketConfig>) -> Engine {
        let config = Config {
            watchers,
            sockets,
            ..Config::default()
        };
        let bus = Bus::new(64);
        let mut engine = Engine::new(config, bus);
        engine.bind_sockets().unwrap();
        engine
    }

    #[tokio::test]
    async fn commands_round_trip_through_the_engine() {
        let mut engine = engine_with(vec![sleeper("web", 2)], vec![]);
        engine.start_all().await;

        match engine.execute(Command::NumWatchers).await.unwrap() {
            Reply::Count(n) => assert_eq!(n, 1),
            other => panic!("unexpected reply: {other:?}"),
        }
        match engine
            .execute(Command::List { name: None })
            .await
            .unwrap()
        {
            Reply::Watchers(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].name, "web");
                assert_eq!(list[0].status, "active");
                assert_eq!(list[0].pids.len(), 2);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let err = engine
            .execute(Command::Start {
                name: Some("nope".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "unknown_watcher");

        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn incr_and_decr_are_refused_for_singletons() {
        let mut single = sleeper("lone", 1);
        single.singleton = true;
        let mut engine = engine_with(vec![single], vec![]);
        engine.start_all().await;

        let err = engine
            .execute(Command::Incr {
                name: "lone".to_string(),
                count: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "singleton");
        assert_eq!(engine.watchers[0].len(), 1);
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn reload_with_only_numprocesses_changed_keeps_processes() {
        let mut engine = engine_with(vec![sleeper("web", 1)], vec![]);
        engine.start_all().await;
        let old_pids = engine.watchers[0].pids();

        let mut new = engine.snapshot.clone();
        new.watchers[0].numprocesses = 3;
        engine.reload_from_config(new).await.unwrap();

        let pids = engine.watchers[0].pids();
        assert_eq!(pids.len(), 3, "rescaled in place to the new target");
        assert!(
            pids.contains(&old_pids[0]),
            "the original process survived the reload"
        );
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn reload_replaces_a_watcher_whose_command_changed() {
        let mut engine = engine_with(vec![sleeper("web", 1)], vec![]);
        engine.start_all().await;
        let old_pid = engine.watchers[0].pids()[0];

        let mut new = engine.snapshot.clone();
        new.watchers[0].args = vec!["60".to_string()];
        engine.reload_from_config(new).await.unwrap();

        assert_eq!(engine.watchers.len(), 1);
        let pids = engine.watchers[0].pids();
        assert_eq!(pids.len(), 1);
        assert_ne!(pids[0], old_pid, "the watcher was fully replaced");
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn reload_restarts_watchers_bound_to_a_changed_socket() {
        let socket = SocketConfig::tcp("web", "127.0.0.1", 0);
        let mut cfg = sleeper("server", 1);
        cfg.args = vec!["30".to_string(), "$(procvisor.sockets.web)".to_string()];
        let mut engine = engine_with(vec![cfg], vec![socket]);
        engine.start_all().await;
        let old_pid = engine.watchers[0].pids()[0];
        let old_fd = engine.sockets.get("web").unwrap().fd();

        let mut new = engine.snapshot.clone();
        new.sockets[0].backlog = 64;
        engine.reload_from_config(new).await.unwrap();

        assert_eq!(engine.sockets.get("web").unwrap().config().backlog, 64);
        let pids = engine.watchers[0].pids();
        assert_ne!(pids[0], old_pid, "watcher restarted with the rebound socket");
        let _ = old_fd;
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn reload_applies_deletions_and_additions() {
        let mut engine = engine_with(vec![sleeper("old", 1)], vec![]);
        engine.start_all().await;

        let mut new = engine.snapshot.clone();
        new.watchers = vec![sleeper("fresh", 1)];
        engine.reload_from_config(new).await.unwrap();

        assert_eq!(engine.watchers.len(), 1);
        assert_eq!(engine.watchers[0].name(), "fresh");
        assert_eq!(engine.watchers[0].len(), 1, "added watcher autostarted");
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn invalid_reload_leaves_live_state_untouched() {
        let mut engine = engine_with(vec![sleeper("web", 1)], vec![]);
        engine.start_all().await;
        let pid = engine.watchers[0].pids()[0];

        let mut new = engine.snapshot.clone();
        let mut dup = sleeper("WEB", 1);
        dup.cmd = "/bin/true".to_string();
        new.watchers.push(dup);
        let err = engine.reload_from_config(new).await.unwrap_err();
        assert_eq!(err.as_label(), "config_duplicate_watcher");

        assert_eq!(engine.watchers[0].pids(), vec![pid], "nothing was touched");
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn crash_loop_stops_the_watcher_through_flapping() {
        let mut cfg = WatcherConfig::new("crashy", "/bin/true");
        cfg.numprocesses = 1;
        cfg.max_retry = 50;
        cfg.flapping.attempts = 2;
        cfg.flapping.window = 10.0;
        cfg.flapping.max_retry = 0;
        let mut engine = engine_with(vec![cfg], vec![]);
        engine.start_all().await;

        let mut stopped = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.tick(Duration::ZERO).await;
            if engine.watchers[0].is_stopped() {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "the crash loop was detected and the watcher stopped");
        assert!(engine.watchers[0].is_empty());
    }

    #[tokio::test]
    async fn flapping_retry_budget_survives_the_cooldown_restart() {
        let mut cfg = WatcherConfig::new("crashy", "/bin/true");
        cfg.numprocesses = 1;
        cfg.max_retry = 50;
        cfg.flapping.attempts = 2;
        cfg.flapping.window = 10.0;
        cfg.flapping.retry_in = 0.1;
        cfg.flapping.max_retry = 1;
        let mut engine = engine_with(vec![cfg], vec![]);
        engine.start_all().await;

        // First burst stops the watcher with one retry in flight.
        let mut stopped = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.tick(Duration::ZERO).await;
            if engine.watchers[0].is_stopped() {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "first burst was detected");

        // The cooldown elapses and the tick restarts the watcher by itself.
        let mut restarted = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.tick(Duration::ZERO).await;
            if !engine.watchers[0].is_stopped() {
                restarted = true;
                break;
            }
        }
        assert!(restarted, "cooldown restarted the watcher");

        // Second burst spends the single retry; the watcher goes down again.
        let mut exhausted = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.tick(Duration::ZERO).await;
            if engine.watchers[0].is_stopped() {
                exhausted = true;
                break;
            }
        }
        assert!(exhausted, "second burst was detected");

        // No further retry is pending: ticking well past the cooldown leaves
        // the watcher down.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.tick(Duration::ZERO).await;
            assert!(engine.watchers[0].is_stopped(), "the retry budget is spent");
        }
    }

    #[tokio::test]
    async fn start_all_command_paces_watchers_with_the_warmup_delay() {
        let config = Config {
            warmup_delay: 0.2,
            watchers: vec![sleeper("a", 1), sleeper("b", 1)],
            ..Config::default()
        };
        let mut engine = Engine::new(config, Bus::new(64));
        engine.bind_sockets().unwrap();

        let t0 = Instant::now();
        engine.execute(Command::Start { name: None }).await.unwrap();
        assert!(
            t0.elapsed() >= Duration::from_millis(400),
            "one warmup pause per started watcher"
        );
        assert!(!engine.watchers[0].is_stopped());
        assert!(!engine.watchers[1].is_stopped());
        engine.stop_all(false).await;
    }

    #[tokio::test]
    async fn on_demand_watcher_wakes_on_a_pending_connection() {
        let socket = SocketConfig::tcp("front", "127.0.0.1", 0);
        let mut cfg = sleeper("lazy", 1);
        cfg.args = vec!["30".to_string(), "$(procvisor.sockets.front)".to_string()];
        cfg.on_demand = true;
        let mut engine = engine_with(vec![cfg], vec![socket]);

        engine.start_all().await;
        assert!(engine.watchers[0].is_stopped(), "on-demand stays down at startup");

        // A client knocks; the next tick wakes the watcher.
        let addr = local_addr_of(&engine, "front");
        let _client = std::net::TcpStream::connect(addr).unwrap();

        engine.tick(Duration::ZERO).await;
        assert!(!engine.watchers[0].is_stopped(), "watcher woke up");
        assert_eq!(engine.watchers[0].len(), 1);
        engine.stop_all(false).await;
    }

    /// Recovers the kernel-assigned port of a registry socket bound to
    /// port 0.
    fn local_addr_of(engine: &Engine, name: &str) -> std::net::SocketAddr {
        let fd = engine.sockets.get(name).unwrap().fd();
        let addr = nix::sys::socket::getsockname::<nix::sys::socket::SockaddrIn>(fd).unwrap();
        std::net::SocketAddr::from((addr.ip(), addr.port()))
    }

    #[tokio::test]
    async fn add_and_remove_watcher_at_runtime() {
        let mut engine = engine_with(vec![], vec![]);

        engine
            .execute(Command::AddWatcher {
                config: sleeper("late", 1),
                start: true,
            })
            .await
            .unwrap();
        assert_eq!(engine.watchers.len(), 1);
        assert_eq!(engine.watchers[0].len(), 1);

        let err = engine
            .execute(Command::AddWatcher {
                config: sleeper("LATE", 1),
                start: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "watcher_exists");

        engine
            .execute(Command::RmWatcher {
                name: "late".to_string(),
                nostop: false,
            })
            .await
            .unwrap();
        assert!(engine.watchers.is_empty());
    }
}
