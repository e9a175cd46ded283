//! # ChildHandle — one supervised OS process.
//!
//! A [`ChildHandle`] wraps one spawned worker: its worker id (`wid`), OS pid,
//! start timestamps, and the exit outcome once known. All process-level
//! operations (poll, signal, children) go through this type; policy
//! (retry, respawn, escalation pacing) lives in the watcher.
//!
//! ## Reaping discipline
//! The handle never keeps the `std::process::Child` around: the engine owns
//! reaping, either per-pid via [`ChildHandle::poll`] or globally via the
//! arbiter's `waitpid(-1, WNOHANG)` pass, which routes outcomes back through
//! [`ChildHandle::record_exit`]. Whichever side reaps first wins; the other
//! observes the recorded outcome instead of racing the kernel.
//!
//! ## Rules
//! - `pid` is immutable once set; a handle is never re-used for another exec.
//! - Signaling a process that is already gone (`ESRCH`) is success.
//! - The pre-exec stage runs `setsid` first, so every worker leads its own
//!   session and can be addressed as a group.

use std::io;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::ProcessError;
use crate::process::info::ProcessInfo;
use crate::process::spec::ChildSpec;

/// How a child left the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited voluntarily with this status code.
    Code(i32),
    /// Terminated by this signal number.
    Signaled(i32),
    /// Reaped by someone else (`ECHILD`); the real status is unknown.
    Unknown,
}

/// Handle to one spawned worker process.
#[derive(Debug)]
pub struct ChildHandle {
    wid: u64,
    pid: i32,
    cmdline: String,
    started_at: Instant,
    started_wall: SystemTime,
    exit: Option<ExitOutcome>,
}

impl ChildHandle {
    /// Spawns the process described by `spec` and wraps it in a handle.
    ///
    /// The pre-exec stage (in order): new session via `setsid`, resource
    /// limits, gid, uid, then clearing close-on-exec on inherited socket
    /// descriptors. Any failure there surfaces as [`ProcessError::Spawn`].
    ///
    /// Does not retry: the watcher owns the retry budget.
    pub fn spawn(wid: u64, spec: &ChildSpec) -> Result<Self, ProcessError> {
        let (program, args) = spec.exec_vector();

        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null()).envs(&spec.env);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let uid = spec.uid;
        let gid = spec.gid;
        let rlimits = spec.rlimits.clone();
        let fds = spec.inherit_fds.clone();
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                for (resource, limit) in &rlimits {
                    nix::sys::resource::setrlimit(*resource, *limit, *limit)
                        .map_err(io::Error::from)?;
                }
                if let Some(gid) = gid {
                    if libc::setgid(gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if let Some(uid) = uid {
                    if libc::setuid(uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                for fd in &fds {
                    if libc::fcntl(*fd, libc::F_SETFD, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn { source })?;
        let pid = child.id() as i32;
        // The Child is dropped on purpose: reaping happens via waitpid, never
        // through the std handle.
        drop(child);

        debug!(wid, pid, cmd = %spec.cmdline(), "spawned");
        Ok(Self {
            wid,
            pid,
            cmdline: spec.cmdline(),
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
            exit: None,
        })
    }

    /// Worker id, unique and monotonically increasing within the watcher.
    #[inline]
    pub fn wid(&self) -> u64 {
        self.wid
    }

    /// OS pid. Immutable for the lifetime of the handle.
    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The command line this worker was started with.
    #[inline]
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// Time since the worker was spawned.
    #[inline]
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wall-clock spawn time (for process info).
    #[inline]
    pub fn started_wall(&self) -> SystemTime {
        self.started_wall
    }

    /// Non-blocking exit check.
    ///
    /// Returns `Ok(None)` while the process is still running. Once an
    /// outcome is known it is recorded and every later call returns it
    /// without touching the kernel. `ECHILD` means another reaper got there
    /// first and maps to [`ExitOutcome::Unknown`].
    pub fn poll(&mut self) -> Result<Option<ExitOutcome>, ProcessError> {
        if let Some(out) = self.exit {
            return Ok(Some(out));
        }
        match waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(WaitStatus::Exited(_, code)) => {
                self.exit = Some(ExitOutcome::Code(code));
                Ok(self.exit)
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.exit = Some(ExitOutcome::Signaled(sig as i32));
                Ok(self.exit)
            }
            // Stopped/continued: the process still exists.
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => {
                self.exit = Some(ExitOutcome::Unknown);
                Ok(self.exit)
            }
            Err(source) => Err(ProcessError::Wait { source }),
        }
    }

    /// Records an exit observed elsewhere (the arbiter's global reap pass).
    ///
    /// Keeps the first recorded outcome if called twice.
    pub fn record_exit(&mut self, outcome: ExitOutcome) {
        if self.exit.is_none() {
            self.exit = Some(outcome);
        }
    }

    /// The recorded exit outcome, if the process is known to be gone.
    #[inline]
    pub fn exit(&self) -> Option<ExitOutcome> {
        self.exit
    }

    /// Delivers `sig` to the process. `ESRCH` is success (already gone).
    pub fn signal(&self, sig: Signal) -> Result<(), ProcessError> {
        match kill(Pid::from_raw(self.pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }

    /// Delivers `sig` to every direct OS child of this process.
    pub fn signal_children(&self, sig: Signal) -> Result<(), ProcessError> {
        for pid in self.children() {
            match kill(Pid::from_raw(pid), sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => return Err(ProcessError::Signal { pid, source }),
            }
        }
        Ok(())
    }

    /// Delivers `sig` to one specific direct child of this process.
    ///
    /// Returns `Ok(false)` when `child_pid` is not one of this process's
    /// children (nothing is signaled in that case).
    pub fn signal_child(&self, child_pid: i32, sig: Signal) -> Result<bool, ProcessError> {
        if !self.children().contains(&child_pid) {
            return Ok(false);
        }
        match kill(Pid::from_raw(child_pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(true),
            Err(source) => Err(ProcessError::Signal {
                pid: child_pid,
                source,
            }),
        }
    }

    /// SIGTERM convenience; does not block or wait.
    pub fn stop(&self) -> Result<(), ProcessError> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.signal(Signal::SIGTERM)
    }

    /// Direct OS children of this process.
    ///
    /// Read from procfs; an unreadable entry degrades to an empty list
    /// rather than an error.
    pub fn children(&self) -> Vec<i32> {
        let path = format!("/proc/{pid}/task/{pid}/children", pid = self.pid);
        match std::fs::read_to_string(path) {
            Ok(s) => s.split_whitespace().filter_map(|t| t.parse().ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Collects resource usage for this process.
    ///
    /// Each metric that cannot be read degrades to `None` instead of failing
    /// the whole call.
    pub fn info(&self, sys: &mut sysinfo::System) -> ProcessInfo {
        let spid = sysinfo::Pid::from_u32(self.pid as u32);
        let proc = if sys.refresh_process(spid) {
            sys.process(spid)
        } else {
            None
        };

        ProcessInfo {
            pid: self.pid,
            wid: self.wid,
            cmdline: self.cmdline.clone(),
            cpu_percent: proc.map(|p| p.cpu_usage()),
            memory_bytes: proc.map(|p| p.memory()),
            uptime_secs: proc.map(|p| p.run_time()),
            age_secs: self.age().as_secs_f64(),
            children: self.children(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> ChildHandle {
        ChildHandle::spawn(1, &ChildSpec::new("/bin/sleep", ["30"])).expect("spawn sleep")
    }

    #[test]
    fn poll_running_process_returns_none() {
        let mut child = sleeper();
        assert_eq!(child.poll().unwrap(), None);
        child.signal(Signal::SIGKILL).unwrap();
        // Reap so the test leaves no zombie behind.
        loop {
            if child.poll().unwrap().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn killed_process_reports_signal_outcome() {
        let mut child = sleeper();
        child.signal(Signal::SIGKILL).unwrap();
        let outcome = loop {
            if let Some(out) = child.poll().unwrap() {
                break out;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(outcome, ExitOutcome::Signaled(libc::SIGKILL));
        // Subsequent polls replay the recorded outcome.
        assert_eq!(child.poll().unwrap(), Some(outcome));
    }

    #[test]
    fn exited_process_reports_code() {
        let mut spec = ChildSpec::new("exit 7", Vec::<String>::new());
        spec.shell = true;
        let mut child = ChildHandle::spawn(2, &spec).expect("spawn shell");
        let outcome = loop {
            if let Some(out) = child.poll().unwrap() {
                break out;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(outcome, ExitOutcome::Code(7));
    }

    #[test]
    fn signaling_a_dead_pid_is_tolerated() {
        let mut child = sleeper();
        child.signal(Signal::SIGKILL).unwrap();
        while child.poll().unwrap().is_none() {
            std::thread::sleep(Duration::from_millis(10));
        }
        // The pid is fully reaped; ESRCH must be swallowed.
        assert!(child.signal(Signal::SIGTERM).is_ok());
        assert!(child.stop().is_ok());
    }

    #[test]
    fn spawn_failure_carries_os_error() {
        let err = ChildHandle::spawn(1, &ChildSpec::new("/nonexistent-binary-procvisor", Vec::<String>::new()))
            .unwrap_err();
        assert_eq!(err.as_label(), "process_spawn_failed");
    }

    #[test]
    fn record_exit_keeps_first_outcome() {
        let mut child = sleeper();
        child.record_exit(ExitOutcome::Code(0));
        child.record_exit(ExitOutcome::Unknown);
        assert_eq!(child.exit(), Some(ExitOutcome::Code(0)));
        // Cleanup: the process is still alive, kill and reap it.
        let _ = kill(Pid::from_raw(child.pid()), Signal::SIGKILL);
        let _ = waitpid(Pid::from_raw(child.pid()), None);
    }
}
