//! One supervised OS process: spawn spec, live handle, usage snapshot.
//!
//! ## Contents
//! - [`ChildSpec`] fully-resolved spawn parameters (argv, cwd, env, identity, rlimits, inherited fds)
//! - [`ChildHandle`] the live process: poll, signal, children
//! - [`ProcessInfo`] point-in-time resource usage for the `stats` command
//!
//! ## Quick reference
//! - **Builders**: the watcher builds a [`ChildSpec`] from its live options
//!   right before each spawn.
//! - **Reapers**: [`ChildHandle::poll`] per pid, or the arbiter's global
//!   `waitpid(-1, WNOHANG)` pass routed through [`ChildHandle::record_exit`].

mod child;
mod info;
mod spec;

pub use child::{ChildHandle, ExitOutcome};
pub use info::ProcessInfo;
pub use spec::{parse_rlimit, parse_signal, ChildSpec};
