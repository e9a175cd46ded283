//! # Control surface — typed commands into the running arbiter.
//!
//! Clients hold a cheap, cloneable [`ControlHandle`] and submit [`Command`]s
//! over a bounded mpsc channel. The arbiter's run loop is the only consumer;
//! every command executes under the same serialization as the management
//! tick, so clients never observe a half-applied operation.
//!
//! ## Architecture
//! ```text
//! ControlHandle ──ᴺ── mpsc ──¹── arbiter run loop
//!     │ request()  Envelope { cmd, reply }
//!     │ cast()     Envelope { cmd, None  }
//!     ▼
//! oneshot ◄── Result<Reply, ControlError>
//! ```
//!
//! ## Rules
//! - `request()` resolves only after the command has fully executed; the
//!   reply reflects the post-command state.
//! - `cast()` is fire-and-forget; a full queue drops the command with a
//!   warning rather than blocking the caller.
//! - The command set is closed: arbitrary code never crosses the channel.

mod command;
mod handle;

pub use command::{Command, Reply, SignalTarget, WatcherStats, WatcherSummary};
pub use handle::{channel, ControlHandle, Envelope};
