//! Client-side handle and the channel envelope.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::ControlError;

use super::command::{Command, Reply};

/// One command in flight, with its optional reply slot.
pub struct Envelope {
    /// The command to execute.
    pub cmd: Command,
    /// Where to deliver the result; `None` for fire-and-forget.
    pub reply: Option<oneshot::Sender<Result<Reply, ControlError>>>,
}

/// Builds the bounded command channel; the receiver goes to the arbiter.
pub fn channel(capacity: usize) -> (ControlHandle, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ControlHandle { tx }, rx)
}

/// Cheap, cloneable entry point for submitting commands to a running
/// arbiter.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ControlHandle {
    /// Submits a command and waits for it to fully execute.
    ///
    /// Returns [`ControlError::Closed`] once the arbiter is gone.
    pub async fn request(&self, cmd: Command) -> Result<Reply, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                cmd,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| ControlError::Closed)?;
        reply_rx.await.map_err(|_| ControlError::Closed)?
    }

    /// Submits a command without waiting for a result.
    ///
    /// A full queue drops the command with a warning; only a closed channel
    /// is an error.
    pub fn cast(&self, cmd: Command) -> Result<(), ControlError> {
        match self.tx.try_send(Envelope { cmd, reply: None }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(env)) => {
                warn!(cmd = ?env.cmd, "control queue full; command dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ControlError::Closed),
        }
    }

    /// True once the arbiter side of the channel is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_round_trips_through_a_consumer() {
        let (handle, mut rx) = channel(4);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if let Some(reply) = env.reply {
                    let _ = reply.send(Ok(Reply::Count(3)));
                }
            }
        });

        match handle.request(Command::NumWatchers).await.unwrap() {
            Reply::Count(n) => assert_eq!(n, 3),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_fails_closed_when_the_arbiter_is_gone() {
        let (handle, rx) = channel(4);
        drop(rx);
        assert!(handle.is_closed());
        let err = handle.request(Command::NumWatchers).await.unwrap_err();
        assert_eq!(err.as_label(), "control_closed");
    }

    #[tokio::test]
    async fn request_fails_closed_when_the_reply_is_dropped() {
        let (handle, mut rx) = channel(4);
        tokio::spawn(async move {
            // Consume the envelope but never answer.
            let _ = rx.recv().await;
        });
        let err = handle.request(Command::NumWatchers).await.unwrap_err();
        assert_eq!(err.as_label(), "control_closed");
    }

    #[tokio::test]
    async fn cast_drops_on_a_full_queue_but_errors_on_closed() {
        let (handle, rx) = channel(1);
        handle.cast(Command::NumWatchers).unwrap();
        // Queue full: dropped silently.
        handle.cast(Command::NumWatchers).unwrap();
        drop(rx);
        let err = handle.cast(Command::NumWatchers).unwrap_err();
        assert_eq!(err.as_label(), "control_closed");
    }
}
