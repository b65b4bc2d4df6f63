//! One-shot primitives linking a background plugin server to its orchestrator.
//!
//! - [`handshake`] carries exactly one (possibly empty) [`ConnectionDescriptor`]
//!   from the server's startup path to whoever is waiting for it, with a
//!   bounded wait on the receiving side.
//! - [`completion`] tells the orchestrator that the server has fully shut
//!   down. The signal fires when the sender is completed *or* dropped, so a
//!   serve loop that unwinds early still releases its waiter.

use crate::{ConnectionDescriptor, Error, Result};
use core::time::Duration;
use tokio::sync::oneshot;

/// Creates a linked handshake sender and receiver.
pub fn handshake() -> (HandshakeSender, Handshake) {
    let (tx, rx) = oneshot::channel();
    (HandshakeSender(tx), Handshake(rx))
}

/// Server side of the handshake.
#[derive(Debug)]
pub struct HandshakeSender(oneshot::Sender<Option<ConnectionDescriptor>>);

impl HandshakeSender {
    /// Delivers the descriptor. `None` reports readiness without one, which
    /// the receiver treats as [`Error::InvalidDescriptor`].
    ///
    /// Returns `false` if nobody is waiting anymore.
    pub fn send(self, descriptor: Option<ConnectionDescriptor>) -> bool {
        self.0.send(descriptor).is_ok()
    }
}

/// Orchestrator side of the handshake.
#[derive(Debug)]
pub struct Handshake(oneshot::Receiver<Option<ConnectionDescriptor>>);

impl Handshake {
    /// Waits at most `limit` for the server's descriptor.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if nothing arrived within `limit`.
    /// - [`Error::InvalidDescriptor`] if the server sent `None`.
    /// - [`Error::HandshakeAborted`] if the sender was dropped unused.
    pub async fn wait(self, limit: Duration) -> Result<ConnectionDescriptor> {
        match tokio::time::timeout(limit, self.0).await {
            Err(_) => Err(Error::Timeout { after: limit }),
            Ok(Err(_)) => Err(Error::HandshakeAborted),
            Ok(Ok(None)) => Err(Error::InvalidDescriptor),
            Ok(Ok(Some(descriptor))) => Ok(descriptor),
        }
    }
}

/// Creates a linked completion signal and waiter.
pub fn completion() -> (CompletionSignal, Completion) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal(tx), Completion(rx))
}

/// Held by the serve loop for as long as the server is alive.
#[derive(Debug)]
pub struct CompletionSignal(oneshot::Sender<()>);

impl CompletionSignal {
    /// Marks the server as fully stopped. Dropping the signal does the same.
    pub fn complete(self) {
        let _ = self.0.send(());
    }
}

/// Resolves once the matching [`CompletionSignal`] is completed or dropped.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<()>);

impl Completion {
    /// Waits, without bound, for the server to stop.
    pub async fn wait(self) {
        // Both a send and a dropped sender mean the server is gone.
        let _ = self.0.await;
    }
}
