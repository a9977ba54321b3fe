//! A single agent's inbound envelope queue.

use tokio::sync::mpsc;

use crate::domain::Envelope;

/// The receiving half of an agent's mailbox. Wraps `mpsc::Receiver` so
/// callers depend on this crate's type rather than `tokio::sync` directly.
pub struct Mailbox {
    rx: mpsc::Receiver<Envelope>,
}

impl Mailbox {
    pub(super) fn new(rx: mpsc::Receiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Awaits the next envelope, in the order it was sent relative to other
    /// envelopes queued for the same agent. Returns `None` once the bus has
    /// deregistered this mailbox and every queued envelope has been drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Drains every envelope currently queued without waiting for more.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            out.push(envelope);
        }
        out
    }
}
