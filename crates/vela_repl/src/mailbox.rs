//! In-process mailbox fabric.
//!
//! A `Mailbox<T>` is a typed receiving endpoint; its `Address<T>` handles can
//! be cloned, embedded in messages, and shipped across tasks. Delivery is
//! at-most-once and never blocks the sender; a message to a closed mailbox is
//! dropped. Request/response pairs carry a oneshot ack sender inside the
//! request message.

use tokio::sync::mpsc;

/// Sending side of a mailbox.
pub struct Address<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> Address<T> {
    /// Deliver `message` if the mailbox still exists.
    pub fn send(&self, message: T) {
        if self.tx.send(message).is_err() {
            tracing::debug!("dropped message to a closed mailbox");
        }
    }
}

/// Receiving side of a mailbox.
pub struct Mailbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
    addr: Address<T>,
}

impl<T: Send> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            addr: Address { tx },
        }
    }

    pub fn address(&self) -> Address<T> {
        self.addr.clone()
    }

    /// Receive the next message, or `None` once every address is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T: Send> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let mut mailbox = Mailbox::new();
        let addr = mailbox.address();
        addr.send(1u32);
        addr.clone().send(2);
        assert_eq!(mailbox.recv().await, Some(1));
        assert_eq!(mailbox.recv().await, Some(2));
    }

    #[tokio::test]
    async fn send_to_dropped_mailbox_is_silent() {
        let mailbox = Mailbox::new();
        let addr = mailbox.address();
        drop(mailbox);
        addr.send(5u32);
    }
}
