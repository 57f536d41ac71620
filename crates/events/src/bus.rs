//! Publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes "something changed" notifications between process
//! instances. It is not a source of truth: the rule store is committed before
//! anything is published, so a lost or duplicated message only delays or
//! repeats a reload.
//!
//! ## Delivery
//!
//! - **At-least-once acceptable**: consumers must be idempotent
//! - **No ordering guarantees** across publishers
//! - **Broadcast**: every subscription receives every message published after it
//!   was created

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Publish failed due to internal lock poisoning.
    #[error("bus lock poisoned")]
    Poisoned,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A subscription to a message stream.
///
/// ```ignore
/// let mut subscription = bus.subscribe();
/// while let Some(message) = subscription.recv().await {
///     handle(message);
/// }
/// ```
///
/// A subscription has a single consumer. `recv` yields `None` once the bus side
/// of the channel is gone.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Transport-agnostic broadcast bus.
///
/// `publish` may fail (transport down, payload not serializable); failures are
/// surfaced to the caller, which decides whether they are fatal.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
