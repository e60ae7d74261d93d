//! Fire-and-forget message transports.
//!
//! A transport can do exactly two things: post a value to the peer, and hand
//! out subscriptions that observe every value delivered to this side. There is
//! no request/response correlation and no acknowledgement; values posted while
//! nobody on the far side is subscribed are lost.

pub mod memory;
pub mod stream;

pub use memory::MemoryTransport;
pub use stream::StreamTransport;

use crate::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// A raw bidirectional message transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a value to the peer without waiting for any reply.
    async fn post(&self, message: Value) -> Result<()>;

    /// Observe every value delivered to this side of the transport.
    ///
    /// Dropping the subscription unregisters it.
    fn subscribe(&self) -> Subscription;
}

/// Stream of values delivered to one subscriber, in arrival order.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Wait for the next value. Returns `None` once the mailbox is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Take the next value if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

/// Receiving side of a transport.
///
/// Fans every delivered value out to all live subscribers. Closed
/// subscriptions are pruned on the next delivery.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Value>>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { rx }
    }

    /// Deliver a value to every subscriber, returning how many received it.
    pub fn deliver(&self, value: Value) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}
