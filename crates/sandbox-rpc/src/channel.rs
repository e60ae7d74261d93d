//! The RPC channel.
//!
//! A [`Channel`] turns a fire-and-forget [`Transport`] into a symmetric
//! call/serve API. Both endpoints run the same code: each serves a
//! [`Handlers`] table to its peer and can call the peer's operations.
//!
//! # Handshake
//!
//! `start` transmits `syn`. A channel receiving `syn` answers `ack` and marks
//! itself ready; a channel receiving `ack` marks itself ready. Whichever side
//! starts last completes the exchange, so neither side needs a fixed role.
//! Calls issued before readiness wait for it instead of racing it.
//!
//! # Thread Safety
//!
//! State sits behind a `std::sync::Mutex` that is never held across an
//! await point. Inbound calls run on their own spawned tasks, so a slow
//! handler does not hold up other messages.

use crate::error::{HandlerError, Result, RpcError};
use crate::handler::Handlers;
use crate::pending::PendingCalls;
use crate::protocol::{ChannelId, Envelope, Message, Outcome, Routed};
use crate::transport::{Subscription, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Inactive,
    Active,
    Stopped,
}

/// One RPC session bound to a transport and a channel identifier.
pub struct Channel {
    shared: Arc<Shared>,
}

struct Shared {
    id: ChannelId,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    /// One-shot readiness: flips to true once and stays there.
    ready: watch::Sender<bool>,
    /// Bumped on every `stop` to wake calls still waiting for readiness.
    stops: watch::Sender<u64>,
}

struct State {
    lifecycle: Lifecycle,
    handlers: Arc<Handlers>,
    pending: PendingCalls,
    listener: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn new(transport: Arc<dyn Transport>, id: impl Into<ChannelId>) -> Self {
        let (ready, _) = watch::channel(false);
        let (stops, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                transport,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Inactive,
                    handlers: Arc::new(Handlers::new()),
                    pending: PendingCalls::default(),
                    listener: None,
                }),
                ready,
                stops,
            }),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.shared.id
    }

    pub fn state(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    /// True once the handshake has completed.
    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    /// Number of outbound calls still waiting for their return.
    pub fn pending_calls(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Start serving `handlers`, listen on the transport and send `syn`.
    ///
    /// Fails with [`RpcError::AlreadyActive`] if the channel is already active.
    /// Must be called inside a tokio runtime.
    ///
    /// If `syn` cannot be sent the channel returns to its previous state.
    pub async fn start(&self, handlers: Handlers) -> Result<()> {
        let previous = {
            let mut state = self.shared.lock();
            if state.lifecycle == Lifecycle::Active {
                return Err(RpcError::AlreadyActive);
            }

            // Subscribe before sending syn so the peer's ack cannot be missed.
            let subscription = self.shared.transport.subscribe();
            let previous = state.lifecycle;
            state.lifecycle = Lifecycle::Active;
            state.handlers = Arc::new(handlers);
            state.listener = Some(tokio::spawn(Shared::listen(
                Arc::clone(&self.shared),
                subscription,
            )));
            previous
        };

        if let Err(e) = self.shared.send(Message::Syn).await {
            let listener = {
                let mut state = self.shared.lock();
                if state.lifecycle == Lifecycle::Active {
                    state.lifecycle = previous;
                    state.listener.take()
                } else {
                    None
                }
            };
            if let Some(listener) = listener {
                listener.abort();
            }
            warn!("RPC channel {} failed to start: {}", self.shared.id, e);
            return Err(e);
        }

        info!("RPC channel {} started", self.shared.id);
        Ok(())
    }

    /// Stop listening and reject every pending call with [`RpcError::Stopped`].
    ///
    /// Fails with [`RpcError::NotActive`] unless the channel is active.
    pub fn stop(&self) -> Result<()> {
        let (listener, rejected) = {
            let mut state = self.shared.lock();
            if state.lifecycle != Lifecycle::Active {
                return Err(RpcError::NotActive);
            }

            state.lifecycle = Lifecycle::Stopped;
            (state.listener.take(), state.pending.reject_all())
        };

        if let Some(listener) = listener {
            listener.abort();
        }
        self.shared.stops.send_modify(|n| *n += 1);

        info!(
            "RPC channel {} stopped ({} pending calls rejected)",
            self.shared.id, rejected
        );
        Ok(())
    }

    /// Wait for the handshake to complete.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut stops = self.active_stops()?;
        self.shared.wait_ready(&mut stops).await
    }

    /// Call `handler` on the peer and wait for its result.
    pub async fn call(&self, handler: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        let handler = handler.into();
        let mut stops = self.active_stops()?;
        self.shared.wait_ready(&mut stops).await?;

        let (id, completion) = {
            let mut state = self.shared.lock();
            if state.lifecycle != Lifecycle::Active {
                return Err(RpcError::Stopped);
            }
            state.pending.register()
        };
        // Removes the entry on every exit path, including a dropped future.
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        debug!("RPC channel {} calling {} (id {})", self.shared.id, handler, id);
        self.shared
            .send(Message::Call { id, handler, args })
            .await?;

        completion.await.unwrap_or(Err(RpcError::Stopped))
    }

    /// Like [`Channel::call`], with serde conversion of arguments and result.
    ///
    /// Arguments serializing to an array (a tuple, a `Vec`) are sent as the
    /// argument list; `()` sends no arguments; anything else is sent as a single
    /// argument.
    pub async fn call_typed<A, R>(&self, handler: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let result = self.call(handler, args).await?;
        Ok(serde_json::from_value(result)?)
    }

    fn active_stops(&self) -> Result<watch::Receiver<u64>> {
        let state = self.shared.lock();
        if state.lifecycle != Lifecycle::Active {
            return Err(RpcError::NotActive);
        }
        Ok(self.shared.stops.subscribe())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("ready", &self.is_ready())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let listener = {
            let mut state = self.shared.lock();
            state.pending.reject_all();
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(self.id);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, message: Message) -> Result<()> {
        let value = Envelope::new(self.id.clone(), message).to_value()?;
        self.transport.post(value).await
    }

    async fn wait_ready(&self, stops: &mut watch::Receiver<u64>) -> Result<()> {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            biased;
            _ = stops.changed() => Err(RpcError::Stopped),
            result = ready.wait_for(|ready| *ready) => {
                result.map(|_| ()).map_err(|_| RpcError::Stopped)
            }
        }
    }

    fn mark_ready(&self) {
        if !self.ready.send_replace(true) {
            info!("RPC channel {} ready", self.id);
        }
    }

    fn is_active(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Active
    }

    async fn listen(self: Arc<Self>, mut subscription: Subscription) {
        while let Some(value) = subscription.recv().await {
            let Some(routed) = Envelope::route(value, &self.id) else {
                continue;
            };
            // The listener may still be draining its queue after `stop`.
            if !self.is_active() {
                debug!("RPC channel {} not active, dropping message", self.id);
                continue;
            }
            match routed {
                Routed::Message(message) => self.on_message(message).await,
                Routed::InvalidCall { id, reason } => {
                    let outcome = Outcome::Exception {
                        exception: HandlerError::new(format!("Invalid call: {reason}"))
                            .into_exception(),
                    };
                    self.send_return(id, outcome).await;
                }
            }
        }
        debug!("RPC channel {} transport closed", self.id);
    }

    async fn on_message(self: &Arc<Self>, message: Message) {
        debug!("RPC channel {} received {}", self.id, message.kind());
        match message {
            Message::Syn => {
                if let Err(e) = self.send(Message::Ack).await {
                    warn!("RPC channel {} failed to send ack: {}", self.id, e);
                }
                self.mark_ready();
            }
            Message::Ack => self.mark_ready(),
            Message::Call { id, handler, args } => {
                let shared = Arc::clone(self);
                tokio::spawn(async move { shared.serve_call(id, handler, args).await });
            }
            Message::Return { id, outcome } => {
                let resolved = self.lock().pending.complete(id, outcome.into_result());
                if !resolved {
                    warn!(
                        "RPC channel {} ignoring return for unknown call id {}",
                        self.id, id
                    );
                }
            }
        }
    }

    async fn serve_call(&self, id: u64, handler: String, args: Vec<Value>) {
        let handlers = Arc::clone(&self.lock().handlers);

        let outcome = match handlers.invoke(&handler, args).await {
            Ok(result) => Outcome::Result { result },
            Err(e) => {
                debug!(
                    "RPC channel {} handler {} (id {}) failed: {}",
                    self.id, handler, id, e
                );
                Outcome::Exception {
                    exception: e.into_exception(),
                }
            }
        };

        self.send_return(id, outcome).await;
    }

    async fn send_return(&self, id: u64, outcome: Outcome) {
        if let Err(e) = self.send(Message::Return { id, outcome }).await {
            warn!(
                "RPC channel {} failed to send return for call {}: {}",
                self.id, id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, StreamTransport, Transport};
    use serde_json::json;
    use std::time::Duration;

    fn double() -> Handlers {
        Handlers::new().register("double", |args: Vec<Value>| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, HandlerError>(json!(n * 2))
        })
    }

    fn pair() -> (Channel, Channel) {
        let (t1, t2) = MemoryTransport::pair();
        (
            Channel::new(Arc::new(t1), "cell"),
            Channel::new(Arc::new(t2), "cell"),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_contract_violations() {
        let (a, _b) = pair();

        assert_eq!(a.state(), Lifecycle::Inactive);
        assert!(matches!(a.stop(), Err(RpcError::NotActive)));
        assert!(matches!(
            a.call("double", vec![json!(1)]).await,
            Err(RpcError::NotActive)
        ));

        a.start(Handlers::new()).await.unwrap();
        assert_eq!(a.state(), Lifecycle::Active);
        assert!(matches!(
            a.start(Handlers::new()).await,
            Err(RpcError::AlreadyActive)
        ));

        a.stop().unwrap();
        assert_eq!(a.state(), Lifecycle::Stopped);
        assert!(matches!(a.stop(), Err(RpcError::NotActive)));
    }

    #[tokio::test]
    async fn test_double_scenario() {
        let (a, b) = pair();

        a.start(Handlers::new()).await.unwrap();
        b.start(double()).await.unwrap();

        let result = a.call("double", vec![json!(21)]).await.unwrap();
        assert_eq!(result, json!(42));
        assert!(a.is_ready());
        assert!(b.is_ready());
        assert_eq!(a.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_typed() {
        let (a, b) = pair();
        a.start(Handlers::new()).await.unwrap();
        b.start(double()).await.unwrap();

        let doubled: i64 = a.call_typed("double", (5,)).await.unwrap();
        assert_eq!(doubled, 10);
    }

    #[tokio::test]
    async fn test_both_sides_serve() {
        let (a, b) = pair();
        a.start(double()).await.unwrap();
        b.start(double()).await.unwrap();

        assert_eq!(a.call("double", vec![json!(1)]).await.unwrap(), json!(2));
        assert_eq!(b.call("double", vec![json!(2)]).await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_failed_syn_rolls_back_start() {
        let (left, right) = tokio::io::duplex(64);
        drop(right);
        let channel = Channel::new(Arc::new(StreamTransport::new(left)), "cell");

        assert!(channel.start(double()).await.is_err());
        assert_eq!(channel.state(), Lifecycle::Inactive);
        assert!(channel.shared.lock().listener.is_none());
        assert!(matches!(channel.stop(), Err(RpcError::NotActive)));

        // Retrying reports the transport failure again.
        let retry = channel.start(double()).await;
        assert!(retry.is_err());
        assert!(!matches!(retry, Err(RpcError::AlreadyActive)));
        assert_eq!(channel.state(), Lifecycle::Inactive);
    }

    #[tokio::test]
    async fn test_listener_drops_queued_calls_after_stop() {
        let (t1, t2) = MemoryTransport::pair();
        let mut inbox = t2.subscribe();
        let channel = Channel::new(Arc::new(t1), "cell");
        channel.start(double()).await.unwrap();
        channel.stop().unwrap();
        while inbox.try_recv().is_some() {}

        // Stands in for a listener that has not reached its abort point yet.
        let subscription = channel.shared.transport.subscribe();
        t2.post(json!({"rpcChannelId": "cell", "type": "call", "id": 0, "handler": "double", "args": [1]}))
            .await
            .unwrap();
        let listener = tokio::spawn(Shared::listen(Arc::clone(&channel.shared), subscription));
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.abort();

        assert!(inbox.try_recv().is_none());
    }
}
