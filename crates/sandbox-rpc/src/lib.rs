//! Sandbox RPC - bidirectional calls between a host and a sandboxed peer.
//!
//! Two isolated execution contexts share nothing but a fire-and-forget
//! message transport. This crate layers a symmetric RPC protocol on top of
//! it: a syn/ack handshake, id-correlated `call`/`return` messages, and error
//! payloads that survive the trip across the isolation boundary.
//!
//! # Example
//!
//! ```rust,no_run
//! use sandbox_rpc::{Channel, HandlerError, Handlers, MemoryTransport};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sandbox_rpc::Result<()> {
//!     let (host_side, sandbox_side) = MemoryTransport::pair();
//!     let host = Channel::new(Arc::new(host_side), "cell");
//!     let sandbox = Channel::new(Arc::new(sandbox_side), "cell");
//!
//!     host.start(Handlers::new()).await?;
//!     sandbox
//!         .start(Handlers::new().register("double", |args: Vec<Value>| async move {
//!             let n = args.first().and_then(Value::as_i64).unwrap_or(0);
//!             Ok::<_, HandlerError>(json!(n * 2))
//!         }))
//!         .await?;
//!
//!     let result = host.call("double", vec![json!(21)]).await?;
//!     assert_eq!(result, json!(42));
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod pending;

pub use channel::{Channel, Lifecycle};
pub use config::{PeerConfig, RpcConfig};
pub use error::{ErrorPayload, HandlerError, RemoteError, Result, RpcError};
pub use handler::{Handler, Handlers};
pub use protocol::{ChannelId, Envelope, Message, Outcome, Routed};
pub use transport::{Mailbox, MemoryTransport, StreamTransport, Subscription, Transport};
