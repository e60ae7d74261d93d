//! Wire messages and stream framing.
//!
//! Every message is a JSON object carrying the channel identifier plus a
//! `type` discriminator:
//!
//! ```text
//! {"rpcChannelId": "cell", "type": "syn"}
//! {"rpcChannelId": "cell", "type": "ack"}
//! {"rpcChannelId": "cell", "type": "call", "id": 0, "handler": "double", "args": [21]}
//! {"rpcChannelId": "cell", "type": "return", "id": 0, "result": 42}
//! {"rpcChannelId": "cell", "type": "return", "id": 1, "exception": {"message": "boom", "stack": "...", "__error__": true}}
//! ```
//!
//! Stream transports frame each message as a 4-byte big-endian length prefix
//! followed by the UTF-8 JSON bytes:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::RpcConfig;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

/// Identifier used to route messages to one channel on a shared transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message tagged with the channel it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "rpcChannelId")]
    pub channel: ChannelId,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(channel: ChannelId, message: Message) -> Self {
        Self { channel, message }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode an envelope addressed to `channel`.
    ///
    /// Returns `None` for values that are not objects, carry another channel
    /// identifier, or do not parse as a known message. A `call` that carries a
    /// usable `id` but is otherwise malformed comes back as
    /// [`Routed::InvalidCall`] so the caller still gets a `return`.
    pub fn route(value: Value, channel: &ChannelId) -> Option<Routed> {
        let addressed = value
            .get(RpcConfig::CHANNEL_ID_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|id| id == channel.as_str());
        if !addressed {
            return None;
        }

        let call_id = match value.get("type").and_then(Value::as_str) {
            Some("call") => value.get("id").and_then(Value::as_u64),
            _ => None,
        };

        match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => Some(Routed::Message(envelope.message)),
            Err(e) => match call_id {
                Some(id) => {
                    warn!("Rejecting malformed call {} on channel {}: {}", id, channel, e);
                    Some(Routed::InvalidCall {
                        id,
                        reason: e.to_string(),
                    })
                }
                None => {
                    warn!("Ignoring malformed message on channel {}: {}", channel, e);
                    None
                }
            },
        }
    }
}

/// An inbound value addressed to a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Message(Message),
    /// A `call` whose `id` parsed but whose handler or arguments did not.
    InvalidCall { id: u64, reason: String },
}

/// The protocol messages, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Syn,
    Ack,
    Call {
        id: u64,
        handler: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Return {
        id: u64,
        #[serde(flatten)]
        outcome: Outcome,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Syn => "syn",
            Message::Ack => "ack",
            Message::Call { .. } => "call",
            Message::Return { .. } => "return",
        }
    }
}

/// Payload of a `return` message: exactly one of `result` or `exception`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    // Tried first so a message carrying `exception` is never read as a result.
    Exception { exception: Value },
    Result {
        #[serde(default)]
        result: Value,
    },
}

impl Outcome {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Result { result } => Ok(result),
            Outcome::Exception { exception } => Err(RpcError::from_exception(exception)),
        }
    }
}

/// Read one frame written by [`write_frame`].
///
/// Returns `None` on clean EOF (peer closed the stream). The length prefix is
/// checked against [`RpcConfig::MAX_FRAME_SIZE`] before the payload buffer is
/// allocated, since the prefix comes straight off the socket.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > RpcConfig::MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: RpcConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write one JSON message as `[u32 BE len][bytes]`.
///
/// Oversized payloads are refused here so the peer's reader never sees a
/// frame it would reject.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > RpcConfig::MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: payload.len(),
            max: RpcConfig::MAX_FRAME_SIZE,
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
