//! Centralized configuration for the sandbox RPC channel.
//!
//! Wire-level names and framing limits live here so both endpoints and the
//! peer binary agree on them.

/// Protocol and transport configuration.
pub struct RpcConfig;

impl RpcConfig {
    /// Envelope field carrying the channel identifier.
    pub const CHANNEL_ID_FIELD: &'static str = "rpcChannelId";
    /// Flag marking an `exception` payload as a flattened structured error.
    pub const ERROR_TAG_FIELD: &'static str = "__error__";
    /// Maximum accepted frame size on stream transports.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Defaults for the peer binary.
pub struct PeerConfig;

impl PeerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_CHANNEL: &'static str = "sandbox";
    /// Line printed on stdout so a parent process can discover the port.
    pub const PORT_LINE_PREFIX: &'static str = "RPC_PORT=";
}
