use thiserror::Error;

use crate::models::node::NodePubKey;

/// Errors surfaced to callers of the pool's public operations.
///
/// Each variant carries a stable identifier, returned by [`PoolError::code`],
/// which is what the RPC surface and logs key on. The rendered message is
/// free to change; the identifier is not.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("attempted connection to self")]
    AttemptedConnectionToSelf,

    #[error("pool is closed")]
    PoolClosed,

    #[error("cannot connect to tor address {0} while tor is disabled")]
    NodeTorAddress(String),

    #[error("node {0} is banned")]
    NodeIsBanned(NodePubKey),

    #[error("node {0} is already connected")]
    NodeAlreadyConnected(NodePubKey),

    #[error("node {0} is already banned")]
    NodeAlreadyBanned(NodePubKey),

    #[error("node {0} is not banned")]
    NodeNotBanned(NodePubKey),

    #[error("a connection attempt to node {0} is already in progress")]
    AlreadyConnecting(NodePubKey),

    #[error("not connected")]
    NotConnected,

    #[error("node {0} is unknown")]
    NodeNotFound(String),

    #[error("malformed version {0}")]
    MalformedVersion(String),

    #[error("version {0} is incompatible, minimum compatible version is {1}")]
    IncompatibleVersion(String, String),

    #[error("connection retries exceeded the maximum allowed period")]
    ConnectionRetriesMaxPeriodExceeded,

    #[error("peer failed to authenticate its claimed identity")]
    InvalidAuth,

    #[error("wire protocol error: {0}")]
    WireProtocol(#[from] crate::framer::FramerError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Stable identifier for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::AttemptedConnectionToSelf => "ATTEMPTED_CONNECTION_TO_SELF",
            PoolError::PoolClosed => "POOL_CLOSED",
            PoolError::NodeTorAddress(_) => "NODE_TOR_ADDRESS",
            PoolError::NodeIsBanned(_) => "NODE_IS_BANNED",
            PoolError::NodeAlreadyConnected(_) => "NODE_ALREADY_CONNECTED",
            PoolError::NodeAlreadyBanned(_) => "NODE_ALREADY_BANNED",
            PoolError::NodeNotBanned(_) => "NODE_NOT_BANNED",
            PoolError::AlreadyConnecting(_) => "ALREADY_CONNECTING",
            PoolError::NotConnected => "NOT_CONNECTED",
            PoolError::NodeNotFound(_) => "NODE_NOT_FOUND",
            PoolError::MalformedVersion(_) => "MALFORMED_VERSION",
            PoolError::IncompatibleVersion(_, _) => "INCOMPATIBLE_VERSION",
            PoolError::ConnectionRetriesMaxPeriodExceeded => {
                "CONNECTION_RETRIES_MAX_PERIOD_EXCEEDED"
            }
            PoolError::InvalidAuth => "INVALID_AUTH",
            PoolError::WireProtocol(_) => "WIRE_PROTOCOL_ERR",
            PoolError::Io(_) => "IO_ERR",
        }
    }
}
