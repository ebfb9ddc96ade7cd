use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome classification shared by every layer of the driver.
///
/// The retry loop in [`crate::cluster::Cluster`] decides retry-vs-escalate
/// from this code alone, without looking at payload types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// The operation completed
    Success,
    /// The requested item does not exist
    NotFound,
    /// The request was rejected before it reached a node
    InvalidRequest,
    /// A reply arrived but could not be decoded
    InvalidResponse,
    /// Every pooled connection to the node was busy
    NoConnections,
    /// The exchange with the node failed
    CommunicationError,
    /// No node is active
    ClusterOffline,
    /// Every attempt failed
    NoRetries,
    /// The cluster is being shut down
    ShuttingDown,
}

impl ResultCode {
    /// Codes the cluster retries against a (possibly different) node.
    pub fn is_retryable(self) -> bool {
        matches!(self, ResultCode::NoConnections | ResultCode::CommunicationError)
    }
}

/// Errors raised anywhere in the driver
#[derive(Error, Debug)]
pub enum DriverError {
    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected locally
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Reply payload could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Pool exhausted within the acquire timeout
    #[error("No connections available: {0}")]
    NoConnections(String),

    /// Socket failure or timeout
    #[error("Communication error: {message}")]
    Communication {
        message: String,
        node_offline: bool,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Error frame sent by the node
    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    /// Reply carried the wrong tag
    #[error("Unexpected message: expected tag {expected}, got {actual}")]
    UnexpectedMessage { expected: u8, actual: u8 },

    /// Frame over the size limit
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// No active nodes to select
    #[error("Cluster offline: no active nodes")]
    ClusterOffline,

    /// Retry budget used up; carries the last failure
    #[error("No retries left: {0}")]
    NoRetries(String),

    /// Shutdown in progress
    #[error("Cluster is shutting down")]
    ShuttingDown,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// A socket-level failure; the node is assumed unreachable.
    pub fn communication(message: impl Into<String>) -> Self {
        DriverError::Communication {
            message: message.into(),
            node_offline: true,
            source: None,
        }
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        DriverError::Communication {
            message: format!("{}: {}", context, err),
            node_offline: true,
            source: Some(err),
        }
    }

    pub fn timeout(context: &str) -> Self {
        DriverError::Communication {
            message: format!("{} timed out", context),
            node_offline: true,
            source: None,
        }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            DriverError::NotFound(_) => ResultCode::NotFound,
            DriverError::InvalidRequest(_) | DriverError::Config(_) => ResultCode::InvalidRequest,
            DriverError::InvalidResponse(_) => ResultCode::InvalidResponse,
            DriverError::NoConnections(_) => ResultCode::NoConnections,
            DriverError::Communication { .. }
            | DriverError::Server { .. }
            | DriverError::UnexpectedMessage { .. }
            | DriverError::MessageTooLarge(_) => ResultCode::CommunicationError,
            DriverError::ClusterOffline => ResultCode::ClusterOffline,
            DriverError::NoRetries(_) => ResultCode::NoRetries,
            DriverError::ShuttingDown => ResultCode::ShuttingDown,
        }
    }

    /// Whether the failure says the node itself is unusable.
    ///
    /// Error frames sent by the server are complete exchanges: the socket is
    /// still in sync, so they do not quarantine the node.
    pub fn node_offline(&self) -> bool {
        match self {
            DriverError::Communication { node_offline, .. } => *node_offline,
            DriverError::UnexpectedMessage { .. } | DriverError::MessageTooLarge(_) => true,
            _ => false,
        }
    }
}

/// `ResultCode` view over a whole `DriverResult`, `Success` included.
pub trait ResultCodeExt {
    fn result_code(&self) -> ResultCode;
}

impl<T> ResultCodeExt for DriverResult<T> {
    fn result_code(&self) -> ResultCode {
        match self {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}
