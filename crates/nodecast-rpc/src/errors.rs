//! RPC error codes and error type.

use nodecast_core::NodeError;

use crate::types::ErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// `nodeCreate` named a type with no registered factory.
pub const UNKNOWN_NODE_TYPE: &str = "UNKNOWN_NODE_TYPE";
/// Node id is stale or never existed.
pub const NODE_NOT_FOUND: &str = "NODE_NOT_FOUND";
/// Channel id is stale or never existed.
pub const CHANNEL_NOT_FOUND: &str = "CHANNEL_NOT_FOUND";
/// A node with the requested id is already registered.
pub const NODE_ALREADY_EXISTS: &str = "NODE_ALREADY_EXISTS";
/// The node type rejected the supplied config.
pub const INVALID_NODE_CONFIG: &str = "INVALID_NODE_CONFIG";
/// The node's start hook failed.
pub const NODE_START_FAILED: &str = "NODE_START_FAILED";
/// The node's type cannot be migrated.
pub const MIGRATION_UNSUPPORTED: &str = "MIGRATION_UNSUPPORTED";
/// Another migration of the node is still running.
pub const MIGRATION_IN_PROGRESS: &str = "MIGRATION_IN_PROGRESS";
/// The migration hook or the replacement's start failed.
pub const MIGRATION_FAILED: &str = "MIGRATION_FAILED";
/// No handler for the requested method.
pub const UNSUPPORTED_METHOD: &str = "UNSUPPORTED_METHOD";
/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Method is recognized but has no implementation.
pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// RPC error type returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// The method name has no handler.
    #[error("unsupported method: {method}")]
    UnsupportedMethod {
        /// Method as sent by the client.
        method: String,
    },

    /// The method is reserved but does nothing yet.
    #[error("method '{method}' is not implemented")]
    NotImplemented {
        /// Method name.
        method: String,
    },

    /// Node or channel operation failed.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Internal server error.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl RpcError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::UnsupportedMethod { .. } => UNSUPPORTED_METHOD,
            Self::NotImplemented { .. } => NOT_IMPLEMENTED,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Node(err) => match err {
                NodeError::UnknownNodeType(_) => UNKNOWN_NODE_TYPE,
                NodeError::NodeNotFound(_) => NODE_NOT_FOUND,
                NodeError::ChannelNotFound(_) => CHANNEL_NOT_FOUND,
                NodeError::InvalidIdentifier(_) => INVALID_PARAMS,
                NodeError::NodeAlreadyExists(_) => NODE_ALREADY_EXISTS,
                NodeError::InvalidConfig { .. } => INVALID_NODE_CONFIG,
                NodeError::StartFailed { .. } => NODE_START_FAILED,
                NodeError::MigrationUnsupported(_) => MIGRATION_UNSUPPORTED,
                NodeError::MigrationInProgress(_) => MIGRATION_IN_PROGRESS,
                NodeError::MigrationFailed { .. } => MIGRATION_FAILED,
            },
        }
    }

    /// Convert to the params of an `error` envelope answering `method`.
    pub fn to_error_body(&self, method: &str) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            method: method.to_owned(),
        }
    }
}
