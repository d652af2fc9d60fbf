//! Error taxonomy for node and channel operations.

use thiserror::Error;

use crate::ids::{ChannelId, NodeId};

/// Errors raised by the node registry, node types, and channels.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Node creation named a type with no registered factory.
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// Lookup against a stale or nonexistent node id.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Lookup against a stale or nonexistent channel id.
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// A supplied node id or channel name is empty or contains the channel
    /// id separator.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A node with the supplied id is already registered.
    #[error("node already exists: {0}")]
    NodeAlreadyExists(NodeId),

    /// The node type rejected the supplied configuration.
    #[error("invalid config for node type '{node_type}': {message}")]
    InvalidConfig {
        /// Node type that rejected the config.
        node_type: String,
        /// What is wrong with it.
        message: String,
    },

    /// The node's start hook failed; the node was not registered.
    #[error("node {node_id} failed to start: {message}")]
    StartFailed {
        /// Node that failed.
        node_id: NodeId,
        /// Reason reported by the node type.
        message: String,
    },

    /// The node's type does not implement migration.
    #[error("node type '{0}' does not support migration")]
    MigrationUnsupported(String),

    /// Another migration of the same node has not finished yet.
    #[error("migration already in progress for node {0}")]
    MigrationInProgress(NodeId),

    /// The node type's migration hook failed; the node is unchanged.
    #[error("migration of node {node_id} failed: {message}")]
    MigrationFailed {
        /// Node that was being migrated.
        node_id: NodeId,
        /// Reason reported by the node type.
        message: String,
    },
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
