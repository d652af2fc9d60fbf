//! Global channel-id index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::Channel;
use crate::errors::{NodeError, Result};
use crate::ids::ChannelId;
use crate::node::Node;

/// Resolves a [`ChannelId`] to the live channel that owns it.
///
/// Kept in step with the node map by [`crate::NodeManager`]: a node's
/// channels are registered when it becomes addressable and unregistered
/// when it goes away.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every channel of `node`.
    pub fn register(&self, node: &Node) {
        let mut channels = self.channels.write();
        for ch in node.channels() {
            let _ = channels.insert(ch.id().clone(), Arc::clone(ch));
        }
    }

    /// Drop every channel of `node` from the index.
    pub fn unregister(&self, node: &Node) {
        let mut channels = self.channels.write();
        for ch in node.channels() {
            let _ = channels.remove(ch.id());
        }
    }

    /// Swap `old`'s channels for `new`'s in a single step.
    pub fn replace(&self, old: &Node, new: &Node) {
        let mut channels = self.channels.write();
        for ch in old.channels() {
            let _ = channels.remove(ch.id());
        }
        for ch in new.channels() {
            let _ = channels.insert(ch.id().clone(), Arc::clone(ch));
        }
    }

    /// Look up a channel.
    pub fn get(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NodeError::ChannelNotFound(id.clone()))
    }

    /// Number of indexed channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether no channel is indexed.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
