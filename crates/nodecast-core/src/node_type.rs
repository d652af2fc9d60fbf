//! Node-type collaborators.
//!
//! What a node computes is decided by its type. A [`NodeFactory`] turns a
//! config blob into the node's initial channels plus a [`NodeBehavior`] that
//! owns the start, migrate, and stop hooks. Factories are registered once at
//! startup in a [`NodeTypeRegistry`] and looked up by type tag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{NodeError, Result};
use crate::ids::NodeId;
use crate::node::Node;

/// Initial shape of a node as produced by its factory.
pub struct NodeParts {
    /// Channels to create, as `(name, initial value)`.
    pub channels: Vec<(String, Value)>,
    /// Lifecycle hooks for the node.
    pub behavior: Arc<dyn NodeBehavior>,
}

impl NodeParts {
    /// Parts with no channels yet.
    pub fn new(behavior: Arc<dyn NodeBehavior>) -> Self {
        Self {
            channels: Vec::new(),
            behavior,
        }
    }

    /// Add a channel.
    #[must_use]
    pub fn with_channel(mut self, name: impl Into<String>, data: Value) -> Self {
        self.channels.push((name.into(), data));
        self
    }
}

/// Result of a node type's migration hook.
pub enum Migration {
    /// The node stays as it is.
    Stay,
    /// Replace the node with a fresh one built from these parts. The
    /// replacement keeps the node id; subscribers move to same-named channels.
    Replace(NodeParts),
}

/// Per-node lifecycle hooks.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    /// Called once after the node is registered. An error unregisters it.
    async fn start(&self, _node: &Node) -> Result<()> {
        Ok(())
    }

    /// Decide what migrating this node means. The node stays addressable
    /// while this runs; an error leaves it unchanged.
    async fn migrate(&self, node: &Node) -> Result<Migration> {
        Err(NodeError::MigrationUnsupported(node.node_type().to_owned()))
    }

    /// Called when the node is removed or replaced. Background work tied to
    /// the node's cancellation token is already cancelled at this point.
    fn stop(&self, _node: &Node) {}
}

/// Constructor for one node type.
pub trait NodeFactory: Send + Sync {
    /// Type tag clients pass to `nodeCreate`.
    fn type_name(&self) -> &str;

    /// Build the parts of node `id` from its config.
    fn create(&self, id: &NodeId, config: &Value) -> Result<NodeParts>;
}

/// Type tag → factory table.
#[derive(Default)]
pub struct NodeTypeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its type name, replacing any previous one.
    pub fn register(&mut self, factory: impl NodeFactory + 'static) {
        let _ = self
            .factories
            .insert(factory.type_name().to_owned(), Arc::new(factory));
    }

    /// Look up the factory for `node_type`.
    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeFactory>> {
        self.factories
            .get(node_type)
            .cloned()
            .ok_or_else(|| NodeError::UnknownNodeType(node_type.to_owned()))
    }

    /// Whether `node_type` is registered.
    pub fn has_type(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Registered type names (sorted).
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for NodeTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
