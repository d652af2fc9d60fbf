//! Node: a typed, identified collection of channels.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::errors::{NodeError, Result};
use crate::ids::{ChannelId, NodeId};
use crate::node_type::{NodeBehavior, NodeParts};

/// Request to create a node, as carried by `nodeCreate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Requested id; a fresh one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    /// Type tag selecting the node factory.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type-specific configuration.
    #[serde(default)]
    pub config: Value,
}

impl NodeSpec {
    /// Request for a node of `node_type` with a generated id.
    pub fn new(node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: None,
            node_type: node_type.into(),
            config,
        }
    }

    /// Request a specific id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Reject identifiers that would make channel ids ambiguous.
pub(crate) fn validate_identifier(value: &str) -> Result<()> {
    if value.is_empty() || value.contains(ChannelId::SEPARATOR) {
        return Err(NodeError::InvalidIdentifier(value.to_owned()));
    }
    Ok(())
}

/// A managed entity owning a set of named channels.
pub struct Node {
    id: NodeId,
    node_type: String,
    config: Value,
    channels: BTreeMap<String, Arc<Channel>>,
    behavior: Arc<dyn NodeBehavior>,
    cancel: CancellationToken,
    migrating: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Node {
    /// Build a node from the parts produced by its factory.
    pub fn assemble(
        id: NodeId,
        node_type: impl Into<String>,
        config: Value,
        parts: NodeParts,
    ) -> Result<Self> {
        validate_identifier(id.as_str())?;
        let node_type = node_type.into();

        let mut channels = BTreeMap::new();
        for (name, data) in parts.channels {
            validate_identifier(&name)?;
            let channel = Arc::new(Channel::new(&id, name.clone(), data));
            if channels.insert(name.clone(), channel).is_some() {
                return Err(NodeError::InvalidConfig {
                    node_type,
                    message: format!("duplicate channel name '{name}'"),
                });
            }
        }

        Ok(Self {
            id,
            node_type,
            config,
            channels,
            behavior: parts.behavior,
            cancel: CancellationToken::new(),
            migrating: AtomicBool::new(false),
            created_at: Utc::now(),
        })
    }

    /// Node id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Type tag.
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Config the node was created with.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// When this node instance was assembled.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Lifecycle hooks.
    pub fn behavior(&self) -> &Arc<dyn NodeBehavior> {
        &self.behavior
    }

    /// Channel by name.
    pub fn channel(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.get(name)
    }

    /// All channels, ordered by name.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    /// Ids of the channels this node owns.
    pub fn list_channel(&self) -> Vec<ChannelId> {
        self.channels.values().map(|c| c.id().clone()).collect()
    }

    /// Current value of every channel, as `(name, value)`.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.data()))
            .collect()
    }

    /// Token cancelled when the node is torn down. Background tasks started
    /// by the node's behavior should stop when it fires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Whether the node has been torn down.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark a migration as started. Returns `false` if one already is.
    pub(crate) fn begin_migration(&self) -> bool {
        !self.migrating.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_migration(&self) {
        self.migrating.store(false, Ordering::Release);
    }

    /// Stop background work, run the stop hook, and drop every subscriber.
    /// Returns the number of subscriptions cleared.
    pub(crate) fn teardown(&self) -> usize {
        self.cancel.cancel();
        self.behavior.stop(self);
        self.channels.values().map(|c| c.clear_subscribers()).sum()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingSubscriber;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;

    struct Inert;

    #[async_trait]
    impl NodeBehavior for Inert {}

    fn parts() -> NodeParts {
        NodeParts::new(Arc::new(Inert))
            .with_channel("temp", json!(20))
            .with_channel("humidity", json!(0.4))
    }

    #[test]
    fn assemble_creates_scoped_channels() {
        let node = Node::assemble(NodeId::new("n1"), "sensor", Value::Null, parts()).unwrap();
        assert_eq!(node.node_type(), "sensor");
        let ids: Vec<String> = node.list_channel().iter().map(|c| c.to_string()).collect();
        assert_eq!(ids, vec!["n1/humidity", "n1/temp"]);
        assert_eq!(node.channel("temp").unwrap().data(), json!(20));
        assert!(node.channel("missing").is_none());
    }

    #[test]
    fn duplicate_channel_names_rejected() {
        let parts = parts().with_channel("temp", json!(1));
        let err = Node::assemble(NodeId::new("n1"), "sensor", Value::Null, parts).unwrap_err();
        assert_matches!(err, NodeError::InvalidConfig { .. });
    }

    #[test]
    fn separator_in_identifiers_rejected() {
        let err = Node::assemble(NodeId::new("a/b"), "sensor", Value::Null, parts()).unwrap_err();
        assert_matches!(err, NodeError::InvalidIdentifier(_));

        let bad = NodeParts::new(Arc::new(Inert)).with_channel("x/y", Value::Null);
        let err = Node::assemble(NodeId::new("n1"), "sensor", Value::Null, bad).unwrap_err();
        assert_matches!(err, NodeError::InvalidIdentifier(_));

        let empty = NodeParts::new(Arc::new(Inert)).with_channel("", Value::Null);
        assert!(Node::assemble(NodeId::new("n1"), "sensor", Value::Null, empty).is_err());
    }

    #[test]
    fn snapshot_reflects_current_values() {
        let node = Node::assemble(NodeId::new("n1"), "sensor", Value::Null, parts()).unwrap();
        let _ = node.channel("temp").unwrap().set(json!(25), None);
        let snap = node.snapshot();
        assert!(snap.contains(&("temp".to_owned(), json!(25))));
        assert!(snap.contains(&("humidity".to_owned(), json!(0.4))));
    }

    #[test]
    fn teardown_cancels_and_clears_subscribers() {
        let node = Node::assemble(NodeId::new("n1"), "sensor", Value::Null, parts()).unwrap();
        let token = node.cancellation_token();
        let _ = node.channel("temp").unwrap().watch(RecordingSubscriber::new(1), None);
        let _ = node.channel("humidity").unwrap().watch(RecordingSubscriber::new(1), None);

        assert_eq!(node.teardown(), 2);
        assert!(token.is_cancelled());
        assert!(node.is_stopped());
        assert_eq!(node.channel("temp").unwrap().subscriber_count(), 0);
    }

    #[test]
    fn migration_flag_is_exclusive() {
        let node = Node::assemble(NodeId::new("n1"), "sensor", Value::Null, parts()).unwrap();
        assert!(node.begin_migration());
        assert!(!node.begin_migration());
        node.end_migration();
        assert!(node.begin_migration());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: NodeSpec = serde_json::from_value(json!({"type": "variable"})).unwrap();
        assert!(spec.id.is_none());
        assert_eq!(spec.node_type, "variable");
        assert!(spec.config.is_null());

        let spec: NodeSpec =
            serde_json::from_value(json!({"id": "n1", "type": "timer", "config": {"intervalMs": 50}}))
                .unwrap();
        assert_eq!(spec.id, Some(NodeId::new("n1")));
        assert_eq!(spec.config["intervalMs"], 50);
    }
}
