//! `NodeManager`: authoritative registry of live nodes.
//!
//! Two indexes are kept in step: node id → node, and channel id → channel.
//! Both are only mutated while the node map's write lock is held, so a node
//! and its channels appear and disappear together. Lock order is always node
//! map first, channel index second. No lock is held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::channel_registry::ChannelRegistry;
use crate::errors::{NodeError, Result};
use crate::ids::{ChannelId, NodeId};
use crate::node::{Node, NodeSpec, validate_identifier};
use crate::node_type::{Migration, NodeTypeRegistry};

/// Clears a node's migration flag when dropped.
struct MigrationGuard<'a>(&'a Node);

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.0.end_migration();
    }
}

/// Owns every live node and the channel index derived from them.
#[derive(Debug)]
pub struct NodeManager {
    types: NodeTypeRegistry,
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    channels: ChannelRegistry,
}

impl NodeManager {
    /// Create an empty manager that can build nodes of the given types.
    pub fn new(types: NodeTypeRegistry) -> Self {
        Self {
            types,
            nodes: RwLock::new(HashMap::new()),
            channels: ChannelRegistry::new(),
        }
    }

    /// Registered node type names.
    pub fn node_types(&self) -> Vec<String> {
        self.types.type_names()
    }

    /// Create, register, and start a node.
    ///
    /// The node is addressable before its start hook runs. If the hook fails
    /// the node is unregistered and torn down again.
    pub async fn create_node(&self, spec: NodeSpec) -> Result<Arc<Node>> {
        let factory = self.types.get(&spec.node_type)?;
        let id = match spec.id {
            Some(id) => {
                validate_identifier(id.as_str())?;
                id
            }
            None => NodeId::generate(),
        };
        if self.nodes.read().contains_key(&id) {
            return Err(NodeError::NodeAlreadyExists(id));
        }

        let parts = factory.create(&id, &spec.config)?;
        let node = Arc::new(Node::assemble(
            id.clone(),
            spec.node_type,
            spec.config,
            parts,
        )?);

        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&id) {
                return Err(NodeError::NodeAlreadyExists(id));
            }
            let _ = nodes.insert(id.clone(), Arc::clone(&node));
            self.channels.register(&node);
        }

        if let Err(e) = node.behavior().start(&node).await {
            self.detach(&node);
            let _ = node.teardown();
            warn!(node_id = %id, error = %e, "node start failed");
            return Err(NodeError::StartFailed {
                node_id: id,
                message: e.to_string(),
            });
        }

        info!(
            node_id = %id,
            node_type = node.node_type(),
            channels = node.list_channel().len(),
            "node created"
        );
        Ok(node)
    }

    /// Unregister and tear down a node. Its channel ids become stale and all
    /// of its subscribers are dropped.
    pub fn remove_node(&self, id: &NodeId) -> Result<Arc<Node>> {
        let node = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .remove(id)
                .ok_or_else(|| NodeError::NodeNotFound(id.clone()))?;
            self.channels.unregister(&node);
            node
        };
        let cleared = node.teardown();
        info!(node_id = %id, subscriptions_cleared = cleared, "node removed");
        Ok(node)
    }

    /// Run the node type's migration hook and apply its outcome.
    ///
    /// Returns `true` if the node was replaced. A replacement keeps the node
    /// id; subscribers of channels whose name survives are moved over, the
    /// rest are dropped with the old node. The swap is atomic with respect to
    /// lookups. Any error leaves the current node untouched.
    ///
    /// The old node stays writable while the hook and the replacement's start
    /// run. A channel written in that window hands its latest value to its
    /// successor at the swap, so no committed write is lost.
    pub async fn migrate_node(&self, id: &NodeId) -> Result<bool> {
        let node = self.node(id)?;
        if !node.begin_migration() {
            return Err(NodeError::MigrationInProgress(id.clone()));
        }
        let _guard = MigrationGuard(&node);
        let seen: HashMap<String, u64> = node
            .channels()
            .map(|ch| (ch.name().to_owned(), ch.version()))
            .collect();

        let parts = match node.behavior().migrate(&node).await? {
            Migration::Stay => {
                debug!(node_id = %id, "migration kept node in place");
                return Ok(false);
            }
            Migration::Replace(parts) => parts,
        };

        let replacement = Arc::new(Node::assemble(
            id.clone(),
            node.node_type(),
            node.config().clone(),
            parts,
        )?);
        if let Err(e) = replacement.behavior().start(&replacement).await {
            let _ = replacement.teardown();
            return Err(NodeError::MigrationFailed {
                node_id: id.clone(),
                message: e.to_string(),
            });
        }

        let moved = {
            let mut nodes = self.nodes.write();
            let current = nodes.get(id).is_some_and(|n| Arc::ptr_eq(n, &node));
            if current {
                let mut moved = 0;
                for ch in node.channels() {
                    if let Some(successor) = replacement.channel(ch.name()) {
                        let seen_version = seen.get(ch.name()).copied().unwrap_or_default();
                        moved += ch.hand_over_to(successor, seen_version);
                    }
                }
                self.channels.replace(&node, &replacement);
                let _ = nodes.insert(id.clone(), Arc::clone(&replacement));
                Some(moved)
            } else {
                None
            }
        };

        let Some(moved) = moved else {
            // Removed while the hook was running.
            let _ = replacement.teardown();
            return Err(NodeError::NodeNotFound(id.clone()));
        };

        let dropped = node.teardown();
        info!(
            node_id = %id,
            subscribers_moved = moved,
            subscribers_dropped = dropped,
            "node replaced by migration"
        );
        Ok(true)
    }

    /// Look up a node.
    pub fn node(&self, id: &NodeId) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NodeError::NodeNotFound(id.clone()))
    }

    /// Ids of all live nodes, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Resolve a channel id to its live channel.
    pub fn channel(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        self.channels.get(id)
    }

    /// Resolve `(node id, channel name)` to a live channel.
    pub fn channel_by_name(&self, node_id: &NodeId, name: &str) -> Result<Arc<Channel>> {
        let node = self.node(node_id)?;
        node.channel(name)
            .cloned()
            .ok_or_else(|| NodeError::ChannelNotFound(ChannelId::scoped(node_id, name)))
    }

    /// Tear down every node.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Node>> = {
            let mut nodes = self.nodes.write();
            let drained: Vec<Arc<Node>> = nodes.drain().map(|(_, n)| n).collect();
            for node in &drained {
                self.channels.unregister(node);
            }
            drained
        };
        for node in &drained {
            let _ = node.teardown();
        }
        info!(nodes = drained.len(), "node manager shut down");
    }

    /// Remove `node` from both indexes if it is still the registered instance.
    fn detach(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.write();
        if nodes.get(node.id()).is_some_and(|n| Arc::ptr_eq(n, node)) {
            let _ = nodes.remove(node.id());
            self.channels.unregister(node);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingSubscriber;
    use crate::ids::SubscriberId;
    use crate::node_type::{NodeBehavior, NodeFactory, NodeParts};
    use crate::node_types::builtin_registry;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    fn variable(id: Option<&str>, channels: Value) -> NodeSpec {
        NodeSpec {
            id: id.map(NodeId::new),
            node_type: "variable".into(),
            config: json!({ "channels": channels }),
        }
    }

    fn manager() -> NodeManager {
        NodeManager::new(builtin_registry())
    }

    struct FailingStart;

    #[async_trait]
    impl NodeBehavior for FailingStart {
        async fn start(&self, _node: &Node) -> Result<()> {
            Err(NodeError::InvalidConfig {
                node_type: "broken".into(),
                message: "boom".into(),
            })
        }
    }

    struct BrokenFactory;

    impl NodeFactory for BrokenFactory {
        fn type_name(&self) -> &str {
            "broken"
        }

        fn create(&self, _id: &NodeId, _config: &Value) -> Result<NodeParts> {
            Ok(NodeParts::new(Arc::new(FailingStart)).with_channel("out", Value::Null))
        }
    }

    /// Migration hook that parks until released.
    struct SlowMigrate(Arc<Notify>);

    #[async_trait]
    impl NodeBehavior for SlowMigrate {
        async fn migrate(&self, _node: &Node) -> Result<Migration> {
            self.0.notified().await;
            Ok(Migration::Stay)
        }
    }

    struct SlowFactory(Arc<Notify>);

    impl NodeFactory for SlowFactory {
        fn type_name(&self) -> &str {
            "slow"
        }

        fn create(&self, _id: &NodeId, _config: &Value) -> Result<NodeParts> {
            Ok(NodeParts::new(Arc::new(SlowMigrate(Arc::clone(&self.0)))))
        }
    }

    #[tokio::test]
    async fn create_registers_node_and_channels() {
        let mgr = manager();
        let node = mgr
            .create_node(variable(Some("n1"), json!({"temp": 20})))
            .await
            .unwrap();
        assert_eq!(node.id().as_str(), "n1");
        assert_eq!(mgr.node_ids(), vec![NodeId::new("n1")]);
        let ch = mgr.channel(&ChannelId::new("n1/temp")).unwrap();
        assert_eq!(ch.data(), json!(20));
        let by_name = mgr.channel_by_name(&NodeId::new("n1"), "temp").unwrap();
        assert!(Arc::ptr_eq(&ch, &by_name));
    }

    #[tokio::test]
    async fn create_generates_id_when_absent() {
        let mgr = manager();
        let a = mgr.create_node(variable(None, json!({}))).await.unwrap();
        let b = mgr.create_node(variable(None, json!({}))).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(mgr.node_count(), 2);
    }

    #[tokio::test]
    async fn create_rejects_unknown_type_and_duplicates() {
        let mgr = manager();
        let err = mgr
            .create_node(NodeSpec {
                id: None,
                node_type: "nope".into(),
                config: Value::Null,
            })
            .await
            .unwrap_err();
        assert_matches!(err, NodeError::UnknownNodeType(_));

        let _ = mgr.create_node(variable(Some("n1"), json!({}))).await.unwrap();
        let err = mgr
            .create_node(variable(Some("n1"), json!({})))
            .await
            .unwrap_err();
        assert_matches!(err, NodeError::NodeAlreadyExists(_));
        assert_eq!(mgr.node_count(), 1);
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_registered() {
        let mut types = builtin_registry();
        types.register(BrokenFactory);
        let mgr = NodeManager::new(types);

        let err = mgr
            .create_node(NodeSpec {
                id: Some(NodeId::new("b1")),
                node_type: "broken".into(),
                config: Value::Null,
            })
            .await
            .unwrap_err();
        assert_matches!(err, NodeError::StartFailed { .. });
        assert_eq!(mgr.node_count(), 0);
        assert!(mgr.channel(&ChannelId::new("b1/out")).is_err());
    }

    #[tokio::test]
    async fn remove_makes_ids_stale_and_drops_subscribers() {
        let mgr = manager();
        let _ = mgr
            .create_node(variable(Some("n1"), json!({"temp": 1})))
            .await
            .unwrap();
        let ch = mgr.channel(&ChannelId::new("n1/temp")).unwrap();
        let _ = ch.watch(RecordingSubscriber::new(1), None);

        let removed = mgr.remove_node(&NodeId::new("n1")).unwrap();
        assert!(removed.is_stopped());
        assert_eq!(ch.subscriber_count(), 0);
        assert_matches!(mgr.node(&NodeId::new("n1")), Err(NodeError::NodeNotFound(_)));
        assert_matches!(
            mgr.channel(&ChannelId::new("n1/temp")),
            Err(NodeError::ChannelNotFound(_))
        );
        assert_matches!(
            mgr.remove_node(&NodeId::new("n1")),
            Err(NodeError::NodeNotFound(_))
        );
    }

    #[tokio::test]
    async fn migrate_replaces_and_hands_over_subscribers() {
        let mgr = manager();
        let original = mgr
            .create_node(variable(Some("n1"), json!({"temp": 1})))
            .await
            .unwrap();
        let sub = RecordingSubscriber::new(5);
        let ch = mgr.channel(&ChannelId::new("n1/temp")).unwrap();
        let _ = ch.watch(sub.clone(), Some(3));
        let _ = ch.set(json!(2), None);

        assert!(mgr.migrate_node(&NodeId::new("n1")).await.unwrap());

        let current = mgr.node(&NodeId::new("n1")).unwrap();
        assert!(!Arc::ptr_eq(&original, &current));
        assert!(original.is_stopped());

        let successor = mgr.channel(&ChannelId::new("n1/temp")).unwrap();
        assert_eq!(successor.data(), json!(2));
        assert_eq!(successor.subscriber_ids(), vec![SubscriberId(5)]);

        let _ = successor.set(json!(3), None);
        let last = sub.received.lock().last().cloned().unwrap();
        assert_eq!(last.1, json!(3));
        assert_eq!(last.2, Some(3));
    }

    #[tokio::test]
    async fn migrate_unknown_node_fails() {
        let mgr = manager();
        assert_matches!(
            mgr.migrate_node(&NodeId::new("ghost")).await,
            Err(NodeError::NodeNotFound(_))
        );
    }

    #[tokio::test]
    async fn concurrent_migrate_is_rejected() {
        let release = Arc::new(Notify::new());
        let mut types = NodeTypeRegistry::new();
        types.register(SlowFactory(Arc::clone(&release)));
        let mgr = Arc::new(NodeManager::new(types));
        let _ = mgr
            .create_node(NodeSpec {
                id: Some(NodeId::new("s1")),
                node_type: "slow".into(),
                config: Value::Null,
            })
            .await
            .unwrap();

        let first = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.migrate_node(&NodeId::new("s1")).await })
        };
        // Let the first migration reach its hook.
        while mgr.node(&NodeId::new("s1")).unwrap().begin_migration() {
            mgr.node(&NodeId::new("s1")).unwrap().end_migration();
            tokio::task::yield_now().await;
        }

        assert_matches!(
            mgr.migrate_node(&NodeId::new("s1")).await,
            Err(NodeError::MigrationInProgress(_))
        );

        release.notify_one();
        assert!(!first.await.unwrap().unwrap());
        assert!(mgr.node(&NodeId::new("s1")).unwrap().begin_migration());
    }

    /// Replacement whose start parks until released, so writes can land on
    /// the old node mid-migration.
    struct ParkedStart(Arc<Notify>, Arc<Notify>);

    #[async_trait]
    impl NodeBehavior for ParkedStart {
        async fn start(&self, _node: &Node) -> Result<()> {
            self.0.notify_one();
            self.1.notified().await;
            Ok(())
        }
    }

    struct Reloading {
        parked: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl NodeBehavior for Reloading {
        async fn migrate(&self, _node: &Node) -> Result<Migration> {
            let next = ParkedStart(Arc::clone(&self.parked), Arc::clone(&self.release));
            Ok(Migration::Replace(
                NodeParts::new(Arc::new(next)).with_channel("v", json!("migrated")),
            ))
        }
    }

    struct ReloadingFactory {
        parked: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl NodeFactory for ReloadingFactory {
        fn type_name(&self) -> &str {
            "reloading"
        }

        fn create(&self, _id: &NodeId, _config: &Value) -> Result<NodeParts> {
            let behavior = Reloading {
                parked: Arc::clone(&self.parked),
                release: Arc::clone(&self.release),
            };
            Ok(NodeParts::new(Arc::new(behavior)).with_channel("v", json!(0)))
        }
    }

    #[tokio::test]
    async fn write_during_migration_survives_the_swap() {
        let parked = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut types = NodeTypeRegistry::new();
        types.register(ReloadingFactory {
            parked: Arc::clone(&parked),
            release: Arc::clone(&release),
        });
        let mgr = Arc::new(NodeManager::new(types));
        let _ = mgr
            .create_node(NodeSpec::new("reloading", Value::Null).with_id("r1"))
            .await
            .unwrap();
        let ch = mgr.channel(&ChannelId::new("r1/v")).unwrap();
        let watcher = RecordingSubscriber::new(1);
        let _ = ch.watch(watcher.clone(), Some(2));

        let migration = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.migrate_node(&NodeId::new("r1")).await })
        };
        parked.notified().await;
        let _ = ch.set(json!("client-write"), None);
        release.notify_one();
        assert!(migration.await.unwrap().unwrap());

        assert_eq!(watcher.values(), vec![json!(0), json!("client-write")]);
        let live = mgr.channel(&ChannelId::new("r1/v")).unwrap();
        assert!(!Arc::ptr_eq(&ch, &live));
        assert_eq!(live.data(), json!("client-write"));
        assert_eq!(live.subscriber_ids(), vec![SubscriberId(1)]);

        // The stale handle keeps acting on the live channel.
        let _ = ch.set(json!("after"), None);
        assert_eq!(live.data(), json!("after"));
        assert_eq!(watcher.values().last(), Some(&json!("after")));
    }

    #[tokio::test]
    async fn unwritten_channels_take_the_replacement_value() {
        let parked = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut types = NodeTypeRegistry::new();
        types.register(ReloadingFactory {
            parked: Arc::clone(&parked),
            release: Arc::clone(&release),
        });
        let mgr = Arc::new(NodeManager::new(types));
        let _ = mgr
            .create_node(NodeSpec::new("reloading", Value::Null).with_id("r1"))
            .await
            .unwrap();

        let migration = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.migrate_node(&NodeId::new("r1")).await })
        };
        parked.notified().await;
        release.notify_one();
        assert!(migration.await.unwrap().unwrap());
        let live = mgr.channel(&ChannelId::new("r1/v")).unwrap();
        assert_eq!(live.data(), json!("migrated"));
    }

    #[tokio::test]
    async fn remove_detaches_every_subscriber() {
        let mgr = manager();
        let _ = mgr
            .create_node(variable(Some("n1"), json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        let first = RecordingSubscriber::new(1);
        let second = RecordingSubscriber::new(2);
        let _ = mgr.channel(&ChannelId::new("n1/a")).unwrap().watch(first.clone(), None);
        let _ = mgr.channel(&ChannelId::new("n1/b")).unwrap().watch(second.clone(), None);

        let _ = mgr.remove_node(&NodeId::new("n1")).unwrap();
        assert_eq!(first.detached.lock().as_slice(), &[ChannelId::new("n1/a")]);
        assert_eq!(second.detached.lock().as_slice(), &[ChannelId::new("n1/b")]);
    }

    struct Plain;

    #[async_trait]
    impl NodeBehavior for Plain {}

    struct PlainFactory;

    impl NodeFactory for PlainFactory {
        fn type_name(&self) -> &str {
            "plain"
        }

        fn create(&self, _id: &NodeId, _config: &Value) -> Result<NodeParts> {
            Ok(NodeParts::new(Arc::new(Plain)).with_channel("v", json!(1)))
        }
    }

    #[tokio::test]
    async fn unsupported_migration_leaves_node() {
        let mut types = NodeTypeRegistry::new();
        types.register(PlainFactory);
        let mgr = NodeManager::new(types);
        let node = mgr
            .create_node(NodeSpec {
                id: Some(NodeId::new("p1")),
                node_type: "plain".into(),
                config: Value::Null,
            })
            .await
            .unwrap();

        assert_matches!(
            mgr.migrate_node(&NodeId::new("p1")).await,
            Err(NodeError::MigrationUnsupported(t)) if t == "plain"
        );
        let current = mgr.node(&NodeId::new("p1")).unwrap();
        assert!(Arc::ptr_eq(&node, &current));
        assert!(!current.is_stopped());
        // The flag is released after a failed attempt.
        assert!(current.begin_migration());
    }

    #[tokio::test]
    async fn shutdown_tears_down_everything() {
        let mgr = manager();
        let a = mgr.create_node(variable(Some("a"), json!({"x": 1}))).await.unwrap();
        let _ = mgr.create_node(variable(Some("b"), json!({}))).await.unwrap();
        mgr.shutdown();
        assert_eq!(mgr.node_count(), 0);
        assert!(a.is_stopped());
        assert!(mgr.channel(&ChannelId::new("a/x")).is_err());
    }
}
