//! `timer`: a node that pushes a tick counter at a fixed interval.
//!
//! Config: `{"intervalMs": <u64 ≥ 10>, "channel": "<name>"}` (`channel`
//! defaults to `"tick"`). Each tick sets the channel to
//! `{"tick": n, "timestamp": "<rfc3339>"}` and is broadcast to every watcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::errors::{NodeError, Result};
use crate::ids::NodeId;
use crate::node::Node;
use crate::node_type::{Migration, NodeBehavior, NodeFactory, NodeParts};

const TYPE_NAME: &str = "timer";

/// Shortest accepted interval.
pub const MIN_INTERVAL_MS: u64 = 10;

fn default_channel() -> String {
    "tick".into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TimerConfig {
    interval_ms: u64,
    #[serde(default = "default_channel")]
    channel: String,
}

/// Behavior of a `timer` node.
#[derive(Debug)]
pub struct TimerNode {
    interval: Duration,
    channel: String,
    start_tick: u64,
}

impl TimerNode {
    fn parts(self, initial: Value) -> NodeParts {
        let channel = self.channel.clone();
        NodeParts::new(Arc::new(self)).with_channel(channel, initial)
    }
}

#[async_trait]
impl NodeBehavior for TimerNode {
    async fn start(&self, node: &Node) -> Result<()> {
        let channel = node
            .channel(&self.channel)
            .cloned()
            .ok_or_else(|| NodeError::StartFailed {
                node_id: node.id().clone(),
                message: format!("missing channel '{}'", self.channel),
            })?;
        let cancel = node.cancellation_token();
        let period = self.interval;
        let mut tick = self.start_tick;

        drop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tick += 1;
                        let _ = channel.set(
                            json!({ "tick": tick, "timestamp": Utc::now().to_rfc3339() }),
                            None,
                        );
                    }
                }
            }
            debug!(channel_id = %channel.id(), ticks = tick, "timer stopped");
        }));
        Ok(())
    }

    /// Rebuild with the same interval, continuing from the current count.
    async fn migrate(&self, node: &Node) -> Result<Migration> {
        let current = node
            .channel(&self.channel)
            .map(|c| c.data())
            .unwrap_or(Value::Null);
        let start_tick = current.get("tick").and_then(Value::as_u64).unwrap_or(0);
        let next = Self {
            interval: self.interval,
            channel: self.channel.clone(),
            start_tick,
        };
        Ok(Migration::Replace(next.parts(current)))
    }
}

/// Factory for [`TimerNode`].
#[derive(Debug, Default)]
pub struct TimerFactory;

impl NodeFactory for TimerFactory {
    fn type_name(&self) -> &str {
        TYPE_NAME
    }

    fn create(&self, _id: &NodeId, config: &Value) -> Result<NodeParts> {
        let config: TimerConfig =
            serde_json::from_value(config.clone()).map_err(|e| NodeError::InvalidConfig {
                node_type: TYPE_NAME.into(),
                message: e.to_string(),
            })?;
        if config.interval_ms < MIN_INTERVAL_MS {
            return Err(NodeError::InvalidConfig {
                node_type: TYPE_NAME.into(),
                message: format!("intervalMs must be at least {MIN_INTERVAL_MS}"),
            });
        }

        let node = TimerNode {
            interval: Duration::from_millis(config.interval_ms),
            channel: config.channel,
            start_tick: 0,
        };
        Ok(node.parts(json!({ "tick": 0, "timestamp": null })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn timer(config: Value) -> Node {
        let parts = TimerFactory.create(&NodeId::new("t"), &config).unwrap();
        Node::assemble(NodeId::new("t"), TYPE_NAME, config, parts).unwrap()
    }

    fn tick_of(node: &Node, channel: &str) -> u64 {
        node.channel(channel).unwrap().data()["tick"].as_u64().unwrap()
    }

    #[test]
    fn config_validation() {
        let err = TimerFactory
            .create(&NodeId::new("t"), &json!({"intervalMs": 5}))
            .err();
        assert_matches!(err, Some(NodeError::InvalidConfig { message, .. }) if message.contains("at least 10"));

        assert!(TimerFactory.create(&NodeId::new("t"), &json!({})).is_err());
        assert!(
            TimerFactory
                .create(&NodeId::new("t"), &json!({"intervalMs": 100, "bogus": 1}))
                .is_err()
        );

        let parts = TimerFactory
            .create(&NodeId::new("t"), &json!({"intervalMs": 100, "channel": "beat"}))
            .unwrap();
        assert_eq!(parts.channels[0].0, "beat");
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_torn_down() {
        let node = timer(json!({"intervalMs": 10}));
        node.behavior().start(&node).await.unwrap();
        assert_eq!(tick_of(&node, "tick"), 0);

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(tick_of(&node, "tick"), 3);
        assert!(node.channel("tick").unwrap().data()["timestamp"].is_string());

        let _ = node.teardown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tick_of(&node, "tick"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn migrate_continues_count() {
        let node = timer(json!({"intervalMs": 10, "channel": "beat"}));
        node.behavior().start(&node).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        let _ = node.teardown();

        let Migration::Replace(parts) = node.behavior().migrate(&node).await.unwrap() else {
            panic!("expected replacement");
        };
        let next = Node::assemble(NodeId::new("t"), TYPE_NAME, Value::Null, parts).unwrap();
        assert_eq!(tick_of(&next, "beat"), 2);

        next.behavior().start(&next).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(tick_of(&next, "beat"), 3);
        let _ = next.teardown();
    }
}
