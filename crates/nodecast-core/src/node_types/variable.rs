//! `variable`: plain value holders.
//!
//! Config: `{"channels": {"<name>": <initial value>, ...}}`. Channels only
//! change when a client sends to them. Migrating rebuilds the node with the
//! current values.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{NodeError, Result};
use crate::ids::NodeId;
use crate::node::Node;
use crate::node_type::{Migration, NodeBehavior, NodeFactory, NodeParts};

const TYPE_NAME: &str = "variable";

/// Behavior of a `variable` node. Has no background work.
#[derive(Debug, Default)]
pub struct VariableNode;

#[async_trait]
impl NodeBehavior for VariableNode {
    async fn migrate(&self, node: &Node) -> Result<Migration> {
        let parts = node
            .snapshot()
            .into_iter()
            .fold(NodeParts::new(Arc::new(Self)), |parts, (name, data)| {
                parts.with_channel(name, data)
            });
        Ok(Migration::Replace(parts))
    }
}

/// Factory for [`VariableNode`].
#[derive(Debug, Default)]
pub struct VariableFactory;

impl NodeFactory for VariableFactory {
    fn type_name(&self) -> &str {
        TYPE_NAME
    }

    fn create(&self, _id: &NodeId, config: &Value) -> Result<NodeParts> {
        let channels = match config {
            Value::Null => None,
            Value::Object(obj) => match obj.get("channels") {
                None | Some(Value::Null) => None,
                Some(Value::Object(channels)) => Some(channels),
                Some(_) => return Err(invalid("'channels' must be an object")),
            },
            _ => return Err(invalid("config must be an object")),
        };

        Ok(channels.into_iter().flatten().fold(
            NodeParts::new(Arc::new(VariableNode)),
            |parts, (name, data)| parts.with_channel(name.clone(), data.clone()),
        ))
    }
}

fn invalid(message: &str) -> NodeError {
    NodeError::InvalidConfig {
        node_type: TYPE_NAME.into(),
        message: message.into(),
    }
}
