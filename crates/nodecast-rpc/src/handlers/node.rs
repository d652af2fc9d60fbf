//! Node handlers: list, create, update, remove, migrate, channel list.

use async_trait::async_trait;
use nodecast_core::{NodeId, NodeSpec};
use serde_json::{Value, json};
use tracing::instrument;

use crate::errors::RpcError;
use crate::handlers::{require_param, require_string_param};
use crate::registry::{Call, MethodHandler};
use crate::types::Reply;

/// Returns every live node id.
pub struct GetListHandler;

#[async_trait]
impl MethodHandler for GetListHandler {
    #[instrument(skip_all, fields(method = "nodeGetList"))]
    async fn handle(&self, _params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        Ok(Some(Reply::new(
            "nodeList",
            json!({ "nodeIds": call.ctx.nodes.node_ids() }),
        )))
    }
}

/// Creates and starts a node from `{node: {id?, type, config?}}`.
pub struct CreateHandler;

#[async_trait]
impl MethodHandler for CreateHandler {
    #[instrument(skip_all, fields(method = "nodeCreate"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let spec: NodeSpec = serde_json::from_value(require_param(&params, "node")?.clone())
            .map_err(|e| RpcError::InvalidParams {
                message: format!("Invalid node spec: {e}"),
            })?;
        let node = call.ctx.nodes.create_node(spec).await?;
        Ok(Some(Reply::new(
            "nodeCreated",
            json!({
                "nodeId": node.id(),
                "type": node.node_type(),
                "channels": node.list_channel(),
            }),
        )))
    }
}

/// Reserved; always answers `NOT_IMPLEMENTED`.
pub struct UpdateHandler;

#[async_trait]
impl MethodHandler for UpdateHandler {
    #[instrument(skip_all, fields(method = "nodeUpdate"))]
    async fn handle(&self, _params: Value, _call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        Err(RpcError::NotImplemented {
            method: "nodeUpdate".into(),
        })
    }
}

/// Removes a node; its channels go stale and their watchers are dropped.
pub struct RemoveHandler;

#[async_trait]
impl MethodHandler for RemoveHandler {
    #[instrument(skip_all, fields(method = "nodeRemove"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let id = NodeId::new(require_string_param(&params, "nodeId")?);
        let _ = call.ctx.nodes.remove_node(&id)?;
        Ok(Some(Reply::new("nodeRemoved", json!({ "nodeId": id }))))
    }
}

/// Runs the node type's migration hook.
pub struct MigrateHandler;

#[async_trait]
impl MethodHandler for MigrateHandler {
    #[instrument(skip_all, fields(method = "nodeMigrate"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let id = NodeId::new(require_string_param(&params, "nodeId")?);
        let replaced = call.ctx.nodes.migrate_node(&id).await?;
        Ok(Some(Reply::new(
            "nodeMigrated",
            json!({ "nodeId": id, "replaced": replaced }),
        )))
    }
}

/// Returns the channel ids owned by one node.
pub struct GetChannelListHandler;

#[async_trait]
impl MethodHandler for GetChannelListHandler {
    #[instrument(skip_all, fields(method = "nodeGetChannelList"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let id = NodeId::new(require_string_param(&params, "nodeId")?);
        let node = call.ctx.nodes.node(&id)?;
        Ok(Some(Reply::new(
            "nodeChannelList",
            json!({ "nodeId": id, "channelIds": node.list_channel() }),
        )))
    }
}
