//! RPC handler modules and registration.

pub mod channel;
pub mod node;
pub mod server;

use std::sync::Arc;

use nodecast_core::{Channel, ChannelId, NodeId};
use serde_json::Value;

use crate::context::RpcContext;
use crate::errors::RpcError;
use crate::method::Method;
use crate::registry::MethodRegistry;

/// Register all RPC handlers with the registry.
pub fn register_all(registry: &mut MethodRegistry) {
    // Server
    registry.register(Method::ServerConnect, server::ServerConnectHandler);

    // Nodes
    registry.register(Method::NodeGetList, node::GetListHandler);
    registry.register(Method::NodeCreate, node::CreateHandler);
    registry.register(Method::NodeUpdate, node::UpdateHandler);
    registry.register(Method::NodeRemove, node::RemoveHandler);
    registry.register(Method::NodeMigrate, node::MigrateHandler);
    registry.register(Method::NodeGetChannelList, node::GetChannelListHandler);

    // Channels
    registry.register(Method::NodeChannelRead, channel::ReadHandler);
    registry.register(Method::NodeChannelSend, channel::SendHandler);
    registry.register(Method::NodeChannelWatch, channel::WatchHandler);
    registry.register(Method::NodeChannelUnwatch, channel::UnwatchHandler);
}

/// Extract a required parameter from the params object.
pub(crate) fn require_param<'a>(params: &'a Value, key: &str) -> Result<&'a Value, RpcError> {
    params.get(key).ok_or_else(|| RpcError::InvalidParams {
        message: format!("Missing required parameter: {key}"),
    })
}

/// Extract a required string parameter.
pub(crate) fn require_string_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    require_param(params, key)?
        .as_str()
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a string"),
        })
}

/// Extract an optional string parameter; present but not a string is an error.
pub(crate) fn opt_string_param<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, RpcError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a string"),
        }),
    }
}

/// Channel addressed by `channelId`, or by `nodeId` + `channelName`.
pub(crate) fn channel_target(params: &Value) -> Result<ChannelId, RpcError> {
    if let Some(id) = opt_string_param(params, "channelId")? {
        return Ok(ChannelId::new(id));
    }
    match (
        opt_string_param(params, "nodeId")?,
        opt_string_param(params, "channelName")?,
    ) {
        (Some(node), Some(name)) => Ok(ChannelId::scoped(&NodeId::new(node), name)),
        _ => Err(RpcError::InvalidParams {
            message: "Missing required parameter: channelId (or nodeId and channelName)".into(),
        }),
    }
}

/// Resolve the addressed channel to its live instance.
pub(crate) fn resolve_channel(
    params: &Value,
    ctx: &RpcContext,
) -> Result<(ChannelId, Arc<Channel>), RpcError> {
    let id = channel_target(params)?;
    let channel = ctx.nodes.channel(&id)?;
    Ok((id, channel))
}
