//! Channel handlers: read, send, watch, unwatch.
//!
//! Channels are addressed by `channelId` or by `nodeId` + `channelName`.

use async_trait::async_trait;
use nodecast_core::NodeError;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::client::CHANNEL_UPDATE;
use crate::errors::RpcError;
use crate::handlers::{channel_target, require_param, resolve_channel};
use crate::registry::{Call, MethodHandler};
use crate::types::Reply;

/// Returns the channel's current value.
pub struct ReadHandler;

#[async_trait]
impl MethodHandler for ReadHandler {
    #[instrument(skip_all, fields(method = "nodeChannelRead"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let (id, channel) = resolve_channel(&params, call.ctx)?;
        Ok(Some(Reply::new(
            CHANNEL_UPDATE,
            json!({ "channelId": id, "data": channel.data() }),
        )))
    }
}

/// Sets the channel's value and broadcasts it. No acknowledgement.
pub struct SendHandler;

#[async_trait]
impl MethodHandler for SendHandler {
    #[instrument(skip_all, fields(method = "nodeChannelSend"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let data = require_param(&params, "data")?.clone();
        let (_, channel) = resolve_channel(&params, call.ctx)?;
        let exclude = call.ctx.echo_policy.exclusion(call.client.id());
        let report = channel.set(data, exclude);
        debug!(
            channel_id = %channel.id(),
            delivered = report.delivered,
            failed = report.failed,
            "channel updated by client"
        );
        Ok(None)
    }
}

/// Subscribes the caller. The current value is pushed as
/// `nodeChannelUpdate` with `requestId` = this request's id.
pub struct WatchHandler;

#[async_trait]
impl MethodHandler for WatchHandler {
    #[instrument(skip_all, fields(method = "nodeChannelWatch"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let (_, channel) = resolve_channel(&params, call.ctx)?;
        match call.client.watch(&channel, Some(call.id)) {
            Ok(added) => debug!(channel_id = %channel.id(), added, "watch"),
            // The client is going away; nobody is left to answer.
            Err(e) => debug!(channel_id = %channel.id(), error = %e, "watch on closed client"),
        }
        Ok(None)
    }
}

/// Unsubscribes the caller.
pub struct UnwatchHandler;

#[async_trait]
impl MethodHandler for UnwatchHandler {
    #[instrument(skip_all, fields(method = "nodeChannelUnwatch"))]
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let id = channel_target(&params)?;
        let channel = match call.ctx.nodes.channel(&id) {
            Ok(channel) => channel,
            Err(err @ NodeError::ChannelNotFound(_)) => {
                let _ = call.client.forget(&id);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        let was_watching = call.client.unwatch(&channel);
        Ok(Some(Reply::new(
            "nodeChannelUnwatched",
            json!({ "channelId": id, "wasWatching": was_watching }),
        )))
    }
}
